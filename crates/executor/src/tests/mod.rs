mod dispatch;
mod fork;
