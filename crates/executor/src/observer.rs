use symex_expr::Expr;

use crate::dispatch::TerminationReason;
use crate::state::StateId;

/// A completed fork. For a two way fork `states` holds the true and false states in that
/// order; both are the forked state when no split occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkEvent {
    pub parent: StateId,
    pub condition: Expr,
    pub states: Vec<StateId>,
}

/// Telemetry hook. Observers are notified after the fact and cannot affect execution.
pub trait ExecutionObserver {
    fn on_fork(&self, _event: &ForkEvent) {}

    fn on_state_switch(&self, _from: Option<StateId>, _to: StateId) {}

    fn on_state_terminated(&self, _state: StateId, _reason: &TerminationReason) {}
}
