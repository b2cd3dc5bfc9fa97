//! Path exploration core of a symbolic execution engine for translated guest code.
//!
//! An [EngineContext] owns the execution states of one worker. States are selected by a
//! [Scheduler](scheduler::Scheduler), run one translation unit at a time by the dispatcher, split
//! on symbolic branches by the [ForkEngine](fork::ForkEngine) and, when several workers
//! cooperate, migrated between workers by the [LoadBalancer](balance::LoadBalancer).
//!
//! Guest memory is described by a [RegionRegistry](region::RegionRegistry). Each region is either
//! shared by every state or owned per state, in which case states share unmodified chunks and
//! the bytes of the current state are kept in host buffers for native execution.

/// Distribution of states across cooperating workers.
pub mod balance;
pub mod config;

/// Execution of translation units on the native or instrumented path.
pub mod dispatch;
pub mod engine;

/// Forking, concretization and merging of states.
pub mod fork;
pub mod interrupt;

/// Per-state storage of guest memory and the views used to access it.
pub mod mem;
pub mod observer;

/// Registration and lifecycle of guest memory regions.
pub mod region;
pub mod scheduler;
pub mod snapshot;

/// Constraint solver interface.
pub mod solver;
pub mod state;
pub mod translation;

pub use crate::config::EngineConfig;
pub use crate::dispatch::{ExitReason, TerminationReason};
pub use crate::engine::{EngineContext, Error, FinishedState, Result, RunOutcome};
pub use crate::state::{ExecutionState, StateId};

#[cfg(test)]
mod test_fixture;

#[cfg(test)]
mod tests;
