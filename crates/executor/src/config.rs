use serde::{Deserialize, Serialize};

use crate::balance::LoadMetric;
use crate::scheduler::SearchPolicy;

/// Engine configuration. Every field has a default so partial configurations can be loaded from
/// JSON with [EngineConfig::from_json].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifier of this worker. Used as the namespace of state and variable identifiers.
    pub worker_id: u16,

    /// Route every translation unit through the instrumented path.
    pub execute_always_instrumented: bool,

    /// Number of consecutive units a state may execute before control returns to the scheduler.
    /// Zero disables time slicing.
    pub state_switch_interval: u64,

    /// Period, in executed units, of the bookkeeping pass.
    pub bookkeeping_interval: u64,

    /// Period, in executed units, of the load balancing check. Zero disables load balancing.
    pub load_balance_period: u64,

    pub load_metric: LoadMetric,

    /// A worker exports states when its load exceeds a peer's load by this factor.
    pub overload_ratio: f64,

    /// Upper bound on the node count of any merged value or path condition.
    pub max_merge_nodes: usize,

    /// Granularity, in bytes, of dirty tracking.
    pub dirty_chunk_size: usize,

    /// Searcher used until another one is installed.
    pub searcher: SearchPolicy,

    /// Seed for the random searcher.
    pub searcher_seed: u64,

    /// Seed mixed into the stable hash used to partition states for export.
    pub split_hash_seed: u64,

    /// Maximum number of cached solver results. Zero disables caching.
    pub solver_cache_capacity: usize,

    /// Number of bookkeeping epochs a quarantined region must go unreferenced before release.
    pub quarantine_epochs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            execute_always_instrumented: false,
            state_switch_interval: 1000,
            bookkeeping_interval: 100,
            load_balance_period: 0,
            load_metric: LoadMetric::RunnableStates,
            overload_ratio: 2.0,
            max_merge_nodes: 4096,
            dirty_chunk_size: 64,
            searcher: SearchPolicy::RoundRobin,
            searcher_seed: 0,
            split_hash_seed: 0,
            solver_cache_capacity: 1024,
            quarantine_epochs: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
