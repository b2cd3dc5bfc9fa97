use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::scheduler::PeriodicTimer;
use crate::state::{StateId, StateIdAllocator, StateTable, MIGRATION_PREFIX};

pub type WorkerId = u16;

/// How the load of a worker is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMetric {
    /// Number of runnable states.
    #[default]
    RunnableStates,

    /// Sum over runnable states of one plus the fork depth of the state.
    WeightedDepth,
}

/// The inter-worker coordination channel.
pub trait Coordinator {
    /// Publish the load of this worker.
    fn report_load(&mut self, worker: WorkerId, load: f64);

    /// Last known load of every other worker.
    fn peer_loads(&self, worker: WorkerId) -> Vec<(WorkerId, f64)>;

    /// Allocate identifiers that are unique across every worker.
    fn allocate_state_ids(&mut self, count: usize) -> Vec<StateId>;

    /// Hand serialized states to a peer.
    fn export(&mut self, from: WorkerId, to: WorkerId, snapshots: Vec<Vec<u8>>);

    /// Take every serialized state sent to this worker.
    fn import(&mut self, worker: WorkerId) -> Vec<Vec<u8>>;
}

#[derive(Debug)]
struct Hub {
    loads: BTreeMap<WorkerId, f64>,
    mailboxes: BTreeMap<WorkerId, Vec<Vec<u8>>>,
    ids: StateIdAllocator,
}

/// Coordinator connecting workers that live in the same process. Clones share one hub.
#[derive(Debug, Clone)]
pub struct InMemoryCoordinator {
    hub: Rc<RefCell<Hub>>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub {
                loads: BTreeMap::new(),
                mailboxes: BTreeMap::new(),
                ids: StateIdAllocator::new(MIGRATION_PREFIX),
            })),
        }
    }

    /// Number of serialized states waiting for the worker.
    pub fn pending(&self, worker: WorkerId) -> usize {
        self.hub
            .borrow()
            .mailboxes
            .get(&worker)
            .map(Vec::len)
            .unwrap_or_default()
    }
}

impl Coordinator for InMemoryCoordinator {
    fn report_load(&mut self, worker: WorkerId, load: f64) {
        self.hub.borrow_mut().loads.insert(worker, load);
    }

    fn peer_loads(&self, worker: WorkerId) -> Vec<(WorkerId, f64)> {
        self.hub
            .borrow()
            .loads
            .iter()
            .filter(|(&peer, _)| peer != worker)
            .map(|(&peer, &load)| (peer, load))
            .collect()
    }

    fn allocate_state_ids(&mut self, count: usize) -> Vec<StateId> {
        let mut hub = self.hub.borrow_mut();
        (0..count).map(|_| hub.ids.allocate()).collect()
    }

    fn export(&mut self, _from: WorkerId, to: WorkerId, snapshots: Vec<Vec<u8>>) {
        self.hub
            .borrow_mut()
            .mailboxes
            .entry(to)
            .or_default()
            .extend(snapshots);
    }

    fn import(&mut self, worker: WorkerId) -> Vec<Vec<u8>> {
        self.hub
            .borrow_mut()
            .mailboxes
            .remove(&worker)
            .unwrap_or_default()
    }
}

/// Partition of the exportable states of a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePartition {
    pub keep: Vec<StateId>,
    pub export: Vec<StateId>,
}

/// Decision to move states to a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportPlan {
    pub peer: WorkerId,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceStats {
    pub rounds: u64,
    pub exported: u64,
    pub imported: u64,
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Deterministically partition `candidates`, exporting `export_count` of them. The partition only
/// depends on the set of candidates, the count and the seed.
pub fn split_states(candidates: &[StateId], export_count: usize, seed: u64) -> StatePartition {
    let mut ordered = candidates.to_vec();
    ordered.sort_by_key(|id| (splitmix64(id.get() ^ seed), *id));
    ordered.dedup();

    let export_count = export_count.min(ordered.len());
    let keep = ordered.split_off(export_count);
    StatePartition {
        keep,
        export: ordered,
    }
}

/// Periodically compares this worker's load with its peers and decides how many states to
/// export.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    metric: LoadMetric,
    overload_ratio: f64,
    seed: u64,
    timer: PeriodicTimer,
    in_progress: bool,
    stats: BalanceStats,
}

impl LoadBalancer {
    pub fn new(metric: LoadMetric, overload_ratio: f64, period: u64, seed: u64) -> Self {
        Self {
            metric,
            overload_ratio,
            seed,
            timer: PeriodicTimer::new(period),
            in_progress: false,
            stats: Default::default(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> BalanceStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut BalanceStats {
        &mut self.stats
    }

    /// True if the balancing period elapsed at virtual time `now`.
    pub fn is_due(&mut self, now: u64) -> bool {
        self.timer.poll(now)
    }

    pub fn is_load_balancing(&self) -> bool {
        self.in_progress
    }

    /// Mark the start of a balancing round. Returns false if a round is already running.
    pub(crate) fn begin(&mut self) -> bool {
        if self.in_progress {
            return false;
        }

        self.in_progress = true;
        self.stats.rounds += 1;
        true
    }

    pub(crate) fn end(&mut self) {
        self.in_progress = false;
    }

    pub fn load(&self, states: &StateTable, runnable: impl Iterator<Item = StateId>) -> f64 {
        match self.metric {
            LoadMetric::RunnableStates => runnable.count() as f64,
            LoadMetric::WeightedDepth => runnable
                .filter_map(|id| states.get(id))
                .map(|state| 1.0 + state.depth() as f64)
                .sum(),
        }
    }

    /// Decide whether to export states to the least loaded peer. `candidates` is the number of
    /// states that may be exported.
    pub fn plan(&self, load: f64, candidates: usize, peers: &[(WorkerId, f64)]) -> Option<ExportPlan> {
        let &(peer, peer_load) = peers
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))?;

        if load <= 0.0 || load <= peer_load * self.overload_ratio || load <= peer_load {
            return None;
        }

        // Move half of the load difference
        let share = (load - peer_load) / (2.0 * load);
        let count = (candidates as f64 * share).floor() as usize;
        (count > 0).then_some(ExportPlan { peer, count })
    }

    pub fn split_states(&self, candidates: &[StateId], export_count: usize) -> StatePartition {
        split_states(candidates, export_count, self.seed)
    }
}

/// Obtain globally unique identifiers for states about to migrate.
pub fn compute_new_state_ids(coordinator: &mut dyn Coordinator, count: usize) -> Vec<StateId> {
    coordinator.allocate_state_ids(count)
}
