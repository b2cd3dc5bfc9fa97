use std::collections::BTreeSet;

use symex_expr::{Expr, VariableAllocator, Width};
use tracing::{debug, info, warn};

use crate::balance::{self, Coordinator, LoadBalancer, WorkerId};
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, ExecResult, TerminationReason};
use crate::fork::{self, Concretization, ForkContext, ForkEngine, ForkOutcome, StatePair};
use crate::interrupt::{self, Interrupt, InterruptModel};
use crate::mem::{self, MemoryView, RegionStore};
use crate::observer::{ExecutionObserver, ForkEvent};
use crate::region::{self, Region, RegionId, RegionMode, RegionRegistry};
use crate::scheduler::{self, PeriodicTimer, Scheduler, SearchContext, Searcher};
use crate::snapshot::{self, StateSnapshot};
use crate::solver::{CachingSolver, Solver};
use crate::state::{ExecutionState, StateId, StateStatus, StateTable};
use crate::translation::{self, TranslationCache, Translator};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Region(#[from] region::Error),

    #[error(transparent)]
    Memory(#[from] mem::Error),

    #[error(transparent)]
    Fork(#[from] fork::Error),

    #[error(transparent)]
    Scheduler(#[from] scheduler::Error),

    #[error(transparent)]
    Translation(#[from] translation::Error),

    #[error(transparent)]
    Snapshot(#[from] snapshot::Error),

    #[error(transparent)]
    Interrupt(#[from] interrupt::Error),

    #[error("unknown state {0}")]
    UnknownState(StateId),

    #[error("the initial state was already created")]
    AlreadyStarted,

    #[error("no coordinator is attached")]
    NoCoordinator,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// How a call to [EngineContext::run] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No runnable state is left.
    Completed,

    /// The unit budget was exhausted with states left to run.
    UnitLimit,
}

/// Final view of a terminated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedState {
    pub id: StateId,
    pub reason: TerminationReason,
    pub pc: u64,
    pub registers: Vec<Expr>,
    pub path_condition: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub units: u64,
    pub state_switches: u64,
    pub bookkeeping_passes: u64,
    pub terminated: u64,
    pub interrupts_delivered: u64,
    pub released_regions: u64,
}

/// Owns every component of a worker: regions, states, scheduling, translation, the solver and the
/// collaborators. All operations are driven through this value.
pub struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) registry: RegionRegistry,
    pub(crate) states: StateTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) forks: ForkEngine,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) cache: TranslationCache,
    pub(crate) solver: Box<dyn Solver>,
    pub(crate) translator: Box<dyn Translator>,
    pub(crate) interrupts: Box<dyn InterruptModel>,
    pub(crate) observers: Vec<Box<dyn ExecutionObserver>>,
    pub(crate) coordinator: Option<Box<dyn Coordinator>>,
    pub(crate) balancer: LoadBalancer,
    pub(crate) variables: VariableAllocator,
    pub(crate) stats: EngineStats,
    clock: u64,
    epoch: u64,
    bookkeeping: PeriodicTimer,
    finished: Vec<FinishedState>,
    started: bool,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        translator: impl Translator + 'static,
        solver: impl Solver + 'static,
        interrupts: impl InterruptModel + 'static,
    ) -> Result<Self> {
        if config.dirty_chunk_size == 0 {
            return Err(Error::InvalidConfig("dirty chunk size must be positive".into()));
        }

        if !(config.overload_ratio >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "overload ratio {} must be at least 1",
                config.overload_ratio
            )));
        }

        info!(
            worker = config.worker_id,
            searcher = ?config.searcher,
            interrupts = interrupts.name(),
            "created engine"
        );

        Ok(Self {
            registry: RegionRegistry::new(config.dirty_chunk_size),
            states: StateTable::new(config.worker_id),
            scheduler: Scheduler::new(config.searcher.build(config.searcher_seed)),
            forks: ForkEngine::new(config.max_merge_nodes),
            dispatcher: Dispatcher::new(&config),
            cache: TranslationCache::new(),
            solver: Box::new(CachingSolver::new(solver, config.solver_cache_capacity)),
            translator: Box::new(translator),
            interrupts: Box::new(interrupts),
            observers: Vec::new(),
            coordinator: None,
            balancer: LoadBalancer::new(
                config.load_metric,
                config.overload_ratio,
                config.load_balance_period,
                config.split_hash_seed,
            ),
            variables: VariableAllocator::new(config.worker_id),
            stats: EngineStats::default(),
            clock: 0,
            epoch: 0,
            bookkeeping: PeriodicTimer::new(config.bookkeeping_interval),
            finished: Vec::new(),
            started: false,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker_id(&self) -> WorkerId {
        self.config.worker_id
    }

    pub fn add_observer(&mut self, observer: impl ExecutionObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn set_coordinator(&mut self, coordinator: impl Coordinator + 'static) {
        self.coordinator = Some(Box::new(coordinator));
    }

    pub fn set_searcher(&mut self, searcher: Box<dyn Searcher>) {
        self.scheduler.set_searcher(searcher);
    }

    pub fn set_breakpoint(&mut self, pc: u64) {
        self.dispatcher.set_breakpoint(pc);
    }

    pub fn clear_breakpoint(&mut self, pc: u64) -> bool {
        self.dispatcher.clear_breakpoint(pc)
    }

    /// Force code at `pc` through the instrumented path.
    pub fn set_instrumented(&mut self, pc: u64, instrumented: bool) {
        self.cache.set_instrumented(pc, instrumented);
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn state(&self, id: StateId) -> Option<&ExecutionState> {
        self.states.get(id)
    }

    pub fn translation_cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn fork_engine(&self) -> &ForkEngine {
        &self.forks
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Number of units executed so far. Drives every periodic timer.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// States that terminated, in order of termination.
    pub fn finished(&self) -> &[FinishedState] {
        &self.finished
    }

    pub fn current_state(&self) -> Option<StateId> {
        self.scheduler.current()
    }

    /// Allocate a fresh symbolic variable.
    pub fn fresh_symbolic(&mut self, name: impl Into<String>, width: Width) -> Expr {
        self.variables.fresh(name, width)
    }

    pub fn variables(&self) -> &VariableAllocator {
        &self.variables
    }

    /// Register a region. States that already exist receive a copy of per-state regions.
    pub fn register_region(
        &mut self,
        region: Region,
        mode: RegionMode,
        save_on_switch: bool,
    ) -> Result<RegionId> {
        let id = self.registry.register_region(region, mode, save_on_switch)?;
        if mode.is_per_state() {
            let bytes = self.registry.host(id).to_vec();
            let chunk_size = self.registry.chunk_size();
            for state in self.states.iter_mut() {
                if state.memory().store(id).is_none() {
                    state
                        .memory_mut()
                        .insert_store(id, RegionStore::from_bytes(&bytes, chunk_size));
                }
            }
        }

        self.refresh_fast_path();
        Ok(id)
    }

    /// Register a concrete buffer shared by every state.
    pub fn register_shared_external(
        &mut self,
        name: impl Into<String>,
        guest_address: u64,
        size: usize,
    ) -> Result<RegionId> {
        let id = self
            .registry
            .register_shared_external(name, guest_address, size)?;
        self.refresh_fast_path();
        Ok(id)
    }

    /// Stop accepting accesses to a region. States drop their copies of it, and the region is
    /// released during bookkeeping once no state references it.
    pub fn quarantine_region(&mut self, id: RegionId) -> Result<()> {
        self.registry.quarantine(id, self.epoch)?;
        let dropped = self
            .states
            .iter_mut()
            .filter_map(|state| state.memory_mut().remove_store(id))
            .count();
        debug!(region = %id, dropped, "dropped state copies of quarantined region");

        self.refresh_fast_path();
        Ok(())
    }

    /// Discard every cached translation. Units are translated again on their next execution.
    pub fn flush_translation_cache(&mut self) {
        self.cache.flush();
        info!("flushed translation cache");
    }

    fn refresh_fast_path(&mut self) {
        if let Some(state) = self
            .scheduler
            .current()
            .and_then(|id| self.states.get_mut(id))
        {
            self.registry.update_fast_path(state.memory_mut());
        }
    }

    /// Recompute the fast path regions of the state.
    pub fn update_fast_path(&mut self, id: StateId) -> Result<()> {
        let state = self.states.get_mut(id).ok_or(Error::UnknownState(id))?;
        self.registry.update_fast_path(state.memory_mut());
        Ok(())
    }

    /// Load bytes into guest memory. Before the initial state exists the bytes become the
    /// initial contents of the region; afterwards they are written to the current state.
    pub fn load(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        match self.scheduler.current() {
            None if self.states.is_empty() => Ok(self.registry.load(address, bytes)?),
            None => Err(Error::Scheduler(scheduler::Error::NoRunnableState)),
            Some(id) => self.with_memory(id, |memory| {
                for (i, &byte) in bytes.iter().enumerate() {
                    memory.write_byte(address + i as u64, byte.into())?;
                }
                Ok(())
            }),
        }
    }

    /// Create the first state of the exploration and make it current.
    pub fn create_initial_state(&mut self, pc: u64) -> Result<StateId> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }

        self.started = true;
        let memory = self.registry.initial_memory();
        let id = self.states.allocate_id();
        self.states.insert(ExecutionState::new(id, pc, memory));
        self.scheduler.add(id);
        self.switch_to(id);

        info!(state = %id, pc = format_args!("{pc:#x}"), "created initial state");
        Ok(id)
    }

    pub(crate) fn state_mut(&mut self, id: StateId) -> Result<&mut ExecutionState> {
        self.states.get_mut(id).ok_or(Error::UnknownState(id))
    }

    pub fn set_register(&mut self, id: StateId, index: usize, value: Expr) -> Result<()> {
        self.state_mut(id)?.set_register(index, value);
        Ok(())
    }

    pub fn set_pc(&mut self, id: StateId, pc: u64) -> Result<()> {
        self.state_mut(id)?.set_pc(pc);
        Ok(())
    }

    pub(crate) fn with_memory<T>(
        &mut self,
        id: StateId,
        f: impl FnOnce(&mut MemoryView<'_>) -> mem::Result<T>,
    ) -> Result<T> {
        let current = self.scheduler.current() == Some(id);
        let state = self.states.get_mut(id).ok_or(Error::UnknownState(id))?;
        let mut view = if current {
            MemoryView::current(&mut self.registry, state.memory_mut())
        } else {
            MemoryView::stored(&mut self.registry, state.memory_mut())
        };

        Ok(f(&mut view)?)
    }

    /// Read a little endian value of `size` bytes from the memory of a state.
    pub fn read_memory(&mut self, id: StateId, address: u64, size: usize) -> Result<Expr> {
        self.with_memory(id, |memory| memory.read(address, size))
    }

    pub fn write_memory(&mut self, id: StateId, address: u64, value: Expr, size: usize) -> Result<()> {
        self.with_memory(id, |memory| memory.write(address, value, size))
    }

    /// Concrete bytes and symbolic overlay of a region as seen by the state.
    pub fn region_bytes(&mut self, id: StateId, region: RegionId) -> Result<Vec<Expr>> {
        let entry = self.registry.get(region)?;
        let start = entry.region().guest_address;
        let size = entry.region().size;
        self.with_memory(id, |memory| {
            (0..size as u64)
                .map(|offset| memory.read_byte(start + offset))
                .collect()
        })
    }

    fn fork_context(&mut self) -> (ForkContext<'_>, &mut ForkEngine) {
        let current = self.scheduler.current();
        (
            ForkContext {
                states: &mut self.states,
                registry: &mut self.registry,
                solver: self.solver.as_mut(),
                current,
                parked: Vec::new(),
            },
            &mut self.forks,
        )
    }

    fn schedule_parked(&mut self, parked: Vec<StateId>) {
        for id in parked {
            self.scheduler.add_suspended(id);
        }
    }

    fn notify_fork(&mut self, parent: StateId, condition: Expr, states: Vec<StateId>) {
        if states.len() > 1 && states.iter().any(|&id| id != parent) {
            self.dispatcher.note_fork();
        }

        let event = ForkEvent {
            parent,
            condition,
            states,
        };
        for observer in self.observers.iter() {
            observer.on_fork(&event);
        }
    }

    /// Fork the state on a condition. See [ForkEngine::fork].
    pub fn fork(
        &mut self,
        id: StateId,
        condition: Expr,
        keep_true_in_current: bool,
    ) -> Result<StatePair> {
        let (mut ctx, forks) = self.fork_context();
        let result = forks.fork(&mut ctx, id, condition.clone(), keep_true_in_current);
        let parked = std::mem::take(&mut ctx.parked);
        self.schedule_parked(parked);

        let pair = result?;
        if pair.outcome == ForkOutcome::Split {
            let (kept, other) = if keep_true_in_current {
                (pair.true_state, pair.false_state)
            } else {
                (pair.false_state, pair.true_state)
            };
            self.scheduler.replace(pair.parent, &[kept, other]);
        }

        self.notify_fork(pair.parent, condition, vec![pair.true_state, pair.false_state]);
        Ok(pair)
    }

    /// Fork one state per feasible candidate value. See [ForkEngine::fork_values].
    pub fn fork_values(
        &mut self,
        id: StateId,
        expr: &Expr,
        candidates: &[u64],
    ) -> Result<Vec<StateId>> {
        let (mut ctx, forks) = self.fork_context();
        let result = forks.fork_values(&mut ctx, id, expr, candidates);
        let parked = std::mem::take(&mut ctx.parked);
        self.schedule_parked(parked);

        let states = result?;
        if states.first() != Some(&id) {
            self.scheduler.replace(id, &states);
        }

        self.notify_fork(id, expr.clone(), states.clone());
        Ok(states)
    }

    /// Pin an expression to one feasible value. See [ForkEngine::fork_and_concretize].
    pub fn fork_and_concretize(&mut self, id: StateId, expr: &Expr) -> Result<Concretization> {
        let (mut ctx, forks) = self.fork_context();
        let result = forks.fork_and_concretize(&mut ctx, id, expr);
        let parked = std::mem::take(&mut ctx.parked);
        self.schedule_parked(parked);

        let concretization = result?;
        if let Some(remainder) = concretization.remainder {
            self.scheduler
                .replace(concretization.parent, &[concretization.concrete, remainder]);
            let condition = expr
                .clone()
                .equals(Expr::constant(concretization.value, expr.width()));
            self.notify_fork(
                concretization.parent,
                condition,
                vec![concretization.concrete, remainder],
            );
        }

        Ok(concretization)
    }

    /// Merge `other` into `base`. On success `other` is removed from scheduling.
    pub fn merge(&mut self, base: StateId, other: StateId) -> Result<bool> {
        let (mut ctx, forks) = self.fork_context();
        let merged = forks.merge(&mut ctx, base, other)?;
        if merged {
            self.scheduler.kill(other);
        }

        Ok(merged)
    }

    /// Remove a runnable state from scheduling. Returns false if it is not runnable.
    pub fn suspend(&mut self, id: StateId) -> bool {
        if !self.scheduler.suspend(id) {
            return false;
        }

        if let Some(state) = self.states.get_mut(id) {
            state.set_status(StateStatus::Suspended);
        }
        true
    }

    /// Make a suspended state runnable. Returns false if it is not suspended.
    pub fn resume(&mut self, id: StateId) -> bool {
        if !self.scheduler.resume(id) {
            return false;
        }

        if let Some(state) = self.states.get_mut(id) {
            state.set_status(StateStatus::Active);
        }
        true
    }

    /// Mark the state as a zombie. It is destroyed before the next state switch completes.
    pub fn terminate_state(&mut self, id: StateId, reason: TerminationReason) -> bool {
        let Some(state) = self.states.get_mut(id) else {
            return false;
        };

        if state.is_zombie() {
            return false;
        }

        state.set_status(StateStatus::Zombie);
        self.finished.push(FinishedState {
            id,
            reason: reason.clone(),
            pc: state.pc(),
            registers: state.registers().to_vec(),
            path_condition: state.path_condition().to_vec(),
        });
        self.scheduler.kill(id);
        self.stats.terminated += 1;

        match &reason {
            TerminationReason::Halted => debug!(state = %id, "state halted"),
            reason => warn!(state = %id, ?reason, "state terminated"),
        }

        for observer in self.observers.iter() {
            observer.on_state_terminated(id, &reason);
        }

        true
    }

    fn purge_zombies(&mut self) {
        for id in self.scheduler.take_zombies() {
            if self.states.remove(id).is_some() {
                debug!(state = %id, "destroyed state");
            }
        }
    }

    fn switch_to(&mut self, id: StateId) {
        let from = self.scheduler.current();
        self.dispatcher.reset_time_slice();
        if from == Some(id) {
            return;
        }

        if let Some(outgoing) = from.and_then(|from| self.states.get_mut(from)) {
            self.registry.copy_out(outgoing.memory_mut());
        }

        if let Some(incoming) = self.states.get_mut(id) {
            self.registry.copy_in(incoming.memory_mut());
        }

        self.scheduler.set_current(Some(id));
        self.stats.state_switches += 1;
        debug!(?from, to = %id, "switched state");

        for observer in self.observers.iter() {
            observer.on_state_switch(from, id);
        }
    }

    /// Select the next state to run and make it current. Fails with
    /// [scheduler::Error::NoRunnableState] when exploration is complete.
    pub fn select_next(&mut self) -> Result<StateId> {
        self.purge_zombies();
        let ctx = SearchContext {
            states: &self.states,
            cache: &self.cache,
        };
        let id = self.scheduler.select_next(&ctx)?;
        self.switch_to(id);
        Ok(id)
    }

    /// Run until no state is runnable.
    pub fn run(&mut self) -> Result<RunOutcome> {
        self.run_for(u64::MAX)
    }

    /// Run until no state is runnable or `max_units` units were executed.
    pub fn run_for(&mut self, max_units: u64) -> Result<RunOutcome> {
        let limit = self.clock.saturating_add(max_units);
        while self.clock < limit {
            match self.select_next() {
                Ok(_) => self.run_current(limit)?,
                Err(Error::Scheduler(scheduler::Error::NoRunnableState)) => {
                    info!(
                        units = self.clock,
                        finished = self.finished.len(),
                        "exploration complete"
                    );
                    return Ok(RunOutcome::Completed);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(RunOutcome::UnitLimit)
    }

    /// Execute units of the current state until control must return to the scheduler.
    fn run_current(&mut self, limit: u64) -> Result<()> {
        loop {
            let result = self.execute_unit()?;
            self.clock += 1;
            self.stats.units += 1;

            let exit = match result {
                ExecResult::Continue => self
                    .scheduler
                    .current()
                    .map_or(true, |id| self.finalize_execution(id)),
                ExecResult::Exit(reason) => {
                    debug!(?reason, "left execution loop");
                    true
                }
                ExecResult::Terminated(reason) => {
                    if let Some(id) = self.scheduler.current() {
                        self.terminate_state(id, reason);
                    }
                    true
                }
            };

            self.tick()?;
            if exit || self.clock >= limit {
                return Ok(());
            }
        }
    }

    /// Periodic work between units.
    fn tick(&mut self) -> Result<()> {
        if self.bookkeeping.poll(self.clock) {
            self.bookkeeping_pass();
        }

        if self.coordinator.is_some() && self.balancer.is_due(self.clock) {
            self.balance_load()?;
        }

        Ok(())
    }

    /// Advance the epoch, release unreferenced quarantined regions and publish statistics.
    pub fn bookkeeping_pass(&mut self) {
        self.epoch += 1;
        self.stats.bookkeeping_passes += 1;

        let referenced = self
            .states
            .iter()
            .flat_map(|state| state.memory().region_ids())
            .collect::<BTreeSet<_>>();
        let released =
            self.registry
                .release_unreferenced(self.epoch, self.config.quarantine_epochs, &referenced);
        self.stats.released_regions += released.len() as u64;

        let load = self.balancer.load(&self.states, self.scheduler.runnable());
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.report_load(self.config.worker_id, load);
        }

        debug!(
            epoch = self.epoch,
            units = self.clock,
            states = self.states.len(),
            runnable = self.scheduler.runnable_count(),
            load,
            "bookkeeping"
        );
    }

    /// Queue an interrupt for the state. It is applied before the next unit the state executes.
    pub fn deliver_interrupt(&mut self, id: StateId, interrupt: Interrupt) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.is_zombie() {
            return Err(Error::UnknownState(id));
        }

        state.pending_interrupts.push_back(interrupt);
        Ok(())
    }

    /// Queue an interrupt for every live state that has not yet seen the event. Returns the
    /// number of states the interrupt was queued for.
    pub fn broadcast_interrupt(&mut self, event: u64, interrupt: Interrupt) -> usize {
        let interrupt = interrupt.with_event(event);
        let mut delivered = 0;
        for state in self.states.iter_mut().filter(|state| !state.is_zombie()) {
            if state.seen_events.insert(event) {
                state.pending_interrupts.push_back(interrupt.clone());
                delivered += 1;
            }
        }

        debug!(event, delivered, "broadcast interrupt");
        delivered
    }

    /// Compare the load with peers and export states to an underloaded peer. Returns the number
    /// of states exported. Does nothing if a balancing round is already running.
    pub fn balance_load(&mut self) -> Result<usize> {
        if !self.balancer.begin() {
            return Ok(0);
        }

        let result = self.balance_load_round();
        self.balancer.end();
        result
    }

    fn balance_load_round(&mut self) -> Result<usize> {
        self.import_states()?;

        let worker = self.config.worker_id;
        let load = self.balancer.load(&self.states, self.scheduler.runnable());
        let coordinator = self.coordinator.as_mut().ok_or(Error::NoCoordinator)?;
        coordinator.report_load(worker, load);
        let peers = coordinator.peer_loads(worker);

        let candidates = self.exportable_states();
        let Some(plan) = self.balancer.plan(load, candidates.len(), &peers) else {
            return Ok(0);
        };

        let partition = self.balancer.split_states(&candidates, plan.count);
        info!(
            load,
            peer = plan.peer,
            export = partition.export.len(),
            keep = partition.keep.len(),
            "worker overloaded"
        );
        self.export_states(plan.peer, &partition.export)
    }

    /// Runnable states that may leave this worker.
    pub fn exportable_states(&self) -> Vec<StateId> {
        let current = self.scheduler.current();
        self.scheduler
            .runnable()
            .filter(|&id| Some(id) != current)
            .filter(|&id| self.states.get(id).is_some_and(|s| !s.is_mid_unit()))
            .collect()
    }

    /// Send states to a peer under freshly allocated global identifiers and remove them locally.
    /// Every state is serialized before any is removed, so on error nothing leaves this worker.
    pub fn export_states(&mut self, peer: WorkerId, ids: &[StateId]) -> Result<usize> {
        let current = self.scheduler.current();
        let mut selected = Vec::with_capacity(ids.len());
        for &id in ids {
            if Some(id) == current || selected.contains(&id) {
                continue;
            }

            match self.states.get(id) {
                Some(state) if !state.is_zombie() => selected.push(id),
                _ => return Err(Error::UnknownState(id)),
            }
        }

        let coordinator = self.coordinator.as_mut().ok_or(Error::NoCoordinator)?;
        let new_ids = balance::compute_new_state_ids(coordinator.as_mut(), selected.len());

        let mut payload = Vec::with_capacity(selected.len());
        for (&id, &new_id) in selected.iter().zip(new_ids.iter()) {
            let state = self.states.get(id).ok_or(Error::UnknownState(id))?;
            let mut snapshot = StateSnapshot::capture(state, &self.registry)?;
            snapshot.parent = Some(id);
            snapshot.id = new_id;
            payload.push(snapshot.to_bytes()?);
        }

        let exported = payload.len();
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.export(self.config.worker_id, peer, payload);
        }

        for (&id, &new_id) in selected.iter().zip(new_ids.iter()) {
            self.scheduler.forget(id);
            self.states.remove(id);
            info!(state = %id, as_state = %new_id, peer, "exported state");
        }

        self.balancer.stats_mut().exported += exported as u64;
        Ok(exported)
    }

    /// Register every state a peer sent to this worker as runnable.
    pub fn import_states(&mut self) -> Result<Vec<StateId>> {
        let worker = self.config.worker_id;
        let Some(coordinator) = self.coordinator.as_mut() else {
            return Ok(Vec::new());
        };

        let mut imported = Vec::new();
        for bytes in coordinator.import(worker) {
            let restored = StateSnapshot::from_bytes(&bytes)
                .and_then(|snapshot| snapshot.restore(&self.registry));
            let state = match restored {
                Ok(state) => state,
                Err(err) => {
                    warn!(%err, "dropping unreadable imported state");
                    continue;
                }
            };
            let id = state.id();
            if self.states.contains(id) || self.states.is_retired(id) {
                warn!(state = %id, "ignoring duplicate imported state");
                continue;
            }

            self.states.insert(state);
            self.scheduler.add(id);
            imported.push(id);
            info!(state = %id, "imported state");
        }

        self.balancer.stats_mut().imported += imported.len() as u64;
        Ok(imported)
    }
}
