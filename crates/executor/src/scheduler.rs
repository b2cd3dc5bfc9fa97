use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::state::{StateId, StateTable};
use crate::translation::TranslationCache;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Nothing is left to run. Exploration is complete.
    #[error("no runnable state")]
    NoRunnableState,
}

/// Engine data a searcher may consult when selecting a state.
pub struct SearchContext<'a> {
    pub states: &'a StateTable,
    pub cache: &'a TranslationCache,
}

/// Ordering policy of the scheduler. A searcher only ever sees runnable states.
pub trait Searcher: fmt::Debug {
    fn name(&self) -> &'static str;

    fn select(&mut self, ctx: &SearchContext<'_>) -> Option<StateId>;

    fn add(&mut self, id: StateId);

    fn remove(&mut self, id: StateId);
}

/// Searcher selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPolicy {
    #[default]
    RoundRobin,
    DepthFirst,
    Random,
    Coverage,
}

impl SearchPolicy {
    pub fn build(self, seed: u64) -> Box<dyn Searcher> {
        match self {
            Self::RoundRobin => Box::<RoundRobinSearcher>::default(),
            Self::DepthFirst => Box::<DepthFirstSearcher>::default(),
            Self::Random => Box::new(RandomSearcher::new(seed)),
            Self::Coverage => Box::<CoverageSearcher>::default(),
        }
    }
}

/// Cycles through states in the order they became runnable.
#[derive(Debug, Clone, Default)]
pub struct RoundRobinSearcher {
    queue: VecDeque<StateId>,
}

impl Searcher for RoundRobinSearcher {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&mut self, _ctx: &SearchContext<'_>) -> Option<StateId> {
        let id = self.queue.pop_front()?;
        self.queue.push_back(id);
        Some(id)
    }

    fn add(&mut self, id: StateId) {
        self.queue.push_back(id);
    }

    fn remove(&mut self, id: StateId) {
        self.queue.retain(|&x| x != id);
    }
}

/// Runs the most recently added state first.
#[derive(Debug, Clone, Default)]
pub struct DepthFirstSearcher {
    stack: Vec<StateId>,
}

impl Searcher for DepthFirstSearcher {
    fn name(&self) -> &'static str {
        "depth-first"
    }

    fn select(&mut self, _ctx: &SearchContext<'_>) -> Option<StateId> {
        self.stack.last().copied()
    }

    fn add(&mut self, id: StateId) {
        self.stack.push(id);
    }

    fn remove(&mut self, id: StateId) {
        self.stack.retain(|&x| x != id);
    }
}

/// Selects uniformly at random from a seeded generator.
#[derive(Debug, Clone)]
pub struct RandomSearcher {
    states: Vec<StateId>,
    rng: StdRng,
}

impl RandomSearcher {
    pub fn new(seed: u64) -> Self {
        Self {
            states: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Searcher for RandomSearcher {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&mut self, _ctx: &SearchContext<'_>) -> Option<StateId> {
        if self.states.is_empty() {
            return None;
        }

        let index = self.rng.gen_range(0..self.states.len());
        Some(self.states[index])
    }

    fn add(&mut self, id: StateId) {
        self.states.push(id);
    }

    fn remove(&mut self, id: StateId) {
        self.states.retain(|&x| x != id);
    }
}

/// Prefers the state about to execute the least executed code.
#[derive(Debug, Clone, Default)]
pub struct CoverageSearcher {
    states: BTreeSet<StateId>,
}

impl Searcher for CoverageSearcher {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn select(&mut self, ctx: &SearchContext<'_>) -> Option<StateId> {
        self.states
            .iter()
            .filter_map(|&id| ctx.states.get(id))
            .min_by_key(|state| (ctx.cache.execution_count(state.pc()), state.id()))
            .map(|state| state.id())
    }

    fn add(&mut self, id: StateId) {
        self.states.insert(id);
    }

    fn remove(&mut self, id: StateId) {
        self.states.remove(&id);
    }
}

/// Fires every `period` ticks of a virtual clock. A zero period never fires.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    period: u64,
    next: u64,
}

impl PeriodicTimer {
    pub fn new(period: u64) -> Self {
        Self {
            period,
            next: period,
        }
    }

    pub fn poll(&mut self, now: u64) -> bool {
        if self.period == 0 || now < self.next {
            return false;
        }

        while self.next <= now {
            self.next += self.period;
        }

        true
    }
}

/// Tracks runnable and suspended states and selects the next state to run through a
/// [Searcher].
#[derive(Debug)]
pub struct Scheduler {
    searcher: Box<dyn Searcher>,
    runnable: BTreeSet<StateId>,
    suspended: BTreeSet<StateId>,
    zombies: Vec<StateId>,
    current: Option<StateId>,
}

impl Scheduler {
    pub fn new(searcher: Box<dyn Searcher>) -> Self {
        Self {
            searcher,
            runnable: BTreeSet::new(),
            suspended: BTreeSet::new(),
            zombies: Vec::new(),
            current: None,
        }
    }

    pub fn searcher_name(&self) -> &'static str {
        self.searcher.name()
    }

    /// Swap the ordering policy. Every runnable state is handed to the new policy.
    pub fn set_searcher(&mut self, mut searcher: Box<dyn Searcher>) {
        for &id in self.runnable.iter() {
            searcher.add(id);
        }

        debug!(from = self.searcher.name(), to = searcher.name(), "changed searcher");
        self.searcher = searcher;
    }

    pub fn add(&mut self, id: StateId) {
        if self.runnable.insert(id) {
            self.searcher.add(id);
        }
    }

    /// Remove a state from the runnable set without destroying it. Returns false if the state is
    /// not runnable.
    pub fn suspend(&mut self, id: StateId) -> bool {
        if !self.runnable.remove(&id) {
            return false;
        }

        self.searcher.remove(id);
        self.suspended.insert(id);
        trace!(state = %id, "suspended state");
        true
    }

    /// Make a suspended state runnable again. Returns false if the state is not suspended.
    pub fn resume(&mut self, id: StateId) -> bool {
        if !self.suspended.remove(&id) {
            return false;
        }

        self.runnable.insert(id);
        self.searcher.add(id);
        trace!(state = %id, "resumed state");
        true
    }

    /// Register a parked state that must not be scheduled until resumed.
    pub fn add_suspended(&mut self, id: StateId) {
        self.suspended.insert(id);
    }

    /// Remove a state from scheduling. It is purged before the next state switch completes.
    pub fn kill(&mut self, id: StateId) {
        if self.runnable.remove(&id) {
            self.searcher.remove(id);
        }
        self.suspended.remove(&id);
        if self.current == Some(id) {
            self.current = None;
        }
        self.zombies.push(id);
    }

    /// Drop a state from every scheduling structure without treating it as a zombie.
    pub fn forget(&mut self, id: StateId) {
        if self.runnable.remove(&id) {
            self.searcher.remove(id);
        }
        self.suspended.remove(&id);
        if self.current == Some(id) {
            self.current = None;
        }
    }

    pub fn take_zombies(&mut self) -> Vec<StateId> {
        std::mem::take(&mut self.zombies)
    }

    /// Replace a state that was split by the states it was split into.
    pub fn replace(&mut self, old: StateId, new: &[StateId]) {
        let was_current = self.current == Some(old);
        let was_suspended = self.suspended.contains(&old);
        self.forget(old);
        for &id in new {
            if was_suspended {
                self.suspended.insert(id);
            } else {
                self.add(id);
            }
        }

        if was_current {
            self.current = new.first().copied();
        }
    }

    /// Select the state to run next.
    pub fn select_next(&mut self, ctx: &SearchContext<'_>) -> Result<StateId> {
        if self.runnable.is_empty() {
            return Err(Error::NoRunnableState);
        }

        let selected = self
            .searcher
            .select(ctx)
            .filter(|id| self.runnable.contains(id))
            .or_else(|| self.runnable.first().copied())
            .ok_or(Error::NoRunnableState)?;

        Ok(selected)
    }

    pub fn current(&self) -> Option<StateId> {
        self.current
    }

    pub(crate) fn set_current(&mut self, current: Option<StateId>) {
        self.current = current;
    }

    pub fn is_runnable(&self, id: StateId) -> bool {
        self.runnable.contains(&id)
    }

    pub fn is_suspended(&self, id: StateId) -> bool {
        self.suspended.contains(&id)
    }

    pub fn runnable(&self) -> impl Iterator<Item = StateId> + '_ {
        self.runnable.iter().copied()
    }

    pub fn suspended(&self) -> impl Iterator<Item = StateId> + '_ {
        self.suspended.iter().copied()
    }

    pub fn runnable_count(&self) -> usize {
        self.runnable.len()
    }
}
