use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use symex_expr::{Expr, VariableId};

use crate::interrupt::Interrupt;
use crate::mem::StateMemory;
use crate::translation::TranslationUnit;

/// Number of general purpose registers in the register file.
pub const REGISTER_COUNT: usize = 16;

/// Width in bits of every register.
pub const REGISTER_WIDTH: u32 = 64;

/// Identifier prefix reserved for identifiers handed out by a coordinator to migrating states.
pub const MIGRATION_PREFIX: u16 = u16::MAX;

const SEQUENCE_BITS: u32 = 48;

/// Process-unique identifier of an execution state. The upper bits hold the prefix of the
/// allocator that assigned the identifier so identifiers from different workers never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(u64);

impl StateId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    pub const fn prefix(&self) -> u16 {
        (self.0 >> SEQUENCE_BITS) as u16
    }

    pub const fn sequence(&self) -> u64 {
        self.0 & ((1 << SEQUENCE_BITS) - 1)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}:{}", self.prefix(), self.sequence())
    }
}

/// Monotonic allocator of [StateId]s. Identifiers are never reused.
#[derive(Debug, Clone)]
pub struct StateIdAllocator {
    prefix: u16,
    next: u64,
}

impl StateIdAllocator {
    pub fn new(prefix: u16) -> Self {
        Self { prefix, next: 0 }
    }

    pub fn allocate(&mut self) -> StateId {
        let sequence = self.next;
        self.next += 1;
        assert!(sequence < 1 << SEQUENCE_BITS, "state identifiers exhausted");
        StateId((u64::from(self.prefix) << SEQUENCE_BITS) | sequence)
    }

    pub fn allocated(&self) -> u64 {
        self.next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateStatus {
    Active,
    Suspended,
    /// Pending deletion. A zombie is never scheduled or forked again.
    Zombie,
}

/// Position within a translation unit for a state that stopped executing mid-unit.
#[derive(Debug, Clone)]
pub struct UnitCursor {
    pub unit: Arc<TranslationUnit>,
    pub next_op: usize,
}

/// One execution path.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    id: StateId,
    parent: Option<StateId>,
    status: StateStatus,
    registers: Vec<Expr>,
    pc: u64,
    memory: StateMemory,
    path_condition: Vec<Expr>,
    depth: u64,
    halted: bool,
    pub(crate) pending_interrupts: VecDeque<Interrupt>,
    pub(crate) seen_events: BTreeSet<u64>,
    pub(crate) cursor: Option<UnitCursor>,
    pub(crate) temps: BTreeMap<u32, Expr>,
}

impl ExecutionState {
    pub fn new(id: StateId, pc: u64, memory: StateMemory) -> Self {
        Self {
            id,
            parent: None,
            status: StateStatus::Active,
            registers: vec![Expr::constant(0, REGISTER_WIDTH); REGISTER_COUNT],
            pc,
            memory,
            path_condition: Vec::new(),
            depth: 0,
            halted: false,
            pending_interrupts: VecDeque::new(),
            seen_events: BTreeSet::new(),
            cursor: None,
            temps: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn parent(&self) -> Option<StateId> {
        self.parent
    }

    pub fn status(&self) -> StateStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: StateStatus) {
        self.status = status;
    }

    pub fn is_zombie(&self) -> bool {
        self.status == StateStatus::Zombie
    }

    pub fn register(&self, index: usize) -> &Expr {
        &self.registers[index]
    }

    pub fn registers(&self) -> &[Expr] {
        &self.registers
    }

    pub fn set_register(&mut self, index: usize, value: Expr) {
        self.registers[index] = value.resize(REGISTER_WIDTH);
    }

    /// True when no register holds a symbolic value.
    pub fn registers_concrete(&self) -> bool {
        self.registers.iter().all(Expr::is_constant)
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    pub fn memory(&self) -> &StateMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut StateMemory {
        &mut self.memory
    }

    /// Ordered conjunction of constraints accumulated along this path.
    pub fn path_condition(&self) -> &[Expr] {
        &self.path_condition
    }

    pub(crate) fn add_constraint(&mut self, constraint: Expr) {
        self.path_condition.push(constraint);
    }

    pub(crate) fn set_path_condition(&mut self, path_condition: Vec<Expr>) {
        self.path_condition = path_condition;
    }

    /// Number of forks along this path.
    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    /// Disjoint mutable access to the register file, program counter and memory.
    pub(crate) fn cpu_mut(&mut self) -> (&mut [Expr], &mut u64, &mut StateMemory) {
        (&mut self.registers, &mut self.pc, &mut self.memory)
    }

    pub fn pending_interrupts(&self) -> impl Iterator<Item = &Interrupt> {
        self.pending_interrupts.iter()
    }

    /// True if the state stopped in the middle of a translation unit.
    pub fn is_mid_unit(&self) -> bool {
        self.cursor.is_some()
    }

    /// Clone this state as one side of a fork. Both sides receive fresh identifiers so the
    /// identifier of the forked state is retired.
    pub(crate) fn fork_clone(&self, id: StateId) -> Self {
        let mut clone = self.clone();
        clone.id = id;
        clone.parent = Some(self.id);
        clone
    }

    pub(crate) fn reassign(&mut self, id: StateId) {
        self.parent = Some(self.id);
        self.id = id;
    }

    pub(crate) fn increment_depth(&mut self) {
        self.depth += 1;
    }

    /// Replace variables with concrete values everywhere in the state.
    pub(crate) fn substitute(&mut self, values: &BTreeMap<VariableId, u64>) {
        let substitute = |expr: &Expr| expr.substitute(values);
        self.registers.iter_mut().for_each(|r| *r = substitute(&*r));
        self.temps.values_mut().for_each(|t| *t = substitute(&*t));

        // Constraints that became trivially true are dropped
        self.path_condition = self
            .path_condition
            .iter()
            .map(substitute)
            .filter(|c| !c.is_true())
            .collect();

        for (_, store) in self.memory.stores_mut() {
            store.map_symbolic(substitute);
        }
    }

    pub(crate) fn from_parts(parts: StateParts) -> Self {
        Self {
            id: parts.id,
            parent: parts.parent,
            status: StateStatus::Active,
            registers: parts.registers,
            pc: parts.pc,
            memory: parts.memory,
            path_condition: parts.path_condition,
            depth: parts.depth,
            halted: false,
            pending_interrupts: parts.pending_interrupts.into(),
            seen_events: parts.seen_events,
            cursor: None,
            temps: BTreeMap::new(),
        }
    }
}

pub(crate) struct StateParts {
    pub id: StateId,
    pub parent: Option<StateId>,
    pub registers: Vec<Expr>,
    pub pc: u64,
    pub memory: StateMemory,
    pub path_condition: Vec<Expr>,
    pub depth: u64,
    pub pending_interrupts: Vec<Interrupt>,
    pub seen_events: BTreeSet<u64>,
}

/// Owner of every execution state of a worker.
#[derive(Debug, Clone)]
pub struct StateTable {
    states: BTreeMap<StateId, ExecutionState>,
    ids: StateIdAllocator,
    retired: BTreeSet<StateId>,
}

impl StateTable {
    pub fn new(worker_id: u16) -> Self {
        Self {
            states: BTreeMap::new(),
            ids: StateIdAllocator::new(worker_id),
            retired: BTreeSet::new(),
        }
    }

    pub fn allocate_id(&mut self) -> StateId {
        self.ids.allocate()
    }

    pub fn get(&self, id: StateId) -> Option<&ExecutionState> {
        self.states.get(&id)
    }

    pub fn get_mut(&mut self, id: StateId) -> Option<&mut ExecutionState> {
        self.states.get_mut(&id)
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.states.contains_key(&id)
    }

    pub fn insert(&mut self, state: ExecutionState) {
        debug_assert!(!self.retired.contains(&state.id()), "state identifier reused");
        self.states.insert(state.id(), state);
    }

    pub fn remove(&mut self, id: StateId) -> Option<ExecutionState> {
        let state = self.states.remove(&id)?;
        self.retired.insert(id);
        Some(state)
    }

    /// Re-key a state under a new identifier, retiring the old one.
    pub(crate) fn rekey(&mut self, old: StateId, new: StateId) -> bool {
        let Some(mut state) = self.states.remove(&old) else {
            return false;
        };

        state.reassign(new);
        self.retired.insert(old);
        self.states.insert(new, state);
        true
    }

    /// True if the identifier was used by a state that has since been removed.
    pub fn is_retired(&self, id: StateId) -> bool {
        self.retired.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionState> {
        self.states.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExecutionState> {
        self.states.values_mut()
    }
}
