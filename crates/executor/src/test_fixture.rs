use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use symex_expr::{BinaryOp, CompareOp, Expr, VariableAllocator, VariableAssignments, VariableId};

use crate::config::EngineConfig;
use crate::dispatch::TerminationReason;
use crate::engine::EngineContext;
use crate::interrupt::X86InterruptModel;
use crate::observer::{ExecutionObserver, ForkEvent};
use crate::region::{Region, RegionId, RegionMode};
use crate::solver::{EnumeratingSolver, Query, SatResult, Solver};
use crate::state::StateId;
use crate::translation::{self, Operand, Place, Translation, Translator, UnitOp};

pub const RAM_BASE: u64 = 0x1000;
pub const RAM_SIZE: usize = 0x1000;
pub const IDT_BASE: u64 = 0x1000;
pub const STACK_TOP: u64 = 0x1f00;

/// Translator returning pre-built translations by address.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTranslator {
    units: BTreeMap<u64, Translation>,
}

impl ScriptedTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unit with a native entry.
    pub fn unit(mut self, pc: u64, size: u64, ops: Vec<UnitOp>) -> Self {
        self.units.insert(pc, Translation::interpreted(pc, size, ops));
        self
    }

    /// Unit that can only execute on the instrumented path.
    pub fn instrumented_unit(mut self, pc: u64, size: u64, ops: Vec<UnitOp>) -> Self {
        self.units
            .insert(pc, Translation::instrumented_only(size, ops));
        self
    }
}

impl Translator for ScriptedTranslator {
    fn translate(&mut self, pc: u64) -> translation::Result<Translation> {
        self.units
            .get(&pc)
            .cloned()
            .ok_or_else(|| translation::Error::Untranslatable {
                pc,
                reason: "no scripted unit".into(),
            })
    }
}

/// Solver that reports [SatResult::Unknown] for queries whose extra constraint is one of the
/// given expressions or mentions one of the given variables.
#[derive(Debug, Clone, Default)]
pub struct UndecidedSolver {
    inner: EnumeratingSolver,
    exprs: Vec<Expr>,
    variables: Vec<VariableId>,
}

impl UndecidedSolver {
    pub fn exprs(exprs: Vec<Expr>) -> Self {
        Self {
            exprs,
            ..Default::default()
        }
    }

    pub fn variables(variables: Vec<VariableId>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    fn is_undecided(&self, query: Query<'_>) -> bool {
        query.extra.is_some_and(|extra| {
            self.exprs.contains(extra)
                || extra
                    .variables()
                    .keys()
                    .any(|variable| self.variables.contains(variable))
        })
    }
}

impl Solver for UndecidedSolver {
    fn check(&mut self, query: Query<'_>) -> SatResult {
        if self.is_undecided(query) {
            return SatResult::Unknown;
        }

        self.inner.check(query)
    }

    fn model(&mut self, query: Query<'_>) -> Option<VariableAssignments> {
        if self.is_undecided(query) {
            return None;
        }

        self.inner.model(query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Fork(ForkEvent),
    Switch(Option<StateId>, StateId),
    Terminated(StateId, TerminationReason),
}

/// Observer recording every notification. Clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Rc<RefCell<Vec<Event>>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn forks(&self) -> Vec<ForkEvent> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Fork(fork) => Some(fork.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn terminated(&self) -> Vec<(StateId, TerminationReason)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Terminated(id, reason) => Some((*id, reason.clone())),
                _ => None,
            })
            .collect()
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_fork(&self, event: &ForkEvent) {
        self.events.borrow_mut().push(Event::Fork(event.clone()));
    }

    fn on_state_switch(&self, from: Option<StateId>, to: StateId) {
        self.events.borrow_mut().push(Event::Switch(from, to));
    }

    fn on_state_terminated(&self, state: StateId, reason: &TerminationReason) {
        self.events
            .borrow_mut()
            .push(Event::Terminated(state, reason.clone()));
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        dirty_chunk_size: 16,
        ..Default::default()
    }
}

pub fn engine_with(
    config: EngineConfig,
    translator: ScriptedTranslator,
    solver: impl Solver + 'static,
) -> EngineContext {
    EngineContext::new(config, translator, solver, X86InterruptModel::new(IDT_BASE))
        .expect("valid configuration")
}

pub fn engine(translator: ScriptedTranslator) -> EngineContext {
    engine_with(config(), translator, EnumeratingSolver::default())
}

/// Register the dirty tracked RAM region used by most tests.
pub fn add_ram(engine: &mut EngineContext) -> RegionId {
    engine
        .register_region(
            Region::ram("ram", RAM_BASE, RAM_SIZE),
            RegionMode::DirtyTracked,
            true,
        )
        .expect("ram registers")
}

pub fn symbol(engine: &mut EngineContext, name: &str, width: u32) -> Expr {
    engine.fresh_symbolic(name, width)
}

pub fn imm(value: u64) -> Operand {
    Operand::Imm(value)
}

pub fn reg(index: usize) -> Operand {
    Operand::Reg(index)
}

pub fn copy(dst: usize, src: Operand) -> UnitOp {
    UnitOp::Copy {
        dst: Place::Reg(dst),
        src,
    }
}

pub fn add(dst: usize, lhs: Operand, rhs: Operand) -> UnitOp {
    UnitOp::Binary {
        op: BinaryOp::Add,
        dst: Place::Reg(dst),
        lhs,
        rhs,
    }
}

pub fn compare(op: CompareOp, dst: usize, lhs: Operand, rhs: Operand) -> UnitOp {
    UnitOp::Compare {
        op,
        dst: Place::Reg(dst),
        lhs,
        rhs,
    }
}

pub fn load(dst: usize, address: Operand, size: usize) -> UnitOp {
    UnitOp::Load {
        dst: Place::Reg(dst),
        address,
        size,
    }
}

pub fn store(address: Operand, value: Operand, size: usize) -> UnitOp {
    UnitOp::Store {
        address,
        value,
        size,
    }
}

pub fn branch(condition: Operand, target: u64) -> UnitOp {
    UnitOp::Branch { condition, target }
}

pub fn make_symbolic(dst: usize, name: &str, width: u32) -> UnitOp {
    UnitOp::MakeSymbolic {
        dst: Place::Reg(dst),
        name: name.into(),
        width,
    }
}

/// The `n`th variable the engine of worker 0 will allocate.
pub fn predicted_variable(n: usize, width: u32) -> Expr {
    let mut allocator = VariableAllocator::new(0);
    let mut variable = allocator.fresh("x", width);
    for _ in 0..n {
        variable = allocator.fresh("x", width);
    }
    variable
}
