use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use symex_expr::Expr;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::engine::{EngineContext, Error, Result};
use crate::fork;
use crate::interrupt::InterruptContext;
use crate::mem::MemoryView;
use crate::state::{ExecutionState, StateId, StateStatus, UnitCursor, REGISTER_COUNT, REGISTER_WIDTH};
use crate::translation::{ConcreteCpu, NativeExit, Operand, Place, TranslationUnit, UnitOp};

/// Why control returned to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The current state was split or replaced.
    Forked,
    Suspended,
    Halted,
    Breakpoint(u64),
    TimeSlice,

    /// Guest code changed under the unit that just executed.
    StaleUnit,
    Terminated,
}

/// Why a state stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Halted,
    UnsatisfiablePath,
    NoSatisfiableValue,

    /// Execution could not continue, for example on an access to unmapped memory.
    Fault(String),
}

/// Result of executing one translation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecResult {
    Continue,
    Exit(ExitReason),
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub native_units: u64,
    pub instrumented_units: u64,
    pub fallbacks: u64,
    pub interrupts: u64,
}

/// Per-worker execution loop settings and bookkeeping.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    breakpoints: BTreeSet<u64>,
    always_instrumented: bool,
    slice_length: u64,
    slice_used: u64,
    forked: bool,
    last_unit: Option<Arc<TranslationUnit>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            breakpoints: BTreeSet::new(),
            always_instrumented: config.execute_always_instrumented,
            slice_length: config.state_switch_interval,
            slice_used: 0,
            forked: false,
            last_unit: None,
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn set_breakpoint(&mut self, pc: u64) {
        self.breakpoints.insert(pc);
    }

    pub fn clear_breakpoint(&mut self, pc: u64) -> bool {
        self.breakpoints.remove(&pc)
    }

    pub fn is_always_instrumented(&self) -> bool {
        self.always_instrumented
    }

    pub(crate) fn reset_time_slice(&mut self) {
        self.slice_used = 0;
    }

    pub(crate) fn note_fork(&mut self) {
        self.forked = true;
    }

    fn begin_unit(&mut self) {
        self.forked = false;
        self.last_unit = None;
        self.slice_used += 1;
    }

    fn time_slice_expired(&self) -> bool {
        self.slice_length > 0 && self.slice_used >= self.slice_length
    }
}

/// Execution scope of one translation unit. Transient per-unit data of the current state is
/// cleaned up when the scope ends, on every exit path.
pub(crate) struct UnitScope<'a> {
    engine: &'a mut EngineContext,
}

impl<'a> UnitScope<'a> {
    pub(crate) fn new(engine: &'a mut EngineContext) -> Self {
        Self { engine }
    }
}

impl Deref for UnitScope<'_> {
    type Target = EngineContext;

    fn deref(&self) -> &Self::Target {
        self.engine
    }
}

impl DerefMut for UnitScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine
    }
}

impl Drop for UnitScope<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.engine.scheduler.current() {
            self.engine.cleanup(id);
        }
    }
}

fn operand(state: &ExecutionState, operand: Operand) -> Expr {
    match operand {
        Operand::Reg(r) => state.register(r).clone(),
        Operand::Temp(t) => state
            .temps
            .get(&t)
            .cloned()
            .unwrap_or_else(|| Expr::constant(0, REGISTER_WIDTH)),
        Operand::Imm(value) => Expr::constant(value, REGISTER_WIDTH),
    }
}

fn assign(state: &mut ExecutionState, place: Place, value: Expr) {
    match place {
        Place::Reg(r) => state.set_register(r, value),
        Place::Temp(t) => {
            state.temps.insert(t, value.resize(REGISTER_WIDTH));
        }
    }
}

fn concrete_registers(state: &ExecutionState) -> Option<[u64; REGISTER_COUNT]> {
    let mut registers = [0u64; REGISTER_COUNT];
    for (slot, value) in registers.iter_mut().zip(state.registers()) {
        *slot = value.as_constant()?;
    }

    Some(registers)
}

impl EngineContext {
    /// Execute one translation unit of the current state.
    pub(crate) fn execute_unit(&mut self) -> Result<ExecResult> {
        let Some(id) = self.scheduler.current() else {
            return Ok(ExecResult::Exit(ExitReason::Terminated));
        };

        let mut scope = UnitScope::new(self);
        scope.execute_unit_in_scope(id)
    }

    fn execute_unit_in_scope(&mut self, id: StateId) -> Result<ExecResult> {
        self.dispatcher.begin_unit();

        let state = self.state_mut(id)?;
        if let Some(cursor) = state.cursor.take() {
            trace!(state = %id, op = cursor.next_op, "resuming inside unit");
            self.dispatcher.last_unit = Some(cursor.unit.clone());
            return self.run_instrumented(id, cursor.unit, cursor.next_op);
        }

        if let Some(result) = self.deliver_pending_interrupts(id)? {
            return Ok(result);
        }

        let pc = self.state_mut(id)?.pc();
        let unit = match self
            .cache
            .get_or_translate(pc, self.translator.as_mut(), &mut self.registry)
        {
            Ok(unit) => unit,
            Err(err) => {
                warn!(state = %id, %err, "translation failed");
                return Ok(ExecResult::Terminated(TerminationReason::Fault(
                    err.to_string(),
                )));
            }
        };

        self.cache.record_execution(pc);
        self.dispatcher.last_unit = Some(unit.clone());

        let native = !self.dispatcher.is_always_instrumented() && !self.cache.is_instrumented(pc);
        if native && unit.native.is_some() {
            if let Some(result) = self.run_native(id, &unit)? {
                return Ok(result);
            }

            self.dispatcher.stats.fallbacks += 1;
            trace!(state = %id, pc = format_args!("{pc:#x}"), "native code fell back");
        }

        self.run_instrumented(id, unit, 0)
    }

    /// Run the unit on concrete values. Returns `None` if the unit must run instrumented, in
    /// which case nothing was committed.
    fn run_native(&mut self, id: StateId, unit: &TranslationUnit) -> Result<Option<ExecResult>> {
        let Some(native) = unit.native.as_ref() else {
            return Ok(None);
        };

        let state = self.states.get_mut(id).ok_or(Error::UnknownState(id))?;
        let Some(registers) = concrete_registers(state) else {
            return Ok(None);
        };

        let mut cpu = ConcreteCpu::new(
            registers,
            state.pc(),
            &self.registry,
            state.memory(),
        );
        let exit = native.execute(&mut cpu);
        let registers = cpu.registers;
        let writes = cpu.into_writes();

        let next = match exit {
            NativeExit::Fallback => return Ok(None),
            NativeExit::Next(pc) => Some(pc),
            NativeExit::Halt => None,
        };

        for (index, value) in registers.into_iter().enumerate() {
            state.set_register(index, Expr::constant(value, REGISTER_WIDTH));
        }

        let mut memory = MemoryView::current(&mut self.registry, state.memory_mut());
        for (address, byte) in writes {
            memory.write_byte(address, byte.into())?;
        }

        self.dispatcher.stats.native_units += 1;
        match next {
            Some(pc) => {
                state.set_pc(pc);
                Ok(Some(ExecResult::Continue))
            }
            None => {
                state.halt();
                Ok(Some(ExecResult::Terminated(TerminationReason::Halted)))
            }
        }
    }

    /// Run the unit's operations symbolically starting at `start`.
    fn run_instrumented(
        &mut self,
        id: StateId,
        unit: Arc<TranslationUnit>,
        start: usize,
    ) -> Result<ExecResult> {
        self.dispatcher.stats.instrumented_units += 1;

        let mut id = id;
        for index in start..unit.ops.len() {
            match &unit.ops[index] {
                UnitOp::Copy { dst, src } => {
                    let state = self.state_mut(id)?;
                    let value = operand(state, *src);
                    assign(state, *dst, value);
                }
                UnitOp::Binary { op, dst, lhs, rhs } => {
                    let state = self.state_mut(id)?;
                    let value = Expr::binary(*op, operand(state, *lhs), operand(state, *rhs));
                    assign(state, *dst, value);
                }
                UnitOp::Compare { op, dst, lhs, rhs } => {
                    let state = self.state_mut(id)?;
                    let value = Expr::compare(*op, operand(state, *lhs), operand(state, *rhs));
                    assign(state, *dst, value);
                }
                UnitOp::Load { dst, address, size } => {
                    let address = operand(self.state_mut(id)?, *address);
                    let address = match self.concretize(&mut id, address, &unit, index)? {
                        Ok(address) => address,
                        Err(result) => return Ok(result),
                    };

                    let value = match self.with_memory(id, |memory| memory.read(address, *size)) {
                        Ok(value) => value,
                        Err(Error::Memory(err)) => return Ok(Self::fault(id, err)),
                        Err(err) => return Err(err),
                    };
                    assign(self.state_mut(id)?, *dst, value);
                }
                UnitOp::Store {
                    address,
                    value,
                    size,
                } => {
                    let address = operand(self.state_mut(id)?, *address);
                    let address = match self.concretize(&mut id, address, &unit, index)? {
                        Ok(address) => address,
                        Err(result) => return Ok(result),
                    };

                    // Concretization may have substituted variables the value depends on
                    let value = operand(self.state_mut(id)?, *value);
                    match self.with_memory(id, |memory| memory.write(address, value, *size)) {
                        Ok(()) => (),
                        Err(Error::Memory(err)) => return Ok(Self::fault(id, err)),
                        Err(err) => return Err(err),
                    }
                }
                UnitOp::Branch { condition, target } => {
                    let condition = operand(self.state_mut(id)?, *condition);
                    return self.branch(id, condition, *target, &unit, index);
                }
                UnitOp::Jump { target } => {
                    let target = operand(self.state_mut(id)?, *target);
                    let target = match self.concretize(&mut id, target, &unit, index)? {
                        Ok(target) => target,
                        Err(result) => return Ok(result),
                    };

                    self.state_mut(id)?.set_pc(target);
                    return Ok(ExecResult::Continue);
                }
                UnitOp::Halt => {
                    self.state_mut(id)?.halt();
                    return Ok(ExecResult::Terminated(TerminationReason::Halted));
                }
                UnitOp::MakeSymbolic { dst, name, width } => {
                    let value = self.variables.fresh(name.clone(), *width);
                    debug!(state = %id, %value, "created symbolic value");
                    assign(self.state_mut(id)?, *dst, value);
                }
            }
        }

        let fallthrough = unit.fallthrough();
        self.state_mut(id)?.set_pc(fallthrough);
        Ok(ExecResult::Continue)
    }

    fn fault(id: StateId, err: impl std::fmt::Display) -> ExecResult {
        warn!(state = %id, %err, "memory fault");
        ExecResult::Terminated(TerminationReason::Fault(err.to_string()))
    }

    fn branch(
        &mut self,
        id: StateId,
        condition: Expr,
        target: u64,
        unit: &Arc<TranslationUnit>,
        index: usize,
    ) -> Result<ExecResult> {
        let fallthrough = unit.fallthrough();
        let pair = match self.fork(id, condition, true) {
            Ok(pair) => pair,
            Err(err) => return self.fork_failure(id, err, unit, index),
        };

        let pc = |taken: bool| if taken { target } else { fallthrough };
        match pair.outcome {
            fork::ForkOutcome::Split => {
                self.state_mut(pair.true_state)?.set_pc(target);
                let sibling = self.state_mut(pair.false_state)?;
                sibling.set_pc(fallthrough);
                sibling.temps.clear();
            }
            fork::ForkOutcome::OnlyTrue => self.state_mut(id)?.set_pc(target),
            fork::ForkOutcome::OnlyFalse => self.state_mut(id)?.set_pc(fallthrough),
        }

        if let Some(parked) = pair.parked {
            let taken = pair.outcome != fork::ForkOutcome::OnlyTrue;
            let parked = self.state_mut(parked)?;
            parked.set_pc(pc(taken));
            parked.temps.clear();
        }

        Ok(ExecResult::Continue)
    }

    /// Pin a value to a concrete one, forking if it is symbolic. On a split the remainder is
    /// left at the same operation and `id` becomes the pinned state.
    fn concretize(
        &mut self,
        id: &mut StateId,
        value: Expr,
        unit: &Arc<TranslationUnit>,
        index: usize,
    ) -> Result<std::result::Result<u64, ExecResult>> {
        if let Some(value) = value.as_constant() {
            return Ok(Ok(value));
        }

        match self.fork_and_concretize(*id, &value) {
            Ok(concretization) => {
                // States that still need a value resume at the same operation
                for other in concretization.remainder.into_iter().chain(concretization.parked) {
                    self.state_mut(other)?.cursor = Some(UnitCursor {
                        unit: unit.clone(),
                        next_op: index,
                    });
                }

                *id = concretization.concrete;
                Ok(Ok(concretization.value))
            }
            Err(err) => Ok(Err(self.fork_failure(*id, err, unit, index)?)),
        }
    }

    fn fork_failure(
        &mut self,
        id: StateId,
        err: Error,
        unit: &Arc<TranslationUnit>,
        index: usize,
    ) -> Result<ExecResult> {
        match err {
            Error::Fork(fork::Error::UnsatisfiablePath(_)) => {
                Ok(ExecResult::Terminated(TerminationReason::UnsatisfiablePath))
            }
            Error::Fork(fork::Error::NoSatisfiableValue { .. }) => {
                Ok(ExecResult::Terminated(TerminationReason::NoSatisfiableValue))
            }
            Error::Fork(fork::Error::SolverUnknown(_)) => {
                warn!(state = %id, "solver could not decide, suspending state");
                self.state_mut(id)?.cursor = Some(UnitCursor {
                    unit: unit.clone(),
                    next_op: index,
                });
                self.suspend(id);
                Ok(ExecResult::Exit(ExitReason::Suspended))
            }
            err => Err(err),
        }
    }

    /// Apply interrupts queued for the state. Returns a result if delivery failed.
    fn deliver_pending_interrupts(&mut self, id: StateId) -> Result<Option<ExecResult>> {
        loop {
            let state = self.states.get_mut(id).ok_or(Error::UnknownState(id))?;
            let Some(interrupt) = state.pending_interrupts.pop_front() else {
                return Ok(None);
            };

            let (registers, pc, memory) = state.cpu_mut();
            let mut context = InterruptContext {
                registers,
                pc,
                memory: MemoryView::current(&mut self.registry, memory),
            };

            if let Err(err) = self.interrupts.deliver(&mut context, &interrupt) {
                warn!(state = %id, vector = interrupt.vector, %err, "interrupt delivery failed");
                return Ok(Some(ExecResult::Terminated(TerminationReason::Fault(
                    err.to_string(),
                ))));
            }

            self.dispatcher.stats.interrupts += 1;
            self.stats.interrupts_delivered += 1;
            debug!(state = %id, vector = interrupt.vector, "delivered interrupt");
        }
    }

    /// Decide whether the state must leave the execution loop after a unit.
    pub fn exit_reason(&self, id: StateId) -> Option<ExitReason> {
        let Some(state) = self.states.get(id) else {
            return Some(ExitReason::Terminated);
        };

        if state.is_zombie() {
            return Some(ExitReason::Terminated);
        }

        if state.status() == StateStatus::Suspended {
            return Some(ExitReason::Suspended);
        }

        if state.is_halted() {
            return Some(ExitReason::Halted);
        }

        if self.dispatcher.forked {
            return Some(ExitReason::Forked);
        }

        if self.dispatcher.breakpoints.contains(&state.pc()) {
            return Some(ExitReason::Breakpoint(state.pc()));
        }

        if let Some(unit) = self.dispatcher.last_unit.as_ref() {
            if !self.cache.is_current(unit, &self.registry) {
                return Some(ExitReason::StaleUnit);
            }
        }

        self.dispatcher
            .time_slice_expired()
            .then_some(ExitReason::TimeSlice)
    }

    /// True if the state must leave the execution loop.
    pub fn finalize_execution(&self, id: StateId) -> bool {
        match self.exit_reason(id) {
            Some(reason) => {
                trace!(state = %id, ?reason, "leaving execution loop");
                true
            }
            None => false,
        }
    }

    /// Drop per-unit data of a state that finished its unit. A state suspended inside a unit
    /// keeps its data so it can resume.
    pub(crate) fn cleanup(&mut self, id: StateId) {
        if let Some(state) = self.states.get_mut(id) {
            if state.status() == StateStatus::Active {
                state.temps.clear();
                state.cursor = None;
            }
        }
    }
}
