use std::collections::BTreeMap;

use symex_expr::{Evaluator, Expr, VariableAssignments};
use tracing::{debug, warn};

use crate::region::RegionRegistry;
use crate::solver::{Query, SatResult, Solver};
use crate::state::{ExecutionState, StateId, StateStatus, StateTable};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Neither side of a branch is feasible. The path condition is inconsistent with the branch.
    #[error("neither branch is satisfiable in state {0}")]
    UnsatisfiablePath(StateId),

    #[error("none of the {candidates} candidate values is satisfiable in state {state}")]
    NoSatisfiableValue { state: StateId, candidates: usize },

    /// The solver could not decide feasibility of any branch.
    #[error("solver could not decide a branch in state {0}")]
    SolverUnknown(StateId),

    #[error("unknown state {0}")]
    UnknownState(StateId),

    #[error("state {0} is a zombie")]
    ZombieState(StateId),
}

/// Which sides of a fork are feasible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Both branches are feasible and the state was split in two.
    Split,
    OnlyTrue,
    OnlyFalse,
}

/// Result of a fork. Without a split both sides refer to the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePair {
    /// The state that was forked. After a split this identifier is retired.
    pub parent: StateId,
    pub true_state: StateId,
    pub false_state: StateId,
    pub outcome: ForkOutcome,

    /// A suspended state holding a branch the solver could not decide.
    pub parked: Option<StateId>,
}

impl StatePair {
    pub fn is_split(&self) -> bool {
        self.outcome == ForkOutcome::Split
    }

    fn unsplit(state: StateId, outcome: ForkOutcome) -> Self {
        Self {
            parent: state,
            true_state: state,
            false_state: state,
            outcome,
            parked: None,
        }
    }

    /// The state continuing on the requested branch.
    pub fn branch(&self, taken: bool) -> StateId {
        if taken {
            self.true_state
        } else {
            self.false_state
        }
    }
}

/// Result of pinning an expression to a concrete value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concretization {
    pub concrete: StateId,
    pub remainder: Option<StateId>,

    /// Suspended state holding the other values when the solver could not decide them.
    pub parked: Option<StateId>,
    pub value: u64,
    pub parent: StateId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkStats {
    pub forks: u64,
    pub merges: u64,
    pub rejected_merges: u64,
    pub concretizations: u64,
    pub solver_unknowns: u64,
}

/// Mutable engine components a fork or merge operates on.
pub struct ForkContext<'a> {
    pub states: &'a mut StateTable,
    pub registry: &'a mut RegionRegistry,
    pub solver: &'a mut dyn Solver,

    /// The state whose concrete bytes are currently held in host buffers.
    pub current: Option<StateId>,

    /// Suspended states created for branches the solver could not decide.
    pub parked: Vec<StateId>,
}

impl ForkContext<'_> {
    fn state(&self, id: StateId) -> Result<&ExecutionState> {
        let state = self.states.get(id).ok_or(Error::UnknownState(id))?;
        if state.is_zombie() {
            return Err(Error::ZombieState(id));
        }

        Ok(state)
    }

    fn state_mut(&mut self, id: StateId) -> Result<&mut ExecutionState> {
        self.state(id)?;
        self.states.get_mut(id).ok_or(Error::UnknownState(id))
    }

    /// Bring the state's stores up to date with the host buffers if it is the current state.
    fn sync(&mut self, id: StateId) {
        if self.current == Some(id) {
            if let Some(state) = self.states.get_mut(id) {
                self.registry.copy_out(state.memory_mut());
            }
        }
    }

    /// Reload the host buffers from the state's stores if it is the current state.
    fn reload(&mut self, id: StateId) {
        if self.current == Some(id) {
            if let Some(state) = self.states.get_mut(id) {
                self.registry.copy_in(state.memory_mut());
            }
        }
    }

    fn check(&mut self, id: StateId, extra: &Expr) -> Result<SatResult> {
        self.state(id)?;
        let state = self.states.get(id).ok_or(Error::UnknownState(id))?;
        let result = self
            .solver
            .check(Query::with_extra(state.path_condition(), extra));
        Ok(result)
    }

    /// Clone the state as a suspended state constrained to a branch the solver could not decide.
    fn park(&mut self, id: StateId, constraint: Expr) -> Result<StateId> {
        self.sync(id);
        let parked_id = self.states.allocate_id();
        let mut parked = self.state(id)?.fork_clone(parked_id);
        parked.add_constraint(constraint);
        parked.increment_depth();
        parked.set_status(StateStatus::Suspended);
        self.states.insert(parked);
        self.parked.push(parked_id);

        warn!(state = %id, parked = %parked_id, "solver could not decide branch, parked state");
        Ok(parked_id)
    }
}

fn as_condition(condition: Expr) -> Expr {
    match condition.width() {
        1 => condition,
        width => condition.not_equals(Expr::constant(0, width)),
    }
}

/// Splits, prunes and recombines states.
#[derive(Debug, Clone, Default)]
pub struct ForkEngine {
    max_merge_nodes: usize,
    stats: ForkStats,
}

impl ForkEngine {
    pub fn new(max_merge_nodes: usize) -> Self {
        Self {
            max_merge_nodes,
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> ForkStats {
        self.stats
    }

    /// Fork the state on a condition. A nonzero condition wider than one bit is treated as true.
    ///
    /// If the condition is concrete or only one branch is feasible, both sides of the returned
    /// pair are the original state and nothing is allocated. Otherwise the state is split in two
    /// and each side receives a fresh identifier and one new conjunct in its path condition. The
    /// original object continues on the branch selected by `keep_true_in_current`.
    pub fn fork(
        &mut self,
        ctx: &mut ForkContext<'_>,
        id: StateId,
        condition: Expr,
        keep_true_in_current: bool,
    ) -> Result<StatePair> {
        ctx.state(id)?;
        let condition = as_condition(condition);
        match condition.as_bool() {
            Some(true) => return Ok(StatePair::unsplit(id, ForkOutcome::OnlyTrue)),
            Some(false) => return Ok(StatePair::unsplit(id, ForkOutcome::OnlyFalse)),
            None => (),
        }

        let negated = condition.clone().not();
        let true_sat = ctx.check(id, &condition)?;
        let false_sat = ctx.check(id, &negated)?;

        use SatResult::*;
        match (true_sat, false_sat) {
            (Sat, Sat) => self.split(ctx, id, condition, negated, keep_true_in_current),
            (Sat, Unsat) => Ok(StatePair::unsplit(id, ForkOutcome::OnlyTrue)),
            (Unsat, Sat) => Ok(StatePair::unsplit(id, ForkOutcome::OnlyFalse)),
            (Unsat, Unsat) => Err(Error::UnsatisfiablePath(id)),
            (Sat, Unknown) => {
                self.stats.solver_unknowns += 1;
                let parked = ctx.park(id, negated)?;
                ctx.state_mut(id)?.add_constraint(condition);
                Ok(StatePair {
                    parked: Some(parked),
                    ..StatePair::unsplit(id, ForkOutcome::OnlyTrue)
                })
            }
            (Unknown, Sat) => {
                self.stats.solver_unknowns += 1;
                let parked = ctx.park(id, condition)?;
                ctx.state_mut(id)?.add_constraint(negated);
                Ok(StatePair {
                    parked: Some(parked),
                    ..StatePair::unsplit(id, ForkOutcome::OnlyFalse)
                })
            }
            (Unknown, _) | (_, Unknown) => {
                self.stats.solver_unknowns += 1;
                Err(Error::SolverUnknown(id))
            }
        }
    }

    fn split(
        &mut self,
        ctx: &mut ForkContext<'_>,
        id: StateId,
        condition: Expr,
        negated: Expr,
        keep_true_in_current: bool,
    ) -> Result<StatePair> {
        ctx.sync(id);

        let true_id = ctx.states.allocate_id();
        let false_id = ctx.states.allocate_id();
        let (kept_id, kept_constraint, clone_id, clone_constraint) = if keep_true_in_current {
            (true_id, condition.clone(), false_id, negated)
        } else {
            (false_id, negated, true_id, condition.clone())
        };

        let mut clone = ctx.state(id)?.fork_clone(clone_id);
        clone.add_constraint(clone_constraint);
        clone.increment_depth();
        ctx.states.insert(clone);

        ctx.states.rekey(id, kept_id);
        let kept = ctx.state_mut(kept_id)?;
        kept.add_constraint(kept_constraint);
        kept.increment_depth();
        if ctx.current == Some(id) {
            ctx.current = Some(kept_id);
        }

        self.stats.forks += 1;
        debug!(
            parent = %id,
            true_state = %true_id,
            false_state = %false_id,
            %condition,
            "forked state"
        );

        Ok(StatePair {
            parent: id,
            true_state: true_id,
            false_state: false_id,
            outcome: ForkOutcome::Split,
            parked: None,
        })
    }

    /// Fork one state per feasible candidate value of `expr`, each constrained to its value.
    /// Returned states are in candidate order. The original object continues as the first.
    pub fn fork_values(
        &mut self,
        ctx: &mut ForkContext<'_>,
        id: StateId,
        expr: &Expr,
        candidates: &[u64],
    ) -> Result<Vec<StateId>> {
        ctx.state(id)?;

        let mut feasible = Vec::new();
        let mut undecided = Vec::new();
        for &value in candidates {
            let constraint = expr.clone().equals(Expr::constant(value, expr.width()));
            if feasible.iter().chain(undecided.iter()).any(|(_, c)| *c == constraint) {
                continue;
            }

            match ctx.check(id, &constraint)? {
                SatResult::Sat => feasible.push((value, constraint)),
                SatResult::Unsat => debug!(state = %id, value, "candidate value infeasible"),
                SatResult::Unknown => undecided.push((value, constraint)),
            }
        }

        if feasible.is_empty() {
            if undecided.is_empty() {
                return Err(Error::NoSatisfiableValue {
                    state: id,
                    candidates: candidates.len(),
                });
            }

            self.stats.solver_unknowns += 1;
            return Err(Error::SolverUnknown(id));
        }

        for (_, constraint) in undecided {
            self.stats.solver_unknowns += 1;
            ctx.park(id, constraint)?;
        }

        if feasible.len() == 1 {
            let (_, constraint) = feasible.remove(0);
            ctx.state_mut(id)?.add_constraint(constraint);
            return Ok(vec![id]);
        }

        ctx.sync(id);
        let mut children = Vec::with_capacity(feasible.len());
        for (_, constraint) in feasible.iter().skip(1) {
            let child_id = ctx.states.allocate_id();
            let mut child = ctx.state(id)?.fork_clone(child_id);
            child.add_constraint(constraint.clone());
            child.increment_depth();
            ctx.states.insert(child);
            children.push(child_id);
        }

        let first_id = ctx.states.allocate_id();
        ctx.states.rekey(id, first_id);
        let first = ctx.state_mut(first_id)?;
        first.add_constraint(feasible[0].1.clone());
        first.increment_depth();
        if ctx.current == Some(id) {
            ctx.current = Some(first_id);
        }
        children.insert(0, first_id);

        self.stats.forks += 1;
        debug!(
            parent = %id,
            values = ?feasible.iter().map(|(v, _)| v).collect::<Vec<_>>(),
            "forked state over values"
        );

        Ok(children)
    }

    /// Pin `expr` to a value allowed by the path condition. If other values remain feasible the
    /// state is split and the remainder keeps `expr != value`. When `expr` is a single variable
    /// the pinned state is rewritten with the value substituted for the variable.
    pub fn fork_and_concretize(
        &mut self,
        ctx: &mut ForkContext<'_>,
        id: StateId,
        expr: &Expr,
    ) -> Result<Concretization> {
        ctx.state(id)?;
        if let Some(value) = expr.as_constant() {
            return Ok(Concretization {
                concrete: id,
                remainder: None,
                parked: None,
                value,
                parent: id,
            });
        }

        let state = ctx.states.get(id).ok_or(Error::UnknownState(id))?;
        let query = Query::new(state.path_condition());
        let Some(model) = ctx.solver.model(query) else {
            return match ctx.solver.check(query) {
                SatResult::Unsat => Err(Error::UnsatisfiablePath(id)),
                _ => {
                    self.stats.solver_unknowns += 1;
                    Err(Error::SolverUnknown(id))
                }
            };
        };

        // Variables unconstrained by the path may take any value
        let mut assignments = model.as_map().clone();
        for (variable, _) in expr.variables() {
            assignments.entry(variable).or_insert(0);
        }
        let mut evaluator = Evaluator::new(VariableAssignments::from(assignments));
        let value = evaluator
            .evaluate(expr)
            .ok_or(Error::SolverUnknown(id))?;

        let pinned = expr.clone().equals(Expr::constant(value, expr.width()));
        let pair = self.fork(ctx, id, pinned, true)?;
        let concrete = pair.true_state;
        let remainder = pair.is_split().then_some(pair.false_state);

        if let Some((variable, _)) = expr.as_variable() {
            ctx.sync(concrete);
            ctx.state_mut(concrete)?
                .substitute(&BTreeMap::from([(variable, value)]));
            ctx.reload(concrete);
        }

        self.stats.concretizations += 1;
        debug!(state = %concrete, ?remainder, value, "concretized expression");
        Ok(Concretization {
            concrete,
            remainder,
            parked: pair.parked,
            value,
            parent: id,
        })
    }

    /// Merge `other` into `base`. Both states must be at the same program counter with the same
    /// set of owned regions. Locations that differ become `ite(selector, base, other)` where the
    /// selector is the part of the path condition of `base` not shared with `other`. On success
    /// `other` becomes a zombie and `true` is returned. No state is modified on failure.
    pub fn merge(&mut self, ctx: &mut ForkContext<'_>, base: StateId, other: StateId) -> Result<bool> {
        if base == other {
            return Ok(false);
        }

        ctx.sync(base);
        ctx.sync(other);
        let a = ctx.state(base)?;
        let b = ctx.state(other)?;

        if let Some(reason) = incompatibility(a, b) {
            debug!(%base, %other, reason, "states cannot be merged");
            self.stats.rejected_merges += 1;
            return Ok(false);
        }

        let common = a
            .path_condition()
            .iter()
            .zip(b.path_condition())
            .take_while(|(x, y)| x == y)
            .count();
        let selector = Expr::all(a.path_condition()[common..].iter().cloned());
        let other_suffix = Expr::all(b.path_condition()[common..].iter().cloned());

        let Some(merged) = MergedValues::build(a, b, &selector, self.max_merge_nodes) else {
            debug!(%base, %other, "merged values exceed size bound");
            self.stats.rejected_merges += 1;
            return Ok(false);
        };

        if merged.differs && selector.is_true() {
            // Identical path conditions leave no way to select between differing values
            debug!(%base, %other, "cannot merge differing states with equal path conditions");
            self.stats.rejected_merges += 1;
            return Ok(false);
        }

        let join = selector.clone().or(other_suffix);
        if join.node_count() > self.max_merge_nodes {
            self.stats.rejected_merges += 1;
            return Ok(false);
        }

        let mut path_condition = a.path_condition()[..common].to_vec();
        if !join.is_true() {
            path_condition.push(join);
        }

        let depth = a.depth().max(b.depth());
        let seen_events = b.seen_events.clone();

        let merged_state = ctx.state_mut(base)?;
        merged.apply(merged_state);
        merged_state.set_path_condition(path_condition);
        merged_state.seen_events.extend(seen_events);
        while merged_state.depth() < depth {
            merged_state.increment_depth();
        }
        ctx.reload(base);

        ctx.state_mut(other)?.set_status(StateStatus::Zombie);
        self.stats.merges += 1;
        debug!(%base, %other, "merged states");
        Ok(true)
    }
}

fn incompatibility(a: &ExecutionState, b: &ExecutionState) -> Option<&'static str> {
    if a.pc() != b.pc() {
        return Some("program counters differ");
    }

    if a.is_mid_unit() || b.is_mid_unit() {
        return Some("state is inside a translation unit");
    }

    if a.memory().region_ids() != b.memory().region_ids() {
        return Some("owned regions differ");
    }

    if a.is_halted() != b.is_halted() {
        return Some("only one state is halted");
    }

    if !a.pending_interrupts().eq(b.pending_interrupts()) {
        return Some("pending interrupts differ");
    }

    None
}

/// The registers and memory bytes of a merged state.
struct MergedValues {
    registers: Vec<(usize, Expr)>,
    bytes: Vec<(crate::region::RegionId, usize, Expr)>,
    differs: bool,
}

impl MergedValues {
    fn build(
        a: &ExecutionState,
        b: &ExecutionState,
        selector: &Expr,
        max_nodes: usize,
    ) -> Option<Self> {
        let merge = |x: &Expr, y: &Expr| {
            let value = Expr::ite(selector.clone(), x.clone(), y.clone());
            (value.node_count() <= max_nodes).then_some(value)
        };

        let mut registers = Vec::new();
        for (index, (x, y)) in a.registers().iter().zip(b.registers()).enumerate() {
            if x != y {
                registers.push((index, merge(x, y)?));
            }
        }

        let mut bytes = Vec::new();
        for (id, store_a) in a.memory().stores() {
            let store_b = b.memory().store(id)?;
            let mut offsets = store_a
                .symbolic()
                .keys()
                .chain(store_b.symbolic().keys())
                .copied()
                .collect::<Vec<_>>();

            let chunk_size = store_a.chunk_size();
            for chunk in 0..store_a.chunk_count() {
                let (x, y) = (store_a.chunk(chunk), store_b.chunk(chunk));
                if std::ptr::eq(x, y) || x == y {
                    continue;
                }

                offsets.extend(
                    x.iter()
                        .zip(y)
                        .enumerate()
                        .filter(|(_, (p, q))| p != q)
                        .map(|(i, _)| chunk * chunk_size + i),
                );
            }

            offsets.sort_unstable();
            offsets.dedup();
            for offset in offsets {
                let (x, y) = (store_a.byte(offset), store_b.byte(offset));
                if x != y {
                    bytes.push((id, offset, merge(&x, &y)?));
                }
            }
        }

        let differs = !registers.is_empty() || !bytes.is_empty();
        Some(Self {
            registers,
            bytes,
            differs,
        })
    }

    fn apply(self, state: &mut ExecutionState) {
        for (index, value) in self.registers {
            state.set_register(index, value);
        }

        for (id, offset, value) in self.bytes {
            if let Some(store) = state.memory_mut().store_mut(id) {
                store.set_byte(offset, value);
            }
        }
    }
}
