use std::collections::BTreeSet;

use proptest::prelude::*;
use symex_expr::{Evaluator, Expr, VariableAssignments};

use super::super::test_fixture::*;
use crate::engine::{Error, Result};
use crate::fork::{self, ForkOutcome};
use crate::scheduler::SearchPolicy;
use crate::state::StateStatus;

fn started() -> Result<(crate::EngineContext, crate::StateId)> {
    let mut engine = engine(ScriptedTranslator::new());
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;
    Ok((engine, id))
}

#[test]
fn concrete_condition_does_not_split() -> Result<()> {
    let (mut engine, id) = started()?;

    let pair = engine.fork(id, Expr::bool(true), true)?;
    assert_eq!(pair.outcome, ForkOutcome::OnlyTrue);
    assert_eq!((pair.true_state, pair.false_state), (id, id));

    let pair = engine.fork(id, Expr::constant(0, 64), true)?;
    assert_eq!(pair.outcome, ForkOutcome::OnlyFalse);
    assert_eq!(engine.states().len(), 1);
    assert_eq!(engine.fork_engine().stats().forks, 0);

    Ok(())
}

#[test]
fn split_assigns_fresh_identifiers() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let condition = x.clone().unsigned_less_than(Expr::constant(5, 8));

    let pair = engine.fork(id, condition.clone(), true)?;
    assert!(pair.is_split());
    assert_eq!(pair.parent, id);
    assert!(pair.true_state != id && pair.false_state != id);
    assert_ne!(pair.true_state, pair.false_state);
    assert!(engine.states().is_retired(id));
    assert!(engine.state(id).is_none());

    let true_state = engine.state(pair.true_state).expect("true state exists");
    let false_state = engine.state(pair.false_state).expect("false state exists");
    assert_eq!(true_state.path_condition(), &[condition.clone()]);
    assert_eq!(false_state.path_condition(), &[condition.not()]);
    assert_eq!(true_state.parent(), Some(id));
    assert_eq!(false_state.parent(), Some(id));
    assert_eq!((true_state.depth(), false_state.depth()), (1, 1));

    // The current state continues on the requested branch
    assert_eq!(engine.current_state(), Some(pair.true_state));
    assert!(engine.scheduler().is_runnable(pair.false_state));

    Ok(())
}

#[test]
fn keep_false_branch_in_current() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);

    let pair = engine.fork(id, x.equals(Expr::constant(1, 8)), false)?;
    assert_eq!(engine.current_state(), Some(pair.false_state));

    Ok(())
}

#[test]
fn infeasible_branch_is_pruned() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);

    let pair = engine.fork(id, x.clone().equals(Expr::constant(3, 8)), true)?;
    let three = pair.true_state;

    let pair = engine.fork(three, x.equals(Expr::constant(4, 8)), true)?;
    assert_eq!(pair.outcome, ForkOutcome::OnlyFalse);
    assert_eq!(pair.false_state, three);
    assert_eq!(engine.state(three).map(|s| s.path_condition().len()), Some(1));

    Ok(())
}

#[test]
fn observers_see_forks() -> Result<()> {
    let (mut engine, id) = started()?;
    let observer = RecordingObserver::default();
    engine.add_observer(observer.clone());
    let x = symbol(&mut engine, "x", 8);
    let condition = x.unsigned_less_than(Expr::constant(5, 8));

    let pair = engine.fork(id, condition.clone(), true)?;
    let forks = observer.forks();
    assert_eq!(forks.len(), 1);
    assert_eq!(forks[0].parent, id);
    assert_eq!(forks[0].condition, condition);
    assert_eq!(forks[0].states, vec![pair.true_state, pair.false_state]);

    Ok(())
}

#[test]
fn undecided_branch_is_parked() -> Result<()> {
    let x = predicted_variable(0, 8);
    let condition = x.clone().unsigned_less_than(Expr::constant(5, 8));
    let mut engine = engine_with(
        config(),
        ScriptedTranslator::new(),
        UndecidedSolver::exprs(vec![condition.clone().not()]),
    );
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;
    assert_eq!(symbol(&mut engine, "x", 8), x);

    let pair = engine.fork(id, condition.clone(), true)?;
    assert_eq!(pair.outcome, ForkOutcome::OnlyTrue);
    assert_eq!(pair.true_state, id);

    // The feasible branch continues with its constraint and the other is parked
    let parked = pair.parked.expect("undecided branch is parked");
    assert_eq!(engine.state(id).map(|s| s.path_condition().to_vec()), Some(vec![condition.clone()]));
    let parked_state = engine.state(parked).expect("parked state exists");
    assert_eq!(parked_state.status(), StateStatus::Suspended);
    assert_eq!(parked_state.path_condition(), &[condition.not()]);
    assert!(engine.scheduler().is_suspended(parked));
    assert!(!engine.scheduler().is_runnable(parked));

    Ok(())
}

#[test]
fn undecided_on_both_sides_fails() -> Result<()> {
    let x = predicted_variable(0, 8);
    let mut engine = engine_with(
        config(),
        ScriptedTranslator::new(),
        UndecidedSolver::variables(x.variables().into_keys().collect()),
    );
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;
    let x = symbol(&mut engine, "x", 8);

    let result = engine.fork(id, x.unsigned_less_than(Expr::constant(5, 8)), true);
    assert!(matches!(result, Err(Error::Fork(fork::Error::SolverUnknown(s))) if s == id));
    assert_eq!(engine.states().len(), 1);

    Ok(())
}

#[test]
fn fork_values_keeps_feasible_candidates() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.clone().unsigned_less_than(Expr::constant(3, 8)), true)?;
    let id = pair.true_state;

    let states = engine.fork_values(id, &x, &[7, 2, 0, 2])?;
    assert_eq!(states.len(), 2);
    assert!(engine.states().is_retired(id));
    assert_eq!(engine.current_state(), Some(states[0]));

    for (state, value) in states.iter().zip([2, 0]) {
        let path_condition = engine.state(*state).expect("state exists").path_condition();
        assert_eq!(
            path_condition.last(),
            Some(&x.clone().equals(Expr::constant(value, 8)))
        );
    }

    Ok(())
}

#[test]
fn fork_values_with_single_value_keeps_identifier() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.clone().equals(Expr::constant(9, 8)), true)?;
    let id = pair.true_state;

    assert_eq!(engine.fork_values(id, &x, &[9, 10])?, vec![id]);

    let result = engine.fork_values(id, &x, &[1, 2]);
    assert!(matches!(
        result,
        Err(Error::Fork(fork::Error::NoSatisfiableValue { candidates: 2, .. }))
    ));

    Ok(())
}

#[test]
fn concretize_substitutes_variable() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.clone().unsigned_less_than(Expr::constant(2, 8)), true)?;
    let id = pair.true_state;
    engine.set_register(id, 3, x.clone())?;

    let result = engine.fork_and_concretize(id, &x)?;
    let remainder = result.remainder.expect("another value is feasible");
    assert_eq!(result.parent, id);

    // The pinned state no longer mentions the variable
    let concrete = engine.state(result.concrete).expect("pinned state exists");
    assert_eq!(concrete.register(3).as_constant(), Some(result.value));
    assert!(concrete.path_condition().iter().all(|c| c.variables().is_empty()));

    // The remainder excludes the value
    let remainder = engine.state(remainder).expect("remainder exists");
    assert_eq!(
        remainder.path_condition().last(),
        Some(&x.clone().equals(Expr::constant(result.value, 8)).not())
    );
    assert_eq!(remainder.register(3), &x.resize(64));

    Ok(())
}

#[test]
fn concretize_constant_is_a_no_op() -> Result<()> {
    let (mut engine, id) = started()?;
    let result = engine.fork_and_concretize(id, &Expr::constant(42, 64))?;
    assert_eq!((result.concrete, result.remainder, result.value), (id, None, 42));
    Ok(())
}

#[test]
fn merge_combines_registers() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let condition = x.clone().unsigned_less_than(Expr::constant(5, 8));
    let pair = engine.fork(id, condition.clone(), true)?;
    engine.set_register(pair.true_state, 0, Expr::constant(1, 64))?;
    engine.set_register(pair.false_state, 0, Expr::constant(2, 64))?;

    assert!(engine.merge(pair.true_state, pair.false_state)?);
    assert!(engine.state(pair.false_state).is_some_and(|s| s.is_zombie()));
    assert!(!engine.scheduler().is_runnable(pair.false_state));

    let merged = engine.state(pair.true_state).expect("merged state exists");
    assert!(merged.path_condition().is_empty());

    // The merged register takes the value of whichever path is taken
    let value = merged.register(0).clone();
    for (x_value, expected) in [(0, 1), (4, 1), (5, 2), (200, 2)] {
        let assignments = x
            .variables()
            .into_keys()
            .map(|id| (id, x_value))
            .collect::<VariableAssignments>();
        assert_eq!(Evaluator::new(assignments).evaluate(&value), Some(expected));
    }

    Ok(())
}

#[test]
fn merge_rejects_incompatible_states() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.unsigned_less_than(Expr::constant(5, 8)), true)?;
    engine.set_pc(pair.false_state, 0x200)?;
    engine.set_register(pair.false_state, 1, Expr::constant(1, 64))?;

    assert!(!engine.merge(pair.true_state, pair.false_state)?);
    assert!(engine.state(pair.false_state).is_some_and(|s| !s.is_zombie()));
    assert_eq!(engine.state(pair.false_state).map(|s| s.register(1).as_constant()), Some(Some(1)));
    assert_eq!(engine.fork_engine().stats().rejected_merges, 1);

    Ok(())
}

#[test]
fn merge_keeps_common_prefix() -> Result<()> {
    let (mut engine, id) = started()?;
    let x = symbol(&mut engine, "x", 8);
    let outer = x.clone().unsigned_less_than(Expr::constant(100, 8));
    let pair = engine.fork(id, outer.clone(), true)?;
    let pair = engine.fork(pair.true_state, x.equals(Expr::constant(7, 8)), true)?;

    assert!(engine.merge(pair.false_state, pair.true_state)?);
    let merged = engine.state(pair.false_state).expect("merged state exists");
    assert_eq!(merged.path_condition(), &[outer]);
    assert_eq!(merged.depth(), 2);

    // Merging with a zombie fails
    let result = engine.merge(pair.false_state, pair.true_state);
    assert!(matches!(result, Err(Error::Fork(fork::Error::ZombieState(_)))));

    Ok(())
}

#[test]
fn forked_siblings_have_independent_memory() -> Result<()> {
    let (mut engine, id) = started()?;
    engine.write_memory(id, 0x1800, Expr::constant(0x11, 8), 1)?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.unsigned_less_than(Expr::constant(5, 8)), true)?;

    engine.write_memory(pair.true_state, 0x1800, Expr::constant(0x22, 8), 1)?;
    engine.write_memory(pair.false_state, 0x1800, Expr::constant(0x33, 8), 1)?;

    assert_eq!(engine.read_memory(pair.true_state, 0x1800, 1)?.as_constant(), Some(0x22));
    assert_eq!(engine.read_memory(pair.false_state, 0x1800, 1)?.as_constant(), Some(0x33));

    // Switching to the sibling restores its bytes into the host buffers
    engine.set_searcher(SearchPolicy::DepthFirst.build(0));
    engine.suspend(pair.true_state);
    let next = engine.select_next()?;
    assert_eq!(next, pair.false_state);
    assert_eq!(engine.read_memory(pair.false_state, 0x1800, 1)?.as_constant(), Some(0x33));
    assert_eq!(engine.read_memory(pair.true_state, 0x1800, 1)?.as_constant(), Some(0x22));

    Ok(())
}

proptest! {
    #[test]
    fn fork_values_partitions_candidates(bound in 1u64..16, candidates in prop::collection::vec(0u64..32, 1..8)) {
        let (mut engine, id) = started().expect("engine starts");
        let x = symbol(&mut engine, "x", 8);
        let pair = engine
            .fork(id, x.clone().unsigned_less_than(Expr::constant(bound, 8)), true)
            .expect("fork succeeds");
        let id = pair.true_state;

        let feasible = candidates.iter().copied().filter(|&v| v < bound).collect::<BTreeSet<_>>();
        match engine.fork_values(id, &x, &candidates) {
            Ok(states) => {
                prop_assert_eq!(states.len(), feasible.len());
                let unique = states.iter().collect::<BTreeSet<_>>();
                prop_assert_eq!(unique.len(), states.len());

                // Every state is constrained to exactly one candidate
                for state in states.iter() {
                    let path_condition = engine.state(*state).expect("state exists").path_condition();
                    let consistent = (0u64..256)
                        .filter(|&value| {
                            let assignments = x
                                .variables()
                                .into_keys()
                                .map(|id| (id, value))
                                .collect::<VariableAssignments>();
                            let mut evaluator = Evaluator::new(assignments);
                            path_condition.iter().all(|c| evaluator.evaluate_bool(c) == Some(true))
                        })
                        .collect::<Vec<_>>();
                    prop_assert_eq!(consistent.len(), 1);
                    prop_assert!(feasible.contains(&consistent[0]));
                }
            }
            Err(Error::Fork(fork::Error::NoSatisfiableValue { .. })) => prop_assert!(feasible.is_empty()),
            Err(err) => prop_assert!(false, "unexpected error {err}"),
        }
    }
}
