use std::collections::BTreeSet;

use symex_expr::{BinaryOp, CompareOp, Expr};

use super::super::test_fixture::*;
use crate::config::EngineConfig;
use crate::dispatch::{ExitReason, TerminationReason};
use crate::engine::{Result, RunOutcome};
use crate::interrupt::Interrupt;
use crate::solver::EnumeratingSolver;
use crate::translation::UnitOp;

/// Counts register 0 up to `limit` and halts.
fn counting_program(limit: u64) -> ScriptedTranslator {
    ScriptedTranslator::new()
        .unit(
            0x100,
            4,
            vec![
                add(0, reg(0), imm(1)),
                compare(CompareOp::Ult, 1, reg(0), imm(limit)),
                branch(reg(1), 0x100),
            ],
        )
        .unit(0x104, 4, vec![UnitOp::Halt])
}

/// Branches on a fresh symbolic byte. The taken path sets register 2 to 1, the other to 2.
fn symbolic_branch_program() -> ScriptedTranslator {
    ScriptedTranslator::new()
        .unit(
            0x100,
            4,
            vec![
                make_symbolic(0, "x", 8),
                compare(CompareOp::Ult, 1, reg(0), imm(10)),
                branch(reg(1), 0x200),
            ],
        )
        .unit(0x104, 4, vec![copy(2, imm(2)), UnitOp::Halt])
        .unit(0x200, 4, vec![copy(2, imm(1)), UnitOp::Halt])
}

#[test]
fn concrete_program_runs_natively() -> Result<()> {
    let mut engine = engine(counting_program(5));
    add_ram(&mut engine);
    engine.create_initial_state(0x100)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    let finished = engine.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].reason, TerminationReason::Halted);
    assert_eq!(finished[0].registers[0].as_constant(), Some(5));
    assert!(finished[0].path_condition.is_empty());

    let stats = engine.dispatcher().stats();
    assert_eq!((stats.native_units, stats.instrumented_units), (6, 0));
    assert_eq!(engine.stats().units, 6);
    assert!(engine.states().is_empty());

    Ok(())
}

#[test]
fn always_instrumented_configuration() -> Result<()> {
    let config = EngineConfig {
        execute_always_instrumented: true,
        ..config()
    };
    let mut engine = engine_with(config, counting_program(5), EnumeratingSolver::default());
    add_ram(&mut engine);
    engine.create_initial_state(0x100)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    assert_eq!(engine.finished()[0].registers[0].as_constant(), Some(5));
    let stats = engine.dispatcher().stats();
    assert_eq!((stats.native_units, stats.instrumented_units), (0, 6));

    Ok(())
}

#[test]
fn instrumented_unit_by_address() -> Result<()> {
    let mut engine = engine(counting_program(3));
    add_ram(&mut engine);
    engine.set_instrumented(0x104, true);
    engine.create_initial_state(0x100)?;

    engine.run()?;
    let stats = engine.dispatcher().stats();
    assert_eq!((stats.native_units, stats.instrumented_units), (3, 1));

    Ok(())
}

#[test]
fn symbolic_branch_explores_both_paths() -> Result<()> {
    let mut engine = engine(symbolic_branch_program());
    add_ram(&mut engine);
    let observer = RecordingObserver::default();
    engine.add_observer(observer.clone());
    let id = engine.create_initial_state(0x100)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    assert_eq!(observer.forks().len(), 1);
    assert_eq!(observer.forks()[0].parent, id);

    // Symbolic registers keep both children off the native path
    assert_eq!(engine.dispatcher().stats().instrumented_units, 3);

    let finished = engine.finished();
    assert_eq!(finished.len(), 2);
    let mut outcomes = finished
        .iter()
        .map(|state| (state.pc, state.registers[2].as_constant()))
        .collect::<Vec<_>>();
    outcomes.sort();
    assert_eq!(outcomes, vec![(0x104, Some(2)), (0x200, Some(1))]);
    assert!(finished.iter().all(|state| state.path_condition.len() == 1));

    // Both children received fresh identifiers
    assert!(finished.iter().all(|state| state.id != id));
    assert_eq!(observer.terminated().len(), 2);

    Ok(())
}

#[test]
fn symbolic_address_is_concretized() -> Result<()> {
    let translator = ScriptedTranslator::new()
        .unit(
            0x100,
            4,
            vec![
                make_symbolic(0, "i", 1),
                add(1, reg(0), imm(0x1800)),
                load(2, reg(1), 1),
            ],
        )
        .unit(0x104, 4, vec![UnitOp::Halt]);
    let mut engine = engine(translator);
    add_ram(&mut engine);
    engine.load(0x1800, &[7, 9])?;
    engine.create_initial_state(0x100)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    let values = engine
        .finished()
        .iter()
        .map(|state| state.registers[2].as_constant())
        .collect::<BTreeSet<_>>();
    assert_eq!(values, BTreeSet::from([Some(7), Some(9)]));
    assert_eq!(engine.fork_engine().stats().concretizations, 2);

    Ok(())
}

#[test]
fn unmapped_access_faults() -> Result<()> {
    let translator =
        ScriptedTranslator::new().unit(0x100, 4, vec![load(0, imm(0x9000), 8), UnitOp::Halt]);
    let mut engine = engine(translator);
    add_ram(&mut engine);
    engine.create_initial_state(0x100)?;

    engine.run()?;
    let finished = engine.finished();
    assert_eq!(finished.len(), 1);
    assert!(matches!(finished[0].reason, TerminationReason::Fault(_)));
    assert_eq!(engine.dispatcher().stats().fallbacks, 1);

    Ok(())
}

#[test]
fn missing_translation_faults() -> Result<()> {
    let mut engine = engine(ScriptedTranslator::new());
    add_ram(&mut engine);
    engine.create_initial_state(0x100)?;

    engine.run()?;
    assert!(matches!(
        engine.finished()[0].reason,
        TerminationReason::Fault(_)
    ));

    Ok(())
}

#[test]
fn undecided_branch_suspends_state() -> Result<()> {
    let x = predicted_variable(0, 8);
    let mut engine = engine_with(
        config(),
        symbolic_branch_program(),
        UndecidedSolver::variables(x.variables().into_keys().collect()),
    );
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    assert!(engine.finished().is_empty());
    assert!(engine.scheduler().is_suspended(id));

    // The state stopped at the branch with its per-unit data intact
    let state = engine.state(id).expect("suspended state exists");
    assert!(state.is_mid_unit());
    assert_eq!(state.pc(), 0x100);
    assert_eq!(state.register(0), &x.resize(64));
    assert_eq!(engine.exit_reason(id), Some(ExitReason::Suspended));

    Ok(())
}

#[test]
fn undecided_address_parks_state_inside_unit() -> Result<()> {
    let x = predicted_variable(0, 8);
    let address = Expr::binary(BinaryOp::Add, x.clone().resize(64), Expr::constant(RAM_BASE, 64));
    let other_values = address
        .clone()
        .equals(Expr::constant(RAM_BASE, 64))
        .not();

    let translator = ScriptedTranslator::new().unit(
        0x100,
        4,
        vec![
            add(0, reg(0), imm(1)),
            add(3, reg(1), imm(RAM_BASE)),
            load(2, reg(3), 1),
            UnitOp::Halt,
        ],
    );
    let mut engine = engine_with(config(), translator, UndecidedSolver::exprs(vec![other_values]));
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;
    assert_eq!(symbol(&mut engine, "x", 8), x);
    engine.set_register(id, 1, x)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    assert_eq!(engine.finished().len(), 1);
    assert_eq!(engine.finished()[0].registers[0].as_constant(), Some(1));

    // The undecided values wait at the load with the prefix of the unit already applied
    let parked = engine.scheduler().suspended().collect::<Vec<_>>();
    assert_eq!(parked.len(), 1);
    let state = engine.state(parked[0]).expect("parked state exists");
    assert!(state.is_mid_unit());
    assert_eq!(state.register(0).as_constant(), Some(1));

    assert!(engine.resume(parked[0]));
    engine.run_for(1)?;
    let finished = engine.finished();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[1].reason, TerminationReason::Halted);
    assert_eq!(finished[1].registers[0].as_constant(), Some(1));

    Ok(())
}

#[test]
fn interrupt_enters_handler() -> Result<()> {
    let translator = ScriptedTranslator::new()
        .unit(0x100, 4, vec![UnitOp::Halt])
        .unit(0x300, 4, vec![copy(5, imm(0x42))])
        .unit(0x304, 4, vec![UnitOp::Halt]);
    let mut engine = engine(translator);
    add_ram(&mut engine);
    engine.load(IDT_BASE + 8 * 3, &0x300u64.to_le_bytes())?;
    let id = engine.create_initial_state(0x100)?;
    engine.set_register(id, 4, Expr::constant(STACK_TOP, 64))?;
    engine.deliver_interrupt(id, Interrupt::new(3))?;

    assert_eq!(engine.run_for(1)?, RunOutcome::UnitLimit);
    let state = engine.state(id).expect("state exists");
    assert_eq!(state.pc(), 0x304);
    assert_eq!(state.register(5).as_constant(), Some(0x42));
    assert_eq!(state.register(4).as_constant(), Some(STACK_TOP - 8));
    assert_eq!(state.pending_interrupts().count(), 0);
    assert_eq!(
        engine.read_memory(id, STACK_TOP - 8, 8)?.as_constant(),
        Some(0x100)
    );
    assert_eq!(engine.stats().interrupts_delivered, 1);

    Ok(())
}

#[test]
fn interrupt_with_symbolic_stack_faults() -> Result<()> {
    let translator = ScriptedTranslator::new().unit(0x100, 4, vec![UnitOp::Halt]);
    let mut engine = engine(translator);
    add_ram(&mut engine);
    engine.load(IDT_BASE + 8, &0x300u64.to_le_bytes())?;
    let id = engine.create_initial_state(0x100)?;
    let sp = symbol(&mut engine, "sp", 64);
    engine.set_register(id, 4, sp)?;
    engine.deliver_interrupt(id, Interrupt::new(1))?;

    engine.run()?;
    assert!(matches!(
        engine.finished()[0].reason,
        TerminationReason::Fault(_)
    ));
    assert_eq!(engine.stats().interrupts_delivered, 0);

    Ok(())
}

#[test]
fn broadcast_reaches_each_state_once() -> Result<()> {
    let mut engine = engine(ScriptedTranslator::new());
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.unsigned_less_than(Expr::constant(5, 8)), true)?;

    assert_eq!(engine.broadcast_interrupt(1, Interrupt::new(3)), 2);
    assert_eq!(engine.broadcast_interrupt(1, Interrupt::new(3)), 0);
    assert_eq!(engine.broadcast_interrupt(2, Interrupt::new(4)), 2);

    let pending = engine
        .state(pair.false_state)
        .expect("state exists")
        .pending_interrupts()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(
        pending,
        vec![Interrupt::new(3).with_event(1), Interrupt::new(4).with_event(2)]
    );

    Ok(())
}

#[test]
fn breakpoint_returns_to_scheduler() -> Result<()> {
    let mut engine = engine(counting_program(10));
    add_ram(&mut engine);
    engine.set_breakpoint(0x100);
    let id = engine.create_initial_state(0x100)?;

    assert_eq!(engine.run_for(1)?, RunOutcome::UnitLimit);
    assert_eq!(engine.exit_reason(id), Some(ExitReason::Breakpoint(0x100)));

    assert!(engine.clear_breakpoint(0x100));
    assert_eq!(engine.exit_reason(id), None);

    Ok(())
}

#[test]
fn time_slice_alternates_states() -> Result<()> {
    let config = EngineConfig {
        state_switch_interval: 3,
        ..config()
    };
    let translator = ScriptedTranslator::new().unit(
        0x100,
        4,
        vec![add(0, reg(0), imm(1)), branch(imm(1), 0x100)],
    );
    let mut engine = engine_with(config, translator, EnumeratingSolver::default());
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x100)?;
    let x = symbol(&mut engine, "x", 8);
    let pair = engine.fork(id, x.unsigned_less_than(Expr::constant(5, 8)), true)?;

    assert_eq!(engine.run_for(12)?, RunOutcome::UnitLimit);
    for id in [pair.true_state, pair.false_state] {
        let state = engine.state(id).expect("state exists");
        assert_eq!(state.register(0).as_constant(), Some(6));
    }
    assert_eq!(engine.stats().state_switches, 4);

    Ok(())
}

#[test]
fn self_modifying_code_leaves_loop() -> Result<()> {
    let translator = ScriptedTranslator::new()
        .unit(0x1100, 4, vec![store(imm(0x1102), imm(0x90), 1)])
        .unit(0x1104, 4, vec![UnitOp::Halt]);
    let mut engine = engine(translator);
    add_ram(&mut engine);
    let id = engine.create_initial_state(0x1100)?;

    assert_eq!(engine.run_for(1)?, RunOutcome::UnitLimit);
    assert_eq!(engine.exit_reason(id), Some(ExitReason::StaleUnit));
    assert_eq!(engine.read_memory(id, 0x1102, 1)?.as_constant(), Some(0x90));

    Ok(())
}

#[test]
fn oversized_access_faults_on_both_paths() -> Result<()> {
    for always_instrumented in [false, true] {
        let config = EngineConfig {
            execute_always_instrumented: always_instrumented,
            ..config()
        };
        let translator = ScriptedTranslator::new().unit(
            0x100,
            4,
            vec![load(2, imm(RAM_BASE), 9), copy(3, imm(7)), UnitOp::Halt],
        );
        let mut engine = engine_with(config, translator, EnumeratingSolver::default());
        add_ram(&mut engine);
        engine.create_initial_state(0x100)?;

        assert_eq!(engine.run()?, RunOutcome::Completed);
        let finished = engine.finished();
        assert_eq!(finished.len(), 1);
        assert!(matches!(finished[0].reason, TerminationReason::Fault(_)));
        assert_eq!(finished[0].registers[3].as_constant(), Some(0));
    }

    Ok(())
}

#[test]
fn malformed_unit_faults_only_its_path() -> Result<()> {
    let translator = ScriptedTranslator::new()
        .unit(
            0x100,
            4,
            vec![
                make_symbolic(0, "x", 8),
                compare(CompareOp::Ult, 1, reg(0), imm(10)),
                branch(reg(1), 0x200),
            ],
        )
        .unit(0x104, 4, vec![UnitOp::Halt])
        .unit(0x200, 4, vec![copy(16, imm(1)), UnitOp::Halt]);
    let mut engine = engine(translator);
    add_ram(&mut engine);
    engine.create_initial_state(0x100)?;

    assert_eq!(engine.run()?, RunOutcome::Completed);
    let reasons = engine
        .finished()
        .iter()
        .map(|state| (state.pc, state.reason.clone()))
        .collect::<Vec<_>>();
    assert_eq!(reasons.len(), 2);
    assert!(reasons.contains(&(0x104, TerminationReason::Halted)));
    assert!(reasons
        .iter()
        .any(|(pc, reason)| *pc == 0x200 && matches!(reason, TerminationReason::Fault(_))));

    Ok(())
}
