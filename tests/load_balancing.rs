mod common;

use std::collections::BTreeSet;

use common::*;
use symex_executor::balance::InMemoryCoordinator;
use symex_executor::state::MIGRATION_PREFIX;
use symex_executor::{EngineConfig, EngineContext, Result, RunOutcome};

fn worker(worker_id: u16, load_balance_period: u64, coordinator: &InMemoryCoordinator) -> EngineContext {
    let config = EngineConfig {
        worker_id,
        load_balance_period,
        ..Default::default()
    };
    let (program, _) = Program::new().decision_tree(0x100, 3);
    let mut engine = engine(config, program);
    engine.set_coordinator(coordinator.clone());
    engine
}

fn halted_values(engine: &EngineContext) -> Vec<u64> {
    engine
        .finished()
        .iter()
        .filter_map(|state| state.registers[1].as_constant())
        .collect()
}

#[test]
fn busy_worker_shares_paths_with_idle_peer() -> Result<()> {
    let coordinator = InMemoryCoordinator::new();
    let mut busy = worker(0, 1, &coordinator);
    let mut idle = worker(1, 0, &coordinator);

    // The idle worker announces itself before the busy one starts forking
    idle.bookkeeping_pass();
    busy.create_initial_state(0x100)?;
    assert_eq!(busy.run()?, RunOutcome::Completed);

    let exported = busy.balancer().stats().exported;
    assert!(exported > 0);
    assert_eq!(coordinator.pending(1) as u64, exported);

    let imported = idle.import_states()?;
    assert_eq!(imported.len() as u64, exported);
    assert!(imported.iter().all(|id| id.prefix() == MIGRATION_PREFIX));
    assert_eq!(idle.run()?, RunOutcome::Completed);

    // Together the workers covered every path exactly once
    let mut values = halted_values(&busy);
    values.extend(halted_values(&idle));
    assert_eq!(values.len(), 8);
    assert_eq!(values.into_iter().collect::<BTreeSet<_>>(), (0..8).collect());
    assert!(!idle.finished().is_empty());

    // No identifier is used by both workers
    let busy_ids = busy.finished().iter().map(|s| s.id).collect::<BTreeSet<_>>();
    assert!(idle.finished().iter().all(|s| !busy_ids.contains(&s.id)));

    Ok(())
}

#[test]
fn workers_exchange_states_while_running() -> Result<()> {
    let coordinator = InMemoryCoordinator::new();
    let mut a = worker(0, 2, &coordinator);
    let mut b = worker(1, 2, &coordinator);

    b.bookkeeping_pass();
    a.create_initial_state(0x100)?;

    let drained = |worker: &EngineContext| {
        worker.scheduler().runnable_count() == 0 && coordinator.pending(worker.worker_id()) == 0
    };

    let mut rounds = 0;
    loop {
        a.run_for(4)?;
        b.import_states()?;
        b.run_for(4)?;
        a.import_states()?;

        if drained(&a) && drained(&b) {
            break;
        }

        rounds += 1;
        assert!(rounds < 100, "exploration did not converge");
    }

    let mut values = halted_values(&a);
    values.extend(halted_values(&b));
    assert_eq!(values.len(), 8);
    assert_eq!(values.into_iter().collect::<BTreeSet<_>>(), (0..8).collect());

    let a_stats = a.balancer().stats();
    let b_stats = b.balancer().stats();
    assert_eq!(
        a_stats.exported + b_stats.exported,
        a_stats.imported + b_stats.imported
    );
    assert!(a_stats.exported > 0);

    Ok(())
}
