use proptest::prelude::*;
use std::sync::Arc;
use weavemesh::config::JournalConfig;
use weavemesh::escrow::EscrowManager;
use weavemesh::journal::Journal;

#[test]
fn full_slash_of_a_full_hold_leaves_free_balance_unchanged() {
    // deposit(n, a) then slash(n, 100%, a) nets out: the bond goes to the
    // sink and the free balance returns to its pre-deposit level plus the
    // deposit minus the bond.
    let escrow = EscrowManager::new(0.01);
    escrow.deposit("n", 0.50).unwrap();
    let before = escrow.free_balance("n");

    escrow.hold_bond("t", "n", 0.50).unwrap();
    let receipt = escrow.slash_bond("t", 1.0).unwrap();

    assert!((receipt.slashed - 0.50).abs() < 1e-9);
    assert!((escrow.free_balance("n") - (before - 0.50)).abs() < 1e-9);
    assert!((escrow.slashed_sink() - 0.50).abs() < 1e-9);
}

#[test]
fn journal_replay_restores_balances() {
    let dir = tempfile::tempdir().unwrap();
    let config = JournalConfig::at(dir.path().join("journal.jsonl"));
    {
        let journal = Arc::new(Journal::open(config.clone()).unwrap());
        let escrow = EscrowManager::new(0.01).with_journal(journal);
        escrow.deposit("n", 1.0).unwrap();
        escrow.hold_bond("t1", "n", 0.20).unwrap();
        escrow.slash_bond("t1", 0.5).unwrap();
        escrow.hold_bond("t2", "n", 0.10).unwrap();
    }

    let journal = Arc::new(Journal::open(config).unwrap());
    let escrow = EscrowManager::restore(0.01, journal).unwrap();
    // 1.0 deposited − 0.10 slashed − 0.10 still held.
    assert!((escrow.free_balance("n") - 0.80).abs() < 1e-9);
    assert!((escrow.held_total("n") - 0.10).abs() < 1e-9);
    assert!((escrow.slashed_sink() - 0.10).abs() < 1e-9);

    // The restored hold is live: releasing it returns the funds.
    assert!((escrow.release_bond("t2").unwrap() - 0.10).abs() < 1e-9);
    assert!((escrow.free_balance("n") - 0.90).abs() < 1e-9);
}

proptest! {
    // Conservation: free + held = deposits − slashed, across arbitrary
    // interleavings of holds, releases, and slashes.
    #[test]
    fn balances_are_conserved(ops in prop::collection::vec((0u8..4, 0.0f64..1.0), 1..60)) {
        let escrow = EscrowManager::new(0.0001);
        let mut deposits = 0.0f64;
        let mut task_counter = 0u32;
        let mut open_tasks: Vec<String> = Vec::new();

        for (op, amount) in ops {
            let amount = (amount * 100.0).round() / 100.0;
            match op {
                0 => {
                    if escrow.deposit("n", amount).is_ok() {
                        deposits += amount;
                    }
                }
                1 => {
                    let task = format!("t{task_counter}");
                    task_counter += 1;
                    if escrow.hold_bond(&task, "n", amount).is_ok() {
                        open_tasks.push(task);
                    }
                }
                2 => {
                    if let Some(task) = open_tasks.pop() {
                        escrow.release_bond(&task).unwrap();
                    }
                }
                _ => {
                    if let Some(task) = open_tasks.pop() {
                        escrow.slash_bond(&task, amount).unwrap();
                    }
                }
            }
        }

        let total = escrow.free_balance("n") + escrow.held_total("n") + escrow.slashed_sink();
        prop_assert!((total - deposits).abs() < 1e-6);
        prop_assert!(escrow.free_balance("n") >= -1e-9);
    }
}
