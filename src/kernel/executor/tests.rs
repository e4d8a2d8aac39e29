//! Executor tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::*;
use crate::engine::log::ReplicatedLog;
use crate::kernel::traits::ApplyContext;

#[derive(Debug, Serialize, Deserialize)]
enum LedgerCommand {
    Add(u64),
    Fail,
    PoisonPill,
}

#[derive(Debug, Error)]
#[error("ledger refused the command")]
struct LedgerError;

/// Sums `Add` commands; records the block time of the last apply.
#[derive(Default)]
struct LedgerApp {
    total: Arc<AtomicU64>,
    last_block_time: Arc<AtomicU64>,
}

impl ReplicatedApplication for LedgerApp {
    type Command = LedgerCommand;
    type Output = u64;
    type Error = LedgerError;

    fn apply(&self, command: LedgerCommand, ctx: &ApplyContext) -> Result<u64, LedgerError> {
        self.last_block_time.store(ctx.block_time().as_nanos(), Ordering::SeqCst);
        match command {
            LedgerCommand::Add(n) => Ok(self.total.fetch_add(n, Ordering::SeqCst) + n),
            LedgerCommand::Fail => Err(LedgerError),
            LedgerCommand::PoisonPill => panic!("POISON PILL"),
        }
    }
}

fn append(log: &mut ReplicatedLog, command: &LedgerCommand, timestamp_ns: u64) {
    log.append(1, timestamp_ns, bincode::serialize(command).unwrap());
}

#[test]
fn test_applies_in_order_up_to_commit_point() {
    let app = LedgerApp::default();
    let total = app.total.clone();
    let mut executor = Executor::new(app);
    let mut log = ReplicatedLog::new();
    append(&mut log, &LedgerCommand::Add(5), 10);
    append(&mut log, &LedgerCommand::Add(7), 20);
    append(&mut log, &LedgerCommand::Add(100), 30);

    // Nothing committed yet.
    assert_eq!(executor.step(&log, None).unwrap(), StepResult::Idle);

    assert_eq!(
        executor.step(&log, Some(1)).unwrap(),
        StepResult::Applied { index: 0, output: 5 }
    );
    assert_eq!(
        executor.step(&log, Some(1)).unwrap(),
        StepResult::Applied { index: 1, output: 12 }
    );
    // VISIBILITY CONTRACT: index 2 is in the log but not committed.
    assert_eq!(executor.step(&log, Some(1)).unwrap(), StepResult::Idle);
    assert_eq!(total.load(Ordering::SeqCst), 12);
    assert_eq!(executor.applied_index(), Some(1));
}

#[test]
fn test_block_time_comes_from_the_entry() {
    let app = LedgerApp::default();
    let seen = app.last_block_time.clone();
    let mut executor = Executor::new(app);
    let mut log = ReplicatedLog::new();
    append(&mut log, &LedgerCommand::Add(1), 1_700_000_000_000_000_000);

    executor.step(&log, Some(0)).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1_700_000_000_000_000_000);
}

#[test]
fn test_undecodable_payload_is_rejected_and_skipped() {
    let mut executor = Executor::new(LedgerApp::default());
    let mut log = ReplicatedLog::new();
    log.append(1, 0, vec![0xff, 0xff, 0xff, 0xff, 0xff]);
    append(&mut log, &LedgerCommand::Add(3), 0);

    assert!(matches!(
        executor.step(&log, Some(1)).unwrap(),
        StepResult::Rejected { index: 0, .. }
    ));
    assert_eq!(
        executor.step(&log, Some(1)).unwrap(),
        StepResult::Applied { index: 1, output: 3 }
    );
}

#[test]
fn test_poison_pill_halts() {
    let app = LedgerApp::default();
    let total = app.total.clone();
    let mut executor = Executor::new(app);
    let mut log = ReplicatedLog::new();
    append(&mut log, &LedgerCommand::Add(50), 0);
    append(&mut log, &LedgerCommand::PoisonPill, 0);
    append(&mut log, &LedgerCommand::Add(10), 0);

    executor.step(&log, Some(2)).unwrap();
    match executor.step(&log, Some(2)) {
        Err(FatalError::PoisonPill { index: 1, message }) => {
            assert!(message.contains("POISON PILL"));
        }
        other => panic!("expected PoisonPill, got {:?}", other),
    }

    assert!(executor.is_halted());
    assert_eq!(executor.step(&log, Some(2)), Err(FatalError::Halted));
    // The post-poison entry is never applied.
    assert_eq!(total.load(Ordering::SeqCst), 50);
    assert_eq!(executor.next_index(), 1);
}

#[test]
fn test_apply_error_halts() {
    let mut executor = Executor::new(LedgerApp::default());
    let mut log = ReplicatedLog::new();
    append(&mut log, &LedgerCommand::Fail, 0);

    assert!(matches!(
        executor.step(&log, Some(0)),
        Err(FatalError::Application { index: 0, .. })
    ));
    assert_eq!(executor.status(), ExecutorStatus::Halted);
}

#[test]
fn test_missing_committed_entry_halts() {
    let mut executor = Executor::new(LedgerApp::default());
    let log = ReplicatedLog::new();
    assert_eq!(
        executor.step(&log, Some(0)),
        Err(FatalError::Missing { index: 0 })
    );
    assert!(executor.is_halted());
}
