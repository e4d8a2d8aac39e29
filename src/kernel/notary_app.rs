//! The notary as a replicated application: every replica applies committed
//! commit requests to its own uniqueness store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReplayPolicy;
use crate::engine::format::MAX_PAYLOAD_SIZE;
use crate::error::{NotaryError, StorageError};
use crate::notary::request::CommitRequest;
use crate::uniqueness::backend::commit_record_size;
use crate::uniqueness::{CommitOutcome, RequestLogEntry, UniquenessStore};

use super::traits::{Admission, ApplyContext, BlockTime, ReplicatedApplication};

/// Log payload. Versioned so the encoding can evolve without reinterpreting
/// existing entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotaryCommand {
    CommitTransactionV1(CommitRequest),
}

pub struct NotaryApp {
    store: Arc<UniquenessStore>,
    replay_policy: ReplayPolicy,
}

impl NotaryApp {
    pub fn new(store: Arc<UniquenessStore>, replay_policy: ReplayPolicy) -> Self {
        NotaryApp {
            store,
            replay_policy,
        }
    }

    pub fn store(&self) -> &Arc<UniquenessStore> {
        &self.store
    }
}

fn request_log_entry(request: &CommitRequest, recorded_at: u64) -> RequestLogEntry {
    RequestLogEntry {
        tx_id: request.tx_id,
        requester: request.requester.clone(),
        signature: request.signature.clone(),
        recorded_at,
    }
}

impl ReplicatedApplication for NotaryApp {
    type Command = NotaryCommand;
    type Output = CommitOutcome;
    type Error = StorageError;

    /// A request whose store write could not fit one journal frame is
    /// refused: once ordered it would fail to apply on every replica.
    /// Replays short-circuit (under [`ReplayPolicy::Bypass`]) before the time
    /// window is checked; anything else outside its window is refused here
    /// and never reaches the log.
    fn admit(&self, command: &NotaryCommand, now: BlockTime) -> Admission<CommitOutcome> {
        let NotaryCommand::CommitTransactionV1(request) = command;

        let size = commit_record_size(request.inputs.len(), &request_log_entry(request, now.as_nanos()));
        let limit = u64::from(MAX_PAYLOAD_SIZE);
        if size > limit {
            warn!(tx_id = %request.tx_id.short(), inputs = request.inputs.len(), size, "request too large");
            return Admission::Refuse(NotaryError::RequestTooLarge { size, limit });
        }

        if self.replay_policy == ReplayPolicy::Bypass
            && self.store.is_replay(&request.inputs, &request.tx_id)
        {
            debug!(tx_id = %request.tx_id.short(), "replay of committed transaction");
            return Admission::Reply(CommitOutcome::Success);
        }

        if let Some(window) = request.time_window {
            if !window.contains(now.as_nanos()) {
                debug!(
                    tx_id = %request.tx_id.short(),
                    %window,
                    now = now.as_nanos(),
                    "outside time window"
                );
                return Admission::Reply(CommitOutcome::TimeWindowInvalid {
                    window,
                    evaluated_at: now.as_nanos(),
                });
            }
        }

        Admission::Append
    }

    fn apply(&self, command: NotaryCommand, ctx: &ApplyContext) -> Result<CommitOutcome, StorageError> {
        let NotaryCommand::CommitTransactionV1(request) = command;
        debug!(tx_id = %request.tx_id.short(), index = ctx.index(), view = ctx.view(), "applying commit");

        let entry = request_log_entry(&request, ctx.block_time().as_nanos());
        self.store.commit_logged(&request.inputs, &request.references, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniqueness::{JournalBackend, SecureHash, StateRef, TimeWindow};

    fn request(tx: &str, inputs: Vec<StateRef>) -> CommitRequest {
        CommitRequest::new(inputs, SecureHash::sha256(tx.as_bytes()), "O=Alice")
    }

    fn ctx(time: u64) -> ApplyContext {
        ApplyContext::new(BlockTime::from_nanos(time), 0, 1)
    }

    fn state(index: u32) -> StateRef {
        StateRef::new(SecureHash::sha256(b"issue"), index)
    }

    #[test]
    fn test_window_checked_against_leader_clock() {
        let app = NotaryApp::new(Arc::new(UniquenessStore::in_memory()), ReplayPolicy::Bypass);
        let cmd = NotaryCommand::CommitTransactionV1(
            request("A", vec![state(0)]).with_time_window(TimeWindow::between(100, 200)),
        );

        assert_eq!(app.admit(&cmd, BlockTime::from_nanos(150)), Admission::Append);
        assert_eq!(
            app.admit(&cmd, BlockTime::from_nanos(200)),
            Admission::Reply(CommitOutcome::TimeWindowInvalid {
                window: TimeWindow::between(100, 200),
                evaluated_at: 200,
            })
        );
    }

    #[test]
    fn test_apply_records_request_and_consumption() {
        let store = Arc::new(UniquenessStore::in_memory());
        let app = NotaryApp::new(store.clone(), ReplayPolicy::Bypass);
        let cmd = NotaryCommand::CommitTransactionV1(request("A", vec![state(0)]));

        assert_eq!(app.apply(cmd, &ctx(42)).unwrap(), CommitOutcome::Success);
        assert_eq!(store.record(&state(0)).unwrap().recorded_at, 42);
        assert_eq!(store.request_log().len(), 1);
    }

    #[test]
    fn test_replay_policy_controls_window_recheck() {
        let store = Arc::new(UniquenessStore::in_memory());
        let first = request("A", vec![state(0)]).with_time_window(TimeWindow::until_only(100));
        NotaryApp::new(store.clone(), ReplayPolicy::Bypass)
            .apply(NotaryCommand::CommitTransactionV1(first.clone()), &ctx(50))
            .unwrap();

        let late = NotaryCommand::CommitTransactionV1(first);
        let bypass = NotaryApp::new(store.clone(), ReplayPolicy::Bypass);
        assert_eq!(
            bypass.admit(&late, BlockTime::from_nanos(500)),
            Admission::Reply(CommitOutcome::Success)
        );

        let revalidate = NotaryApp::new(store, ReplayPolicy::Revalidate);
        assert!(matches!(
            revalidate.admit(&late, BlockTime::from_nanos(500)),
            Admission::Reply(CommitOutcome::TimeWindowInvalid { evaluated_at: 500, .. })
        ));
    }

    /// 100 inputs whose records each carry a 200 kB requester name: about
    /// 20 MB in one journal frame.
    fn oversized() -> NotaryCommand {
        let requester = format!("O={}", "x".repeat(200_000));
        let inputs = (0..100).map(state).collect();
        NotaryCommand::CommitTransactionV1(CommitRequest::new(inputs, SecureHash::sha256(b"huge"), requester))
    }

    #[test]
    fn test_oversized_request_refused_before_append() {
        let app = NotaryApp::new(Arc::new(UniquenessStore::in_memory()), ReplayPolicy::Bypass);

        match app.admit(&oversized(), BlockTime::from_nanos(1)) {
            Admission::Refuse(NotaryError::RequestTooLarge { size, limit }) => {
                assert!(size > limit);
                assert_eq!(limit, u64::from(MAX_PAYLOAD_SIZE));
            }
            other => panic!("expected refusal, got {:?}", other),
        }

        let ordinary = NotaryCommand::CommitTransactionV1(request("A", (0..1_000).map(state).collect()));
        assert_eq!(app.admit(&ordinary, BlockTime::from_nanos(1)), Admission::Append);
    }

    #[test]
    fn test_failed_journal_write_logs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JournalBackend::open(&dir.path().join("replica.journal")).unwrap();
        let store = Arc::new(UniquenessStore::with_backend(backend));
        let app = NotaryApp::new(store.clone(), ReplayPolicy::Bypass);

        assert!(app.apply(oversized(), &ctx(1)).is_err());
        assert!(store.request_log().is_empty());
        assert!(store.is_empty());

        let cmd = NotaryCommand::CommitTransactionV1(request("A", vec![state(0)]));
        assert_eq!(app.apply(cmd, &ctx(2)).unwrap(), CommitOutcome::Success);
        assert_eq!(store.request_log().len(), 1);
    }

    #[test]
    fn test_conflicting_request_is_still_logged() {
        let store = Arc::new(UniquenessStore::in_memory());
        let app = NotaryApp::new(store.clone(), ReplayPolicy::Bypass);
        app.apply(NotaryCommand::CommitTransactionV1(request("A", vec![state(0)])), &ctx(1))
            .unwrap();

        let rival = NotaryCommand::CommitTransactionV1(request("B", vec![state(0)]));
        assert!(app.apply(rival, &ctx(2)).unwrap().conflicts().is_some());
        let log = store.request_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].tx_id, SecureHash::sha256(b"B"));
    }

    #[test]
    fn test_foreign_tx_is_not_a_replay() {
        let store = Arc::new(UniquenessStore::in_memory());
        let app = NotaryApp::new(store, ReplayPolicy::Bypass);
        app.apply(NotaryCommand::CommitTransactionV1(request("A", vec![state(0)])), &ctx(1))
            .unwrap();

        let other = NotaryCommand::CommitTransactionV1(request("B", vec![state(0)]));
        assert_eq!(app.admit(&other, BlockTime::from_nanos(2)), Admission::Append);
    }
}
