use indexmap::IndexSet;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::StorageError;

use super::backend::{CommitBatch, MemoryBackend, StateBackend};
use super::types::{
    CommitOutcome, ConflictMap, ConsumedStateType, ConsumingRecord, RequestLogEntry, SecureHash,
    StateConsumption, StateRef,
};

/// Authoritative map from consumed state to the transaction that consumed it.
///
/// # Invariants
///
/// 1. **Disjointness**: every state maps to at most one transaction.
/// 2. **Write once**: a record is never modified or removed.
/// 3. **Atomic commit**: a commit writes all of its inputs or none.
///
/// `commit_if_free` holds the write lock for its whole check-and-write, so
/// concurrent commits on overlapping states serialise and exactly one wins.
/// `get` takes the read lock and never observes a partially applied commit.
pub struct UniquenessStore {
    backend: RwLock<Box<dyn StateBackend>>,
}

impl UniquenessStore {
    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn with_backend(backend: impl StateBackend + 'static) -> Self {
        UniquenessStore {
            backend: RwLock::new(Box::new(backend)),
        }
    }

    /// Record `inputs` as consumed by `tx_id` unless any of them, or any of
    /// `references`, is already consumed by another transaction.
    ///
    /// Duplicate states in either list are ignored (first position wins).
    /// Replaying an already committed transaction returns `Success` without
    /// writing anything.
    pub fn commit_if_free(
        &self,
        inputs: &[StateRef],
        references: &[StateRef],
        tx_id: SecureHash,
        requester: &str,
        recorded_at: u64,
    ) -> Result<CommitOutcome, StorageError> {
        self.commit(inputs, references, tx_id, requester, recorded_at, None)
    }

    /// [`commit_if_free`](Self::commit_if_free) on behalf of `request`,
    /// which is appended to the request log whatever the outcome. The log
    /// entry and the consumption records are one write: a failed commit
    /// leaves no trace of either.
    pub fn commit_logged(
        &self,
        inputs: &[StateRef],
        references: &[StateRef],
        request: RequestLogEntry,
    ) -> Result<CommitOutcome, StorageError> {
        let (tx_id, recorded_at) = (request.tx_id, request.recorded_at);
        let requester = request.requester.clone();
        self.commit(inputs, references, tx_id, &requester, recorded_at, Some(request))
    }

    fn commit(
        &self,
        inputs: &[StateRef],
        references: &[StateRef],
        tx_id: SecureHash,
        requester: &str,
        recorded_at: u64,
        request: Option<RequestLogEntry>,
    ) -> Result<CommitOutcome, StorageError> {
        let inputs: IndexSet<StateRef> = inputs.iter().copied().collect();
        let references: IndexSet<StateRef> = references
            .iter()
            .copied()
            .filter(|r| !inputs.contains(r))
            .collect();

        let mut backend = self.backend.write();

        let mut existing = ConflictMap::new();
        for (state, kind) in inputs
            .iter()
            .map(|s| (s, ConsumedStateType::Input))
            .chain(references.iter().map(|s| (s, ConsumedStateType::Reference)))
        {
            if let Some(record) = backend.get(state) {
                existing.insert(*state, StateConsumption { record, kind });
            }
        }

        if !existing.is_empty() {
            let outcome = if existing.values().all(|c| c.record.consuming_tx_id == tx_id) {
                trace!(tx_id = %tx_id.short(), "replay of committed transaction");
                CommitOutcome::Success
            } else if inputs.is_empty() && backend.is_committed(&tx_id) {
                trace!(tx_id = %tx_id.short(), "replay of committed input-less transaction");
                CommitOutcome::Success
            } else {
                debug!(
                    tx_id = %tx_id.short(),
                    conflicts = existing.len(),
                    "commit rejected: states already consumed"
                );
                CommitOutcome::Conflict(existing)
            };
            if let Some(entry) = request {
                backend.append_request(entry)?;
            }
            return Ok(outcome);
        }

        let records = inputs
            .iter()
            .enumerate()
            .map(|(position, state)| {
                (
                    *state,
                    ConsumingRecord {
                        consuming_tx_id: tx_id,
                        input_index: position as u32,
                        requester: requester.to_string(),
                        recorded_at,
                    },
                )
            })
            .collect();
        backend.write(CommitBatch { tx_id, records }, request)?;

        debug!(tx_id = %tx_id.short(), inputs = inputs.len(), "transaction committed");
        Ok(CommitOutcome::Success)
    }

    /// The transaction that consumed `state`, if any.
    pub fn get(&self, state: &StateRef) -> Option<SecureHash> {
        self.backend.read().get(state).map(|r| r.consuming_tx_id)
    }

    /// The full consumption record of `state`, if any.
    pub fn record(&self, state: &StateRef) -> Option<ConsumingRecord> {
        self.backend.read().get(state)
    }

    pub fn is_committed(&self, tx_id: &SecureHash) -> bool {
        self.backend.read().is_committed(tx_id)
    }

    /// True when `tx_id` was committed before and every one of `inputs` is
    /// recorded against it, i.e. resubmitting would be a no-op.
    pub fn is_replay(&self, inputs: &[StateRef], tx_id: &SecureHash) -> bool {
        let backend = self.backend.read();
        backend.is_committed(tx_id)
            && inputs
                .iter()
                .all(|s| backend.get(s).map(|r| r.consuming_tx_id) == Some(*tx_id))
    }

    pub fn log_request(&self, entry: RequestLogEntry) -> Result<(), StorageError> {
        self.backend.write().append_request(entry)
    }

    pub fn request_log(&self) -> Vec<RequestLogEntry> {
        self.backend.read().request_log()
    }

    /// Number of consumed states.
    pub fn len(&self) -> usize {
        self.backend.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for UniquenessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniquenessStore")
            .field("consumed", &self.len())
            .finish()
    }
}
