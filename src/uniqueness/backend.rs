//! Persistence behind the uniqueness store.
//!
//! A backend is a dumb table: the store does all decision making and holds
//! its lock across a whole check-and-write, so backends only have to make
//! each [`CommitBatch`] all-or-nothing.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::journal::{JournalWriter, RecoveryOutcome};
use crate::error::StorageError;

use super::types::{ConsumingRecord, RequestLogEntry, SecureHash, StateRef};

/// Everything a successful commit writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    pub tx_id: SecureHash,
    pub records: Vec<(StateRef, ConsumingRecord)>,
}

pub trait StateBackend: Send + Sync {
    fn get(&self, state: &StateRef) -> Option<ConsumingRecord>;

    fn is_committed(&self, tx_id: &SecureHash) -> bool;

    /// Write every record of the batch, mark the transaction committed and
    /// append `request` to the request log, atomically.
    fn write(&mut self, batch: CommitBatch, request: Option<RequestLogEntry>) -> Result<(), StorageError>;

    fn append_request(&mut self, entry: RequestLogEntry) -> Result<(), StorageError>;

    fn request_log(&self) -> Vec<RequestLogEntry>;

    /// Number of consumed states.
    fn len(&self) -> usize;
}

/// Hash-map backed tables.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    consumed: HashMap<StateRef, ConsumingRecord>,
    committed: HashSet<SecureHash>,
    requests: Vec<RequestLogEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, batch: CommitBatch) {
        for (state, record) in batch.records {
            self.consumed.entry(state).or_insert(record);
        }
        self.committed.insert(batch.tx_id);
    }
}

impl StateBackend for MemoryBackend {
    fn get(&self, state: &StateRef) -> Option<ConsumingRecord> {
        self.consumed.get(state).cloned()
    }

    fn is_committed(&self, tx_id: &SecureHash) -> bool {
        self.committed.contains(tx_id)
    }

    fn write(&mut self, batch: CommitBatch, request: Option<RequestLogEntry>) -> Result<(), StorageError> {
        self.apply(batch);
        self.requests.extend(request);
        Ok(())
    }

    fn append_request(&mut self, entry: RequestLogEntry) -> Result<(), StorageError> {
        self.requests.push(entry);
        Ok(())
    }

    fn request_log(&self) -> Vec<RequestLogEntry> {
        self.requests.clone()
    }

    fn len(&self) -> usize {
        self.consumed.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    Commit {
        batch: CommitBatch,
        request: Option<RequestLogEntry>,
    },
    Request(RequestLogEntry),
}

/// Encoded size of the journal record written when `request` commits
/// `input_count` inputs. Every record of a batch encodes to the same size,
/// so this is exact for `input_count` distinct inputs. Anything unencodable
/// reports `u64::MAX`.
pub fn commit_record_size(input_count: usize, request: &RequestLogEntry) -> u64 {
    let empty = JournalRecord::Commit {
        batch: CommitBatch {
            tx_id: request.tx_id,
            records: Vec::new(),
        },
        request: Some(request.clone()),
    };
    let one = (
        StateRef::new(request.tx_id, 0),
        ConsumingRecord {
            consuming_tx_id: request.tx_id,
            input_index: 0,
            requester: request.requester.clone(),
            recorded_at: request.recorded_at,
        },
    );
    match (bincode::serialized_size(&empty), bincode::serialized_size(&one)) {
        (Ok(base), Ok(per_input)) => per_input.saturating_mul(input_count as u64).saturating_add(base),
        _ => u64::MAX,
    }
}

/// A [`MemoryBackend`] index rebuilt from, and written through to, an
/// append-only journal. A batch is one journal frame: it is either fully
/// recovered or discarded as a torn tail.
#[derive(Debug)]
pub struct JournalBackend {
    index: MemoryBackend,
    journal: JournalWriter,
}

impl JournalBackend {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let (journal, records, outcome) = JournalWriter::open(path)?;
        let mut index = MemoryBackend::new();
        for payload in records {
            match bincode::deserialize::<JournalRecord>(&payload)? {
                JournalRecord::Commit { batch, request } => {
                    index.apply(batch);
                    index.requests.extend(request);
                }
                JournalRecord::Request(entry) => index.requests.push(entry),
            }
        }
        if let RecoveryOutcome::Truncated { discarded_bytes, .. } = outcome {
            debug!(discarded_bytes, "consumption journal recovered after tail repair");
        }
        Ok(JournalBackend { index, journal })
    }

    fn persist(&mut self, record: &JournalRecord) -> Result<(), StorageError> {
        let payload = bincode::serialize(record)?;
        self.journal.append(&payload)?;
        Ok(())
    }
}

impl StateBackend for JournalBackend {
    fn get(&self, state: &StateRef) -> Option<ConsumingRecord> {
        self.index.get(state)
    }

    fn is_committed(&self, tx_id: &SecureHash) -> bool {
        self.index.is_committed(tx_id)
    }

    fn write(&mut self, batch: CommitBatch, request: Option<RequestLogEntry>) -> Result<(), StorageError> {
        let record = JournalRecord::Commit { batch, request };
        self.persist(&record)?;
        if let JournalRecord::Commit { batch, request } = record {
            self.index.write(batch, request)?;
        }
        Ok(())
    }

    fn append_request(&mut self, entry: RequestLogEntry) -> Result<(), StorageError> {
        let record = JournalRecord::Request(entry);
        self.persist(&record)?;
        if let JournalRecord::Request(entry) = record {
            self.index.requests.push(entry);
        }
        Ok(())
    }

    fn request_log(&self) -> Vec<RequestLogEntry> {
        self.index.request_log()
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(tx: SecureHash, states: &[StateRef]) -> CommitBatch {
        CommitBatch {
            tx_id: tx,
            records: states
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    (
                        *s,
                        ConsumingRecord {
                            consuming_tx_id: tx,
                            input_index: i as u32,
                            requester: "O=Alice".into(),
                            recorded_at: 7,
                        },
                    )
                })
                .collect(),
        }
    }

    fn entry(tx: SecureHash) -> RequestLogEntry {
        RequestLogEntry {
            tx_id: tx,
            requester: "O=Alice".into(),
            signature: vec![9; 64],
            recorded_at: 7,
        }
    }

    #[test]
    fn test_commit_record_size_matches_encoding() {
        let tx = SecureHash::sha256(b"tx");
        let states: Vec<StateRef> = (0..5).map(|i| StateRef::new(SecureHash::sha256(b"issue"), i)).collect();
        let record = JournalRecord::Commit {
            batch: batch(tx, &states),
            request: Some(entry(tx)),
        };
        assert_eq!(
            commit_record_size(states.len(), &entry(tx)),
            bincode::serialized_size(&record).unwrap()
        );
        assert!(commit_record_size(0, &entry(tx)) < commit_record_size(1, &entry(tx)));
    }

    #[test]
    fn test_commit_and_request_share_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uniqueness.journal");
        let tx = SecureHash::sha256(b"tx");
        let state = StateRef::new(SecureHash::sha256(b"issue"), 0);

        {
            let mut backend = JournalBackend::open(&path).unwrap();
            backend.write(batch(tx, &[state]), Some(entry(tx))).unwrap();
            assert_eq!(backend.journal.next_sequence(), 1);
        }

        let backend = JournalBackend::open(&path).unwrap();
        assert!(backend.is_committed(&tx));
        assert_eq!(backend.request_log(), vec![entry(tx)]);
    }

    #[test]
    fn test_journal_backend_recovers_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uniqueness.journal");
        let tx = SecureHash::sha256(b"tx");
        let state = StateRef::new(SecureHash::sha256(b"issue"), 0);

        {
            let mut backend = JournalBackend::open(&path).unwrap();
            backend.write(batch(tx, &[state]), None).unwrap();
            backend
                .append_request(RequestLogEntry {
                    tx_id: tx,
                    requester: "O=Alice".into(),
                    signature: vec![1, 2, 3],
                    recorded_at: 7,
                })
                .unwrap();
        }

        let backend = JournalBackend::open(&path).unwrap();
        assert_eq!(backend.get(&state).map(|r| r.consuming_tx_id), Some(tx));
        assert!(backend.is_committed(&tx));
        assert_eq!(backend.request_log().len(), 1);
        assert_eq!(backend.len(), 1);
    }
}
