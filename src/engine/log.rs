//! In-memory replicated command log.
//!
//! Entries are hash chained: `hash = BLAKE3(prev_hash || index || view ||
//! timestamp_ns || payload)` truncated to 16 bytes, so two replicas agree on
//! an entry (and everything before it) iff they agree on its hash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::format::GENESIS_HASH;

/// One replicated command with its consensus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    /// View in which the primary appended this entry.
    pub view: u64,
    /// Consensus timestamp assigned by the primary.
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
    pub prev_hash: [u8; 16],
    pub hash: [u8; 16],
}

impl LogEntry {
    fn compute_hash(prev_hash: &[u8; 16], index: u64, view: u64, timestamp_ns: u64, payload: &[u8]) -> [u8; 16] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(prev_hash);
        hasher.update(&index.to_le_bytes());
        hasher.update(&view.to_le_bytes());
        hasher.update(&timestamp_ns.to_le_bytes());
        hasher.update(payload);
        let mut out = [0u8; 16];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        out
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == Self::compute_hash(&self.prev_hash, self.index, self.view, self.timestamp_ns, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("out of order append: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("entry {index} does not extend the local hash chain")]
    ChainMismatch { index: u64 },

    #[error("log diverges from the applied prefix at index {index}")]
    Divergence { index: u64 },
}

/// Ordered log of commands. Index 0 is the first entry.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        ReplicatedLog { entries: Vec::new() }
    }

    /// Primary path: append a new command, returning its index.
    pub fn append(&mut self, view: u64, timestamp_ns: u64, payload: Vec<u8>) -> u64 {
        let index = self.next_index();
        let prev_hash = self.tail_hash();
        let hash = LogEntry::compute_hash(&prev_hash, index, view, timestamp_ns, &payload);
        self.entries.push(LogEntry {
            index,
            view,
            timestamp_ns,
            payload,
            prev_hash,
            hash,
        });
        index
    }

    /// Backup path: append an entry produced by the primary.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let expected = self.next_index();
        if entry.index != expected {
            return Err(LogError::OutOfOrder {
                expected,
                got: entry.index,
            });
        }
        if entry.prev_hash != self.tail_hash() || !entry.verify_hash() {
            return Err(LogError::ChainMismatch { index: entry.index });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Replace this log with `other`, which must agree on every entry up to
    /// and including `applied` (entries that already reached the state
    /// machine can never change).
    pub fn adopt(&mut self, other: Vec<LogEntry>, applied: Option<u64>) -> Result<(), LogError> {
        if let Some(applied) = applied {
            let ours = self.get(applied).map(|e| e.hash);
            let theirs = other.get(applied as usize).map(|e| e.hash);
            if ours.is_none() || ours != theirs {
                return Err(LogError::Divergence { index: applied });
            }
        }

        let mut prev = GENESIS_HASH;
        for (i, entry) in other.iter().enumerate() {
            if entry.index != i as u64 {
                return Err(LogError::OutOfOrder {
                    expected: i as u64,
                    got: entry.index,
                });
            }
            if entry.prev_hash != prev || !entry.verify_hash() {
                return Err(LogError::ChainMismatch { index: entry.index });
            }
            prev = entry.hash;
        }

        self.entries = other;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    /// Entries `[from, to]`, clamped to what exists.
    pub fn read_range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from > to || from >= self.next_index() {
            return Vec::new();
        }
        let end = (to + 1).min(self.next_index());
        self.entries[from as usize..end as usize].to_vec()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn next_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    pub fn tail_hash(&self) -> [u8; 16] {
        self.entries.last().map(|e| e.hash).unwrap_or(GENESIS_HASH)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(payloads: &[&[u8]]) -> ReplicatedLog {
        let mut log = ReplicatedLog::new();
        for p in payloads {
            log.append(1, 100, p.to_vec());
        }
        log
    }

    #[test]
    fn test_backup_replicates_primary_entries() {
        let primary = log_with(&[b"a", b"b", b"c"]);
        let mut backup = ReplicatedLog::new();
        for entry in primary.entries() {
            backup.append_entry(entry.clone()).unwrap();
        }
        assert_eq!(backup.tail_hash(), primary.tail_hash());
        assert_eq!(backup.last_index(), Some(2));
    }

    #[test]
    fn test_gap_and_tampering_rejected() {
        let primary = log_with(&[b"a", b"b"]);
        let mut backup = ReplicatedLog::new();
        assert_eq!(
            backup.append_entry(primary.entries()[1].clone()),
            Err(LogError::OutOfOrder { expected: 0, got: 1 })
        );

        let mut forged = primary.entries()[0].clone();
        forged.payload = b"z".to_vec();
        assert_eq!(backup.append_entry(forged), Err(LogError::ChainMismatch { index: 0 }));
    }

    #[test]
    fn test_adopt_keeps_applied_prefix() {
        let mut ours = log_with(&[b"a", b"b"]);
        let mut theirs = log_with(&[b"a", b"b"]);
        theirs.append(2, 200, b"c".to_vec());

        ours.adopt(theirs.entries().to_vec(), Some(1)).unwrap();
        assert_eq!(ours.next_index(), 3);

        let divergent = log_with(&[b"x", b"y", b"z"]);
        assert_eq!(
            ours.adopt(divergent.entries().to_vec(), Some(0)),
            Err(LogError::Divergence { index: 0 })
        );
    }

    #[test]
    fn test_read_range_clamps() {
        let log = log_with(&[b"a", b"b", b"c"]);
        assert_eq!(log.read_range(1, 10).len(), 2);
        assert!(log.read_range(5, 10).is_empty());
        assert!(log.read_range(2, 1).is_empty());
    }
}
