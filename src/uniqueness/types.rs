use std::fmt;

use indexmap::IndexMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 hash identifying a transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecureHash(pub [u8; 32]);

impl SecureHash {
    pub const ZERO: SecureHash = SecureHash([0u8; 32]);

    /// Hash arbitrary bytes with SHA-256.
    pub fn sha256(bytes: &[u8]) -> Self {
        SecureHash(Sha256::digest(bytes).into())
    }

    /// A uniformly random hash. Used for generated transactions.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        SecureHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated hex, handy in log lines.
    pub fn short(&self) -> String {
        hex::encode_upper(&self.0[..4])
    }
}

impl fmt::Display for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureHash({})", self.short())
    }
}

/// An output of a prior transaction: the unit of uniqueness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    pub tx_hash: SecureHash,
    pub index: u32,
}

impl StateRef {
    pub fn new(tx_hash: SecureHash, index: u32) -> Self {
        StateRef { tx_hash, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tx_hash, self.index)
    }
}

/// Who consumed a state, and when.
///
/// Written exactly once per state and never modified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumingRecord {
    pub consuming_tx_id: SecureHash,
    /// Position of the state in the consuming request's input list.
    pub input_index: u32,
    pub requester: String,
    /// Consensus timestamp of the log entry that recorded this state,
    /// nanoseconds since the Unix epoch.
    pub recorded_at: u64,
}

/// How the conflicting request referred to an already consumed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumedStateType {
    Input,
    Reference,
}

/// One entry of a conflict report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConsumption {
    pub record: ConsumingRecord,
    pub kind: ConsumedStateType,
}

/// Conflicting states in the order the request listed them.
pub type ConflictMap = IndexMap<StateRef, StateConsumption>;

/// Validity interval of a transaction: `from` inclusive, `until` exclusive.
/// At least one bound is normally present; an unbounded window is always valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: Option<u64>,
    pub until: Option<u64>,
}

impl TimeWindow {
    pub fn between(from_ns: u64, until_ns: u64) -> Self {
        TimeWindow {
            from: Some(from_ns),
            until: Some(until_ns),
        }
    }

    pub fn from_only(from_ns: u64) -> Self {
        TimeWindow {
            from: Some(from_ns),
            until: None,
        }
    }

    pub fn until_only(until_ns: u64) -> Self {
        TimeWindow {
            from: None,
            until: Some(until_ns),
        }
    }

    /// `from <= now < until`.
    pub fn contains(&self, now_ns: u64) -> bool {
        let after_start = self.from.map_or(true, |from| now_ns >= from);
        let before_end = self.until.map_or(true, |until| now_ns < until);
        after_start && before_end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.from, self.until) {
            (Some(from), Some(until)) => write!(f, "[{}, {})", from, until),
            (Some(from), None) => write!(f, "[{}, ∞)", from),
            (None, Some(until)) => write!(f, "(-∞, {})", until),
            (None, None) => f.write_str("(-∞, ∞)"),
        }
    }
}

/// Result of a commit attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// Every input is now (or was already) recorded against the transaction.
    Success,
    /// Some requested states are already consumed.
    Conflict(ConflictMap),
    /// The leader's clock was outside the transaction's time window.
    TimeWindowInvalid { window: TimeWindow, evaluated_at: u64 },
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitOutcome::Success)
    }

    pub fn conflicts(&self) -> Option<&ConflictMap> {
        match self {
            CommitOutcome::Conflict(map) => Some(map),
            _ => None,
        }
    }
}

/// Audit entry for a notarisation request that reached the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub tx_id: SecureHash,
    pub requester: String,
    pub signature: Vec<u8>,
    pub recorded_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_window_bounds() {
        let window = TimeWindow::between(100, 200);
        assert!(!window.contains(99));
        assert!(window.contains(100));
        assert!(window.contains(199));
        assert!(!window.contains(200));

        assert!(TimeWindow::from_only(5).contains(u64::MAX));
        assert!(!TimeWindow::until_only(5).contains(5));
        assert!(TimeWindow { from: None, until: None }.contains(0));
    }

    #[test]
    fn empty_window_never_contains() {
        let window = TimeWindow::between(0, 0);
        assert!(!window.contains(0));
        assert!(!window.contains(1));
    }

    #[test]
    fn secure_hash_display_is_upper_hex() {
        let hash = SecureHash::sha256(b"abc");
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("BA7816BF"));
        assert_eq!(hash.short(), "BA7816BF");
    }
}
