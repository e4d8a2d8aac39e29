//! Error taxonomy surfaced to notary callers.
//!
//! `Conflict` and `TimeWindowInvalid` are outcomes, not errors: they are
//! carried by [`CommitOutcome`](crate::uniqueness::CommitOutcome). Everything
//! here is either a permanent refusal or a transient condition the
//! [`ClusterClient`](crate::client::ClusterClient) may retry.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the commit coordinator and the cluster client.
/// Serializable so a replica can return them over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NotaryError {
    /// The request signature did not verify against the requester's key.
    #[error("request signature from `{requester}` is invalid")]
    SignatureInvalid { requester: String },

    /// The contacted replica is not the leader.
    #[error("replica is not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u32> },

    /// The replica cannot make progress right now (no quorum, view change,
    /// halted state machine, stopped replica).
    #[error("cluster unavailable: {reason}")]
    Unavailable { reason: String },

    /// The commit did not complete within the coordinator's deadline.
    /// The command may still be applied later.
    #[error("commit timed out after {after:?}")]
    Timeout { after: Duration },

    /// The request would not fit in one durable store record. Refused
    /// before it is ordered, so resubmitting it can never succeed.
    #[error("request needs a {size} byte store record, limit is {limit}")]
    RequestTooLarge { size: u64, limit: u64 },

    /// Failure inside the storage layer of a replica.
    #[error("internal storage error: {message}")]
    InternalStorage { message: String, retryable: bool },
}

impl NotaryError {
    /// Whether retrying the same request (possibly on another replica) can
    /// succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NotaryError::SignatureInvalid { .. } => false,
            NotaryError::NotLeader { .. } => true,
            NotaryError::Unavailable { .. } => true,
            NotaryError::Timeout { .. } => true,
            NotaryError::RequestTooLarge { .. } => false,
            NotaryError::InternalStorage { retryable, .. } => *retryable,
        }
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        NotaryError::Unavailable {
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for NotaryError {
    fn from(e: StorageError) -> Self {
        let retryable = matches!(e, StorageError::Io(_));
        NotaryError::InternalStorage {
            message: e.to_string(),
            retryable,
        }
    }
}

/// Failures of a uniqueness store backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode journal record: {0}")]
    Encode(String),

    #[error(transparent)]
    Journal(#[from] crate::engine::journal::JournalError),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Encode(e.to_string())
    }
}

/// Failure to load or validate the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
