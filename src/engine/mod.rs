//! Storage engine: journal framing, the replicated command log, the shared
//! commit point and the durable view fence.

pub mod committed;
pub mod format;
pub mod journal;
pub mod log;
pub mod manifest;

pub use committed::CommittedState;
pub use journal::{JournalError, JournalWriter, RecoveryOutcome};
pub use log::{LogEntry, LogError, ReplicatedLog};
pub use manifest::{Manifest, ViewFenceError};
