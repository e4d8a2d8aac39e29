//! Uniqueness store: which transaction consumed which state.
//!
//! The store is the replicated state machine's state. On a replica it has
//! exactly one writer (the executor applying committed log entries) and any
//! number of concurrent readers.

pub mod backend;
pub mod store;
pub mod types;


pub use backend::{CommitBatch, JournalBackend, MemoryBackend, StateBackend};
pub use store::UniquenessStore;
pub use types::{
    CommitOutcome, ConflictMap, ConsumedStateType, ConsumingRecord, RequestLogEntry, SecureHash,
    StateConsumption, StateRef, TimeWindow,
};
