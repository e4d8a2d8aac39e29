use std::error::Error;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::NotaryError;

// =============================================================================
// APPLY CONTEXT
// =============================================================================

/// Consensus timestamp of a log entry, in nanoseconds since the Unix epoch.
///
/// Assigned by the primary when it appends the entry, so every replica sees
/// the same value when it applies that entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockTime(pub u64);

impl BlockTime {
    pub fn from_nanos(nanos: u64) -> Self {
        BlockTime(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

/// Deterministic inputs handed to `apply()`.
///
/// Everything here is derived from the log entry being applied, never from
/// the local machine.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    block_time: BlockTime,
    index: u64,
    view: u64,
}

impl ApplyContext {
    pub fn new(block_time: BlockTime, index: u64, view: u64) -> Self {
        ApplyContext {
            block_time,
            index,
            view,
        }
    }

    /// The consensus timestamp, NOT the wall clock.
    #[inline]
    pub fn block_time(&self) -> BlockTime {
        self.block_time
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// View in which the entry was appended.
    #[inline]
    pub fn view(&self) -> u64 {
        self.view
    }
}

// =============================================================================
// ADMISSION
// =============================================================================

/// Leader-side decision taken before a command is appended to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<O> {
    /// Order the command through the log.
    Append,
    /// Answer immediately; the command never reaches the log.
    Reply(O),
    /// Refuse the command outright; the proposer gets the error.
    Refuse(NotaryError),
}

// =============================================================================
// REPLICATED APPLICATION TRAIT
// =============================================================================

/// A deterministic state machine driven by the replicated log.
///
/// # Laws
///
/// 1. `apply()` MUST be deterministic: the same committed prefix yields the
///    same outputs and the same state on every replica.
/// 2. `apply()` is called exactly once per committed entry, in log order.
/// 3. `admit()` runs only on the current primary and MUST NOT mutate state.
pub trait ReplicatedApplication: Send + 'static {
    /// The command carried in log entry payloads.
    type Command: Serialize + DeserializeOwned + Send;

    /// Result of applying (or admitting) a command, returned to the proposer.
    type Output: Clone + Debug + Send + 'static;

    /// A failure while applying. Treated as fatal by the executor: the
    /// replica stops applying rather than diverge from its peers.
    type Error: Error + Send + Sync;

    /// Pre-append check evaluated against the primary's clock.
    fn admit(&self, _command: &Self::Command, _now: BlockTime) -> Admission<Self::Output> {
        Admission::Append
    }

    /// Apply a committed command.
    ///
    /// # Determinism Contract
    ///
    /// No system time (use `ctx.block_time()`), no randomness. Panics are
    /// treated as FATAL.
    fn apply(&self, command: Self::Command, ctx: &ApplyContext) -> Result<Self::Output, Self::Error>;
}
