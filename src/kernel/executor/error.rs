//! Executor error types and status enums.

use thiserror::Error;

// =============================================================================
// EXECUTOR STATUS
// =============================================================================

/// Terminal status of the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorStatus {
    Running,
    /// A poison pill or a failed apply stopped execution.
    /// No further entries will be processed.
    Halted,
}

// =============================================================================
// STEP RESULT
// =============================================================================

/// Result of a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult<O> {
    /// Caught up with the commit point.
    Idle,

    /// Entry was applied.
    Applied { index: u64, output: O },

    /// Entry payload could not be decoded into a command. Every replica
    /// rejects it the same way, so the cursor still advances.
    Rejected { index: u64, error: String },
}

// =============================================================================
// FATAL ERROR
// =============================================================================

/// Errors that halt the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// `apply()` panicked.
    #[error("poison pill at index {index}: {message}")]
    PoisonPill { index: u64, message: String },

    /// Already halted; all calls after the first fatal error return this.
    #[error("executor is halted")]
    Halted,

    /// The commit point covers an index the local log does not hold.
    #[error("committed entry {index} is missing from the local log")]
    Missing { index: u64 },

    /// `apply()` returned an error.
    #[error("apply failed at index {index}: {message}")]
    Application { index: u64, message: String },
}
