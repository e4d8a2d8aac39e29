//! Kernel: deterministic execution of committed log entries.
//!
//! The kernel sits between the replication layer and the uniqueness store:
//! - `traits` defines the replicated application contract
//! - `executor` applies committed entries in order, halting on a poison pill
//! - `notary_app` is the notary's application (commit requests → store)

pub mod executor;
pub mod notary_app;
pub mod traits;

pub use executor::{Executor, ExecutorStatus, FatalError, StepResult};
pub use notary_app::{NotaryApp, NotaryCommand};
pub use traits::{Admission, ApplyContext, BlockTime, ReplicatedApplication};
