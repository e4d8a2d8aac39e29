mod error;
mod step;

#[cfg(test)]
mod tests;

use crate::kernel::traits::ReplicatedApplication;

pub use error::{ExecutorStatus, FatalError, StepResult};

/// Applies committed log entries to a [`ReplicatedApplication`], one at a
/// time and in index order.
///
/// The executor owns only its cursor and its status. The log and the commit
/// point belong to the replica and are lent to every [`step`](Executor::step),
/// so it can never apply past what the replica has committed. After the first
/// fatal error it stays halted.
pub struct Executor<A: ReplicatedApplication> {
    pub(crate) app: A,
    /// Index of the next entry to apply (not the commit point).
    pub(crate) next_index: u64,
    pub(crate) status: ExecutorStatus,
}

impl<A: ReplicatedApplication> Executor<A> {
    pub fn new(app: A) -> Self {
        Executor {
            app,
            next_index: 0,
            status: ExecutorStatus::Running,
        }
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Highest applied index, if any.
    pub fn applied_index(&self) -> Option<u64> {
        self.next_index.checked_sub(1)
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub fn is_halted(&self) -> bool {
        self.status == ExecutorStatus::Halted
    }
}
