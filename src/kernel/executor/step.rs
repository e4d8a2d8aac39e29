//! Core step execution logic for the executor.

use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::engine::log::ReplicatedLog;
use crate::kernel::traits::{ApplyContext, BlockTime, ReplicatedApplication};

use super::error::{ExecutorStatus, FatalError, StepResult};
use super::Executor;

impl<A: ReplicatedApplication> Executor<A> {
    /// Execute a single step.
    ///
    /// # Semantics
    ///
    /// 1. If next_index > committed: return StepResult::Idle
    /// 2. Read entry next_index from the log
    /// 3. Decode the payload into a command (undecodable → Rejected)
    /// 4. Construct ApplyContext from the entry metadata
    /// 5. Call app.apply() inside std::panic::catch_unwind
    /// 6. Ok: advance next_index, return Applied.
    ///    Err or panic: set status = Halted, return the fatal error.
    ///
    /// Once halted, all future calls return FatalError::Halted.
    pub fn step(
        &mut self,
        log: &ReplicatedLog,
        committed: Option<u64>,
    ) -> Result<StepResult<A::Output>, FatalError> {
        if self.status == ExecutorStatus::Halted {
            return Err(FatalError::Halted);
        }

        let committed = match committed {
            Some(idx) => idx,
            None => return Ok(StepResult::Idle),
        };
        if self.next_index > committed {
            return Ok(StepResult::Idle);
        }

        let index = self.next_index;
        let entry = match log.get(index) {
            Some(entry) => entry,
            None => return Err(self.halt(FatalError::Missing { index })),
        };

        let command: A::Command = match bincode::deserialize(&entry.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.next_index += 1;
                return Ok(StepResult::Rejected {
                    index,
                    error: format!("undecodable command: {}", e),
                });
            }
        };

        let ctx = ApplyContext::new(BlockTime::from_nanos(entry.timestamp_ns), index, entry.view);

        let app = &self.app;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| app.apply(command, &ctx)));

        match outcome {
            Ok(Ok(output)) => {
                self.next_index += 1;
                Ok(StepResult::Applied { index, output })
            }
            Ok(Err(app_error)) => Err(self.halt(FatalError::Application {
                index,
                message: app_error.to_string(),
            })),
            Err(panic_info) => {
                let message = if let Some(msg) = panic_info.downcast_ref::<&str>() {
                    msg.to_string()
                } else if let Some(msg) = panic_info.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "<unknown panic>".to_string()
                };
                Err(self.halt(FatalError::PoisonPill { index, message }))
            }
        }
    }

    fn halt(&mut self, err: FatalError) -> FatalError {
        error!(error = %err, next_index = self.next_index, "executor halted");
        self.status = ExecutorStatus::Halted;
        err
    }
}
