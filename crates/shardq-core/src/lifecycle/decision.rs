//! Decision model: what happens to a task after a failed attempt.

use std::time::Duration;

use super::RetryPolicy;
use crate::domain::{FailureClass, TaskRecord, TransitionReason};

/// The next action after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Back to `pending`, eligible again after `delay`.
    Retry { delay: Duration, retries_left: u32 },

    /// Terminal `failed`.
    Fail {
        reason: TransitionReason,
        retries_left: u32,
    },
}

/// Decides the next action from the row and the failure class.
///
/// Deciders are pure apart from jitter: they never touch the store. The
/// lifecycle functions turn the decision into a `TaskUpdate`.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, failure: FailureClass) -> Decision;
}

/// Retry-budget decider.
///
/// - `Recoverable` and `LeaseExpired` consume one retry; reaching zero fails
///   the task instead of re-queueing it
/// - `Fatal` and `VerificationMismatch` fail immediately and consume nothing
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, failure: FailureClass) -> Decision {
        match failure {
            FailureClass::Fatal => Decision::Fail {
                reason: TransitionReason::FatalError,
                retries_left: task.retries_left,
            },
            FailureClass::VerificationMismatch => Decision::Fail {
                reason: TransitionReason::VerificationMismatch,
                retries_left: task.retries_left,
            },
            FailureClass::Recoverable | FailureClass::LeaseExpired => {
                let retries_left = task.retries_left.saturating_sub(1);
                if retries_left == 0 {
                    Decision::Fail {
                        reason: TransitionReason::RetriesExhausted,
                        retries_left,
                    }
                } else {
                    let delay = self
                        .retry_policy
                        .jittered_delay(task.attempt, &mut rand::thread_rng());
                    Decision::Retry {
                        delay,
                        retries_left,
                    }
                }
            }
        }
    }
}
