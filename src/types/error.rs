use thiserror::Error;

use super::task::RequestId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("In-flight task budget exhausted ({in_flight}/{budget}), retry later")]
    Backpressure { in_flight: usize, budget: usize },

    #[error("Request {0} is already active")]
    DuplicateRequest(RequestId),

    #[error("Request needs {needed} task slots but the in-flight budget is {budget}")]
    RequestTooLarge { needed: usize, budget: usize },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<anyhow::Error> for SchedulerError {
    fn from(e: anyhow::Error) -> Self {
        SchedulerError::Internal(e.to_string())
    }
}

/// Failure attached to a single task. Cloned to every waiter that coalesced
/// onto the same computation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Embedding computation failed: {0}")]
    Compute(String),

    #[error("Embedding computation aborted: {0}")]
    ComputeAborted(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Scheduler shut down before the task ran")]
    ShuttingDown,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
