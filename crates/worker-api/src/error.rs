//! Task error taxonomy

/// The task cannot be processed right now and should be retried later
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task rejected: {message}")]
pub struct TaskRejectedError {
    pub message: String,
}

impl TaskRejectedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The task can never be processed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task: {message}")]
pub struct InvalidTaskError {
    pub message: String,
}

impl InvalidTaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of a worker invocation that did not produce a response
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Retry the task later
    #[error(transparent)]
    TaskRejected(#[from] TaskRejectedError),

    /// The task is unprocessable
    #[error(transparent)]
    InvalidTask(#[from] InvalidTaskError),

    /// The worker stopped because it was cancelled; no response is produced
    #[error("worker was interrupted")]
    Interrupted,

    /// The worker failed unexpectedly; the general failure result is used
    #[error("worker failed: {0:#}")]
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}
