//! Dispatch core errors

use taskmill_api::{CodecError, QueueError};

/// A response could not be handed to the queue transport
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("failed to encode message: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Lifecycle errors of a [`WorkerCore`](crate::WorkerCore)
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("failed to start the queue: {0}")]
    Queue(#[from] QueueError),

    #[error("dispatch core is already started")]
    AlreadyStarted,

    #[error("dispatch core has been shut down")]
    ShutDown,

    #[error("graceful shutdown timed out with {remaining} tasks in flight")]
    ShutdownTimeout { remaining: usize },
}
