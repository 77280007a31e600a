//! Queue transport contracts
//!
//! A transport implements [`WorkerQueue`] and hands every inbound delivery to
//! the [`TaskCallback`] it was started with.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{InvalidTaskError, TaskRejectedError};
use crate::health::HealthResult;
use crate::task_information::TaskInformation;

/// Message headers
pub type Headers = HashMap<String, String>;

/// Header names the dispatch core reads from inbound messages
pub mod headers {
    /// Maximum number of deliveries before a message is poison
    pub const RETRY_LIMIT: &str = "x-taskmill-retry-limit";

    /// Number of times the message has been delivered before
    pub const RETRY_COUNT: &str = "x-taskmill-retry-count";

    /// Set when the message was previously rejected; the value is the reason
    pub const REJECTED: &str = "x-taskmill-rejected";
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue has been shut down")]
    Shutdown,
}

/// Why an inbound message could not be registered
#[derive(Debug, thiserror::Error)]
pub enum TaskCallbackError {
    /// The message can never be processed; the transport should not redeliver it
    #[error(transparent)]
    InvalidTask(#[from] InvalidTaskError),

    /// The message should be redelivered later
    #[error(transparent)]
    TaskRejected(#[from] TaskRejectedError),
}

/// Receives inbound deliveries from a queue transport
#[async_trait]
pub trait TaskCallback: Send + Sync {
    /// Register a newly delivered message
    async fn register_new_task(
        &self,
        task_information: Arc<TaskInformation>,
        task_message: &[u8],
        headers: Headers,
    ) -> Result<(), TaskCallbackError>;

    /// Abandon all in-flight work, e.g. after the transport lost its connection
    fn abort_tasks(&self);
}

/// Queue transport used by the dispatch core
#[async_trait]
pub trait WorkerQueue: Send + Sync {
    /// Start consuming the input queue, delivering to `callback`
    async fn start(&self, callback: Arc<dyn TaskCallback>) -> Result<(), QueueError>;

    /// Publish a message
    ///
    /// When `acknowledgement` is given, the transport counts an
    /// acknowledgement on it once the publish is confirmed and acknowledges
    /// the inbound message when all of its responses are acknowledged.
    async fn publish(
        &self,
        acknowledgement: Option<&Arc<TaskInformation>>,
        message: Vec<u8>,
        target_queue: &str,
        headers: &Headers,
        priority: Option<u32>,
        is_last_message: bool,
    ) -> Result<(), QueueError>;

    /// Return the inbound message to the queue for redelivery
    async fn reject_task(&self, task_information: &Arc<TaskInformation>);

    /// Drop the inbound message without redelivery
    async fn discard_task(&self, task_information: &Arc<TaskInformation>);

    /// Count one response of the inbound message as handled without a publish
    async fn acknowledge_task(&self, task_information: &Arc<TaskInformation>);

    /// Name of the queue this worker consumes
    fn input_queue(&self) -> &str;

    /// Queue for tasks of paused jobs, if configured
    fn paused_queue(&self) -> Option<&str>;

    /// Stop taking new deliveries
    fn disconnect_incoming(&self);

    /// Resume taking new deliveries
    fn reconnect_incoming(&self);

    async fn health_check(&self) -> HealthResult;

    async fn shutdown(&self);
}
