//! Worker contracts
//!
//! A [`WorkerFactory`] builds a [`Worker`] for each [`WorkerTask`]. The
//! dispatch core calls [`Worker::do_work`] and turns its outcome into the
//! task's final response. Factories may offer extra capabilities through
//! [`WorkerFactory::capabilities`].
//!
//! # Example
//!
//! ```ignore
//! struct EchoWorker {
//!     task: Arc<dyn WorkerTask>,
//! }
//!
//! #[async_trait]
//! impl Worker for EchoWorker {
//!     async fn do_work(&self) -> Result<WorkerResponse, WorkerError> {
//!         Ok(WorkerResponse::success("echo-out", "echo", 1, self.task.data().to_vec()))
//!     }
//!
//!     fn worker_identifier(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn worker_api_version(&self) -> u32 {
//!         1
//!     }
//!
//!     fn general_failure_result(&self, error: &anyhow::Error) -> WorkerResponse {
//!         WorkerResponse::exception("echo-out", "echo", 1, error.to_string().into_bytes())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{InvalidTaskError, TaskRejectedError, WorkerError};
use crate::health::HealthResult;
use crate::message::{SourceInfo, TaskMessage, TaskStatus, TrackingInfo};
use crate::queue::Headers;

/// A response produced by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Destination queue; `None` for dead-end workers
    pub queue: Option<String>,
    pub status: TaskStatus,
    pub data: Vec<u8>,
    /// Classifier of `data`
    pub message_type: String,
    pub api_version: u32,
    /// Side-channel data stored in the outgoing context
    pub context: Option<Vec<u8>>,
    /// Only failures are published; a successful response is acknowledged
    pub errors_only: bool,
}

impl WorkerResponse {
    pub fn new(
        queue: Option<String>,
        status: TaskStatus,
        message_type: impl Into<String>,
        api_version: u32,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            queue,
            status,
            data: data.into(),
            message_type: message_type.into(),
            api_version,
            context: None,
            errors_only: false,
        }
    }

    /// A successful result for `queue`
    pub fn success(
        queue: impl Into<String>,
        message_type: impl Into<String>,
        api_version: u32,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            Some(queue.into()),
            TaskStatus::ResultSuccess,
            message_type,
            api_version,
            data,
        )
    }

    /// A failed result for `queue`
    pub fn failure(
        queue: impl Into<String>,
        message_type: impl Into<String>,
        api_version: u32,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            Some(queue.into()),
            TaskStatus::ResultFailure,
            message_type,
            api_version,
            data,
        )
    }

    /// An unexpected-fault result for `queue`
    pub fn exception(
        queue: impl Into<String>,
        message_type: impl Into<String>,
        api_version: u32,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            Some(queue.into()),
            TaskStatus::ResultException,
            message_type,
            api_version,
            data,
        )
    }

    /// Attach side-channel context
    pub fn with_context(mut self, context: impl Into<Vec<u8>>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Publish only if the response is a failure
    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }

    /// Destination after applying the errors-only rule
    pub fn effective_queue(&self) -> Option<&str> {
        if self.errors_only && self.status.is_successful_response() {
            return None;
        }
        self.queue.as_deref()
    }
}

/// A task as seen by worker code
///
/// Workers read the task and report responses through it. Any number of
/// [`add_response`](WorkerTask::add_response) calls may precede exactly one
/// final call to `set_response`, `set_task_rejected` or `set_invalid_task`.
#[async_trait]
pub trait WorkerTask: Send + Sync {
    fn classifier(&self) -> &str;

    fn version(&self) -> u32;

    fn status(&self) -> TaskStatus;

    fn data(&self) -> &[u8];

    fn context(&self) -> &HashMap<String, Vec<u8>>;

    fn correlation_id(&self) -> Option<&str>;

    fn tracking_info(&self) -> Option<&TrackingInfo>;

    fn source_info(&self) -> Option<&SourceInfo>;

    fn headers(&self) -> &Headers;

    /// Whether the message exceeded its retry limit
    fn is_poison(&self) -> bool;

    /// Whether a final response has been set
    fn is_response_set(&self) -> bool;

    /// Publish an intermediate response
    async fn add_response(&self, response: WorkerResponse, include_task_context: bool);

    /// Set the final response
    async fn set_response(&self, response: WorkerResponse);

    /// Finish by returning the task to the queue for a later retry
    async fn set_task_rejected(&self, error: TaskRejectedError);

    /// Finish by reporting the task as unprocessable
    async fn set_invalid_task(&self, error: InvalidTaskError);
}

/// Processes one task
#[async_trait]
pub trait Worker: Send + Sync {
    /// Perform the work
    ///
    /// Returning [`WorkerError::Interrupted`] means no response is produced.
    /// Return [`WorkerError::Failed`] for any unexpected failure so the
    /// general failure result is published instead.
    ///
    /// # Panics
    ///
    /// A panic escaping `do_work` is treated as a broken execution substrate:
    /// the core hands it to its fatal handler, which by default logs and
    /// exits the process. Workers must not rely on panics for error reporting.
    async fn do_work(&self) -> Result<WorkerResponse, WorkerError>;

    fn worker_identifier(&self) -> &str;

    fn worker_api_version(&self) -> u32;

    /// Response used when `do_work` fails unexpectedly; must always succeed
    fn general_failure_result(&self, error: &anyhow::Error) -> WorkerResponse;
}

/// Cursor over the tasks available to one bulk invocation
#[async_trait]
pub trait BulkWorkerRuntime: Send {
    /// Next task without waiting; the first call always returns a task
    async fn next_task(&mut self) -> Option<Arc<dyn WorkerTask>>;

    /// Next task, waiting up to `wait` for one to arrive
    async fn next_task_within(&mut self, wait: Duration) -> Option<Arc<dyn WorkerTask>>;
}

/// Processes many tasks per invocation
///
/// Every task pulled from the runtime must be given a final response before
/// `process_tasks` returns; tasks left without one are retried individually.
#[async_trait]
pub trait BulkWorker: Send + Sync {
    async fn process_tasks(&self, runtime: &mut dyn BulkWorkerRuntime) -> anyhow::Result<()>;
}

/// What to do with a task addressed to a different queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DivertedTaskAction {
    Discard,
    Execute,
    Forward,
}

/// Decides what happens to diverted tasks
#[async_trait]
pub trait DivertedTaskHandler: Send + Sync {
    async fn handle_diverted_task(
        &self,
        message: &TaskMessage,
        input_queue: &str,
        headers: &Headers,
    ) -> DivertedTaskAction;
}

/// Forwarding decision for a diverted task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingDecision {
    /// Forward to `to`, or acknowledge when `None`
    Forward { to: Option<String> },
    Discard,
}

/// Fully determines how diverted tasks are forwarded
#[async_trait]
pub trait TaskForwardingEvaluator: Send + Sync {
    async fn determine_forwarding_action(
        &self,
        message: &TaskMessage,
        input_queue: &str,
        headers: &Headers,
    ) -> ForwardingDecision;
}

/// Optional capabilities of a worker factory
#[derive(Clone, Default)]
pub struct FactoryCapabilities {
    pub bulk: Option<Arc<dyn BulkWorker>>,
    pub diversion: Option<Arc<dyn DivertedTaskHandler>>,
    pub forwarding: Option<Arc<dyn TaskForwardingEvaluator>>,
}

impl FactoryCapabilities {
    pub fn with_bulk(mut self, bulk: Arc<dyn BulkWorker>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    pub fn with_diversion(mut self, handler: Arc<dyn DivertedTaskHandler>) -> Self {
        self.diversion = Some(handler);
        self
    }

    pub fn with_forwarding(mut self, evaluator: Arc<dyn TaskForwardingEvaluator>) -> Self {
        self.forwarding = Some(evaluator);
        self
    }
}

impl std::fmt::Debug for FactoryCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryCapabilities")
            .field("bulk", &self.bulk.is_some())
            .field("diversion", &self.diversion.is_some())
            .field("forwarding", &self.forwarding.is_some())
            .finish()
    }
}

/// Identity and routing of a worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerConfiguration {
    pub worker_name: Option<String>,
    pub worker_version: Option<String>,
    /// Where poison messages are reported
    pub reject_queue: Option<String>,
}

/// Builds workers and reports on their health
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Create a worker for `task`
    fn get_worker(&self, task: Arc<dyn WorkerTask>) -> Result<Box<dyn Worker>, WorkerError>;

    /// Number of tasks to run concurrently
    fn worker_threads(&self) -> usize;

    /// Queue that receives responses for invalid tasks
    fn invalid_task_queue(&self) -> &str;

    fn worker_configuration(&self) -> Option<&WorkerConfiguration> {
        None
    }

    /// Optional capabilities, queried once when the core is built
    fn capabilities(&self) -> FactoryCapabilities {
        FactoryCapabilities::default()
    }

    async fn health_check(&self) -> HealthResult;

    async fn liveness_check(&self) -> HealthResult {
        HealthResult::healthy()
    }

    async fn shutdown(&self) {}
}
