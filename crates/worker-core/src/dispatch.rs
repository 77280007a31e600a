//! Inbound task registration
//!
//! [`TaskDispatcher`] is the [`TaskCallback`] a queue transport delivers to.
//! Each delivery is decoded, checked for poison and job status, and then
//! executed, diverted, paused or discarded.

use std::sync::Arc;

use async_trait::async_trait;
use taskmill_api::{
    headers, Codec, CodecExt, DecodeMethod, Headers, InvalidTaskError, TaskCallback,
    TaskCallbackError, TaskInformation, TaskMessage, TaskRejectedError,
};
use tracing::{debug, instrument, warn};

use crate::config::CoreConfig;
use crate::executor::TaskExecutor;
use crate::stats::WorkerStats;
use crate::status::{check_job_status, JobStatus, JobStatusOutcome, JobStatusProber};

/// Queue callback that registers inbound tasks
pub struct TaskDispatcher {
    executor: TaskExecutor,
    codec: Arc<dyn Codec>,
    config: Arc<CoreConfig>,
    stats: Arc<WorkerStats>,
    prober: Option<Arc<dyn JobStatusProber>>,
    input_queue: String,
    paused_queue: Option<String>,
}

impl TaskDispatcher {
    pub fn new(
        executor: TaskExecutor,
        codec: Arc<dyn Codec>,
        config: Arc<CoreConfig>,
        stats: Arc<WorkerStats>,
        input_queue: impl Into<String>,
        paused_queue: Option<String>,
    ) -> Self {
        Self {
            executor,
            codec,
            config,
            stats,
            prober: None,
            input_queue: input_queue.into(),
            paused_queue,
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn JobStatusProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Whether the task is addressed to this worker
    ///
    /// Queue names compare case-insensitively; a task without a destination
    /// is taken as addressed here.
    fn is_intended_for_this_worker(&self, message: &TaskMessage) -> bool {
        if !self.config.diverted_task_checking {
            return true;
        }
        match &message.to {
            Some(to) => to.eq_ignore_ascii_case(&self.input_queue),
            None => true,
        }
    }

    fn invalid(&self, reason: String) -> TaskCallbackError {
        self.stats.increment_tasks_rejected();
        InvalidTaskError::new(reason).into()
    }

    async fn job_status(&self, message: &mut TaskMessage) -> JobStatusOutcome {
        match message.tracking.as_mut() {
            Some(tracking) => check_job_status(self.prober.as_deref(), tracking).await,
            None => JobStatusOutcome::Status(JobStatus::Active),
        }
    }

    async fn route(
        &self,
        message: TaskMessage,
        task_information: Arc<TaskInformation>,
        poison: bool,
        headers: Headers,
    ) -> Result<(), TaskCallbackError> {
        let mut message = message;
        let status = match self.job_status(&mut message).await {
            JobStatusOutcome::JobNotFound => {
                debug!(task_id = %message.task_id, "Job no longer exists, discarding task");
                self.executor.discard_task(&task_information).await;
                return Ok(());
            }
            JobStatusOutcome::Status(status) => status,
        };

        let intended = self.is_intended_for_this_worker(&message);
        match status {
            JobStatus::Active | JobStatus::Waiting if intended => {
                self.execute(message, task_information, poison, headers)
            }
            JobStatus::Active | JobStatus::Waiting | JobStatus::Paused if !intended => self
                .executor
                .handle_diverted_task(message, task_information, poison, headers)
                .await
                .map_err(|e| self.rejected(e)),
            JobStatus::Paused => match &self.paused_queue {
                Some(paused_queue) => {
                    self.executor
                        .pause_task(paused_queue, message, &task_information, &headers)
                        .await;
                    Ok(())
                }
                None => {
                    warn!(
                        task_id = %message.task_id,
                        "Job is paused but no paused queue is configured, executing task"
                    );
                    self.execute(message, task_information, poison, headers)
                }
            },
            other => {
                debug!(task_id = %message.task_id, status = ?other, "Job is no longer running, discarding task");
                self.executor.discard_task(&task_information).await;
                Ok(())
            }
        }
    }

    fn execute(
        &self,
        message: TaskMessage,
        task_information: Arc<TaskInformation>,
        poison: bool,
        headers: Headers,
    ) -> Result<(), TaskCallbackError> {
        self.executor
            .execute_task(message, task_information, poison, headers)
            .map_err(|e| self.rejected(e))
    }

    fn rejected(&self, error: TaskRejectedError) -> TaskCallbackError {
        warn!(error = %error, "Task refused by the execution engine");
        self.stats.increment_tasks_rejected();
        error.into()
    }
}

/// A message is poison once it has been delivered as often as its retry limit allows
pub fn is_poison(delivery_headers: &Headers) -> bool {
    let header = |name: &str| delivery_headers.get(name).and_then(|v| v.trim().parse::<u32>().ok());
    match (header(headers::RETRY_LIMIT), header(headers::RETRY_COUNT)) {
        (Some(limit), Some(count)) => count >= limit,
        _ => false,
    }
}

#[async_trait]
impl TaskCallback for TaskDispatcher {
    #[instrument(
        skip_all,
        fields(message_id = %task_information.inbound_message_id(), size = task_message.len())
    )]
    async fn register_new_task(
        &self,
        task_information: Arc<TaskInformation>,
        task_message: &[u8],
        headers: Headers,
    ) -> Result<(), TaskCallbackError> {
        self.stats.increment_tasks_received();
        self.stats.record_input_size(task_message.len());

        let message: TaskMessage = self
            .codec
            .decode(task_message, DecodeMethod::Lenient)
            .map_err(|e| self.invalid(format!("failed to decode task message: {e}")))?;

        if message.task_id.is_empty() {
            return Err(self.invalid("task message has no task id".to_string()));
        }
        if let Some(tracking) = &message.tracking {
            tracking.job_id().map_err(|e| self.invalid(e.to_string()))?;
        }

        let poison = is_poison(&headers);
        debug!(
            task_id = %message.task_id,
            classifier = %message.task_classifier,
            to = ?message.to,
            poison,
            "Registering task"
        );
        self.route(message, task_information, poison, headers).await
    }

    fn abort_tasks(&self) {
        let aborted = self.executor.engine().abort_tasks();
        warn!(aborted, "Aborted in-flight tasks");
        self.stats.add_tasks_aborted(aborted as u64);
    }
}
