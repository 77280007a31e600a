//! Per-task response accounting
//!
//! [`WorkerTaskImpl`] is the [`WorkerTask`] handed to worker code. It turns
//! worker responses into outgoing envelopes and makes sure one inbound
//! message yields exactly one terminal outcome:
//!
//! - Every `add_response` counts one more response. The latest one is held
//!   back and only sent when the next response arrives.
//! - The terminal call fixes the count, flushes the held response, waits
//!   until every earlier send has reached the callback and then completes
//!   (or abandons) the task.
//! - With more than one response, sub-responses get task id suffixes
//!   `.1`, `.2`, ... and the terminal one `.<total>*`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskmill_api::{
    headers, Headers, InvalidTaskError, SourceInfo, TaskInformation, TaskMessage, TaskRejectedError,
    TaskStatus, TrackingInfo, WorkerFactory, WorkerResponse, WorkerTask,
};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::callback::WorkerCallback;
use crate::config::CoreConfig;
use crate::progress::{report_for_message, ProgressReportBuffer, ReportContext};
use crate::stats::WorkerStats;

const DEFAULT_WORKER_NAME: &str = "taskmill-worker";

/// Collaborators shared by every task of one dispatch core
pub struct DispatchContext {
    pub callback: Arc<dyn WorkerCallback>,
    pub factory: Arc<dyn WorkerFactory>,
    pub config: Arc<CoreConfig>,
    /// Queue this worker consumes; keys the worker's entry in outgoing context
    pub input_queue: String,
    /// Stamped on every outgoing response
    pub source_info: SourceInfo,
    /// Destination of poison message reports
    pub reject_queue: String,
    pub stats: Arc<WorkerStats>,
}

impl DispatchContext {
    pub fn new(
        callback: Arc<dyn WorkerCallback>,
        factory: Arc<dyn WorkerFactory>,
        config: Arc<CoreConfig>,
        input_queue: impl Into<String>,
    ) -> Self {
        let worker_configuration = factory.worker_configuration().cloned().unwrap_or_default();
        let name = config
            .worker_name
            .clone()
            .or(worker_configuration.worker_name)
            .unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string());
        let version = worker_configuration
            .worker_version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        let reject_queue = worker_configuration
            .reject_queue
            .unwrap_or_else(|| factory.invalid_task_queue().to_string());

        Self {
            callback,
            factory,
            config,
            input_queue: input_queue.into(),
            source_info: SourceInfo::new(name, version),
            reject_queue,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    /// Share the core's statistics instead of a private set
    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }
}

#[derive(Default)]
struct ResponseState {
    /// Latest sub-response, not yet sent
    held: Option<TaskMessage>,
    holding_disabled: bool,
    sends_started: u32,
    send_failed: bool,
    response_set: bool,
}

/// A task being processed on behalf of one inbound message
pub struct WorkerTaskImpl {
    message: TaskMessage,
    task_information: Arc<TaskInformation>,
    headers: Headers,
    poison: bool,
    ctx: Arc<DispatchContext>,
    state: Mutex<ResponseState>,
    /// One permit per sub-response that reached the callback
    sends_finished: Semaphore,
    progress: ProgressReportBuffer,
}

impl WorkerTaskImpl {
    pub fn new(
        message: TaskMessage,
        task_information: Arc<TaskInformation>,
        headers: Headers,
        poison: bool,
        ctx: Arc<DispatchContext>,
    ) -> Self {
        let progress = ProgressReportBuffer::new(ctx.config.progress_report_buffer_limit);
        Self {
            message,
            task_information,
            headers,
            poison,
            ctx,
            state: Mutex::new(ResponseState::default()),
            sends_finished: Semaphore::new(0),
            progress,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.message.task_id
    }

    pub fn message(&self) -> &TaskMessage {
        &self.message
    }

    pub fn task_information(&self) -> &Arc<TaskInformation> {
        &self.task_information
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.ctx.stats
    }

    /// Finish a poison message with an exception result on the reject queue
    pub async fn set_poison_response(&self) {
        let reason = self.poison_reason();
        warn!(
            task_id = %self.message.task_id,
            classifier = %self.message.task_classifier,
            reason = %reason,
            "Poison message, publishing rejection report"
        );
        let message = self.response_message(
            &self.message.task_classifier,
            self.message.task_api_version,
            reason.into_bytes(),
            TaskStatus::ResultException,
            Some(self.ctx.reject_queue.clone()),
            None,
            false,
        );
        let queue = self.ctx.reject_queue.clone();
        self.finish(message, Some(queue)).await;
    }

    fn poison_reason(&self) -> String {
        self.headers
            .get(headers::REJECTED)
            .filter(|text| !text.is_empty())
            .cloned()
            .unwrap_or_else(|| "retry limit exceeded".to_string())
    }

    fn retry_count(&self) -> Option<u32> {
        self.headers
            .get(headers::RETRY_COUNT)
            .and_then(|count| count.trim().parse().ok())
    }

    #[allow(clippy::too_many_arguments)]
    fn response_message(
        &self,
        classifier: &str,
        api_version: u32,
        data: Vec<u8>,
        status: TaskStatus,
        to: Option<String>,
        worker_context: Option<Vec<u8>>,
        include_task_context: bool,
    ) -> TaskMessage {
        let mut context = if include_task_context {
            self.message.context.clone()
        } else {
            HashMap::new()
        };
        if let Some(worker_context) = worker_context {
            context.insert(self.ctx.input_queue.clone(), worker_context);
        }

        TaskMessage {
            version: taskmill_api::TASK_MESSAGE_VERSION,
            task_id: self.message.task_id.clone(),
            task_classifier: classifier.to_string(),
            task_api_version: api_version,
            task_data: data,
            task_status: status,
            context,
            to,
            tracking: self.message.tracking.clone(),
            source_info: Some(self.ctx.source_info.clone()),
            priority: self.message.priority,
            correlation_id: self.message.correlation_id.clone(),
        }
    }

    fn envelope_for(&self, response: WorkerResponse, include_task_context: bool) -> TaskMessage {
        let to = response.effective_queue().map(str::to_string);
        self.response_message(
            &response.message_type,
            response.api_version,
            response.data,
            response.status,
            to,
            response.context,
            include_task_context,
        )
    }

    async fn queue_report(&self, message: &TaskMessage) {
        let poison_reason = self.poison.then(|| self.poison_reason());
        let report_ctx = ReportContext {
            source: &self.ctx.source_info.name,
            zero_progress_reporting: self.ctx.config.zero_progress_reporting,
            poison_reason: poison_reason.as_deref(),
            retries: self.retry_count(),
        };
        if let Some((pipe, report)) = report_for_message(message, &report_ctx) {
            self.progress
                .add(pipe, report, self.ctx.callback.as_ref())
                .await;
        }
    }

    async fn send_held(&self, message: TaskMessage) {
        self.queue_report(&message).await;
        let task_id = message.task_id.clone();
        if let Err(e) = self.ctx.callback.send(&self.task_information, message).await {
            error!(task_id = %task_id, error = %e, "Failed to send sub-response");
            self.state.lock().send_failed = true;
        }
        self.sends_finished.add_permits(1);
    }

    /// Count the terminal response and wait for every sub-response
    ///
    /// Returns the total number of responses.
    async fn finalize_responses(&self) -> u32 {
        let total = self.task_information.increment_response_count(true);
        let held = {
            let mut state = self.state.lock();
            state.response_set = true;
            state.holding_disabled = true;
            let held = state.held.take();
            if held.is_some() {
                state.sends_started += 1;
            }
            held
        };
        if let Some(held) = held {
            self.send_held(held).await;
        }

        let started = self.state.lock().sends_started;
        if let Ok(permits) = self.sends_finished.acquire_many(started).await {
            permits.forget();
        }
        total
    }

    async fn finish(&self, mut message: TaskMessage, destination: Option<String>) {
        let total = self.finalize_responses().await;
        if total > 1 {
            apply_suffix(&mut message, &format!(".{total}*"));
        }

        self.queue_report(&message).await;
        self.progress.flush(self.ctx.callback.as_ref()).await;

        if self.state.lock().send_failed {
            self.ctx
                .callback
                .abandon(&self.task_information, "a sub-response could not be published")
                .await;
            return;
        }
        self.ctx
            .callback
            .complete(&self.task_information, destination.as_deref(), message)
            .await;
    }
}

fn apply_suffix(message: &mut TaskMessage, suffix: &str) {
    message.task_id.push_str(suffix);
    if let Some(tracking) = message.tracking.as_mut() {
        *tracking = tracking.with_job_task_id_suffix(suffix);
    }
}

#[async_trait]
impl WorkerTask for WorkerTaskImpl {
    fn classifier(&self) -> &str {
        &self.message.task_classifier
    }

    fn version(&self) -> u32 {
        self.message.task_api_version
    }

    fn status(&self) -> TaskStatus {
        self.message.task_status
    }

    fn data(&self) -> &[u8] {
        &self.message.task_data
    }

    fn context(&self) -> &HashMap<String, Vec<u8>> {
        &self.message.context
    }

    fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    fn tracking_info(&self) -> Option<&TrackingInfo> {
        self.message.tracking.as_ref()
    }

    fn source_info(&self) -> Option<&SourceInfo> {
        self.message.source_info.as_ref()
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn is_poison(&self) -> bool {
        self.poison
    }

    fn is_response_set(&self) -> bool {
        self.state.lock().response_set
    }

    async fn add_response(&self, response: WorkerResponse, include_task_context: bool) {
        let n = self.task_information.increment_response_count(false);
        let mut message = self.envelope_for(response, include_task_context);
        apply_suffix(&mut message, &format!(".{n}"));

        let to_send = {
            let mut state = self.state.lock();
            let previous = if state.holding_disabled {
                Some(message)
            } else {
                state.held.replace(message)
            };
            if previous.is_some() {
                state.sends_started += 1;
            }
            previous
        };
        if let Some(previous) = to_send {
            self.send_held(previous).await;
        }
    }

    async fn set_response(&self, response: WorkerResponse) {
        let message = self.envelope_for(response, true);
        let destination = message.to.clone();
        debug!(
            task_id = %self.message.task_id,
            status = %message.task_status,
            queue = ?destination,
            "Task response set"
        );
        self.finish(message, destination).await;
    }

    async fn set_task_rejected(&self, error: TaskRejectedError) {
        warn!(task_id = %self.message.task_id, error = %error, "Task rejected");
        self.finalize_responses().await;
        self.ctx
            .callback
            .abandon(&self.task_information, &error.to_string())
            .await;
    }

    async fn set_invalid_task(&self, error: InvalidTaskError) {
        warn!(task_id = %self.message.task_id, error = %error, "Invalid task");
        let queue = self.ctx.factory.invalid_task_queue().to_string();
        let message = self.response_message(
            &self.message.task_classifier,
            self.message.task_api_version,
            error.message.into_bytes(),
            TaskStatus::InvalidTask,
            Some(queue.clone()),
            None,
            true,
        );
        self.finish(message, Some(queue)).await;
    }
}
