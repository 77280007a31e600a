//! Completion callback
//!
//! Every outcome of a task reaches the queue transport through
//! [`WorkerCallback`]. [`QueueWorkerCallback`] encodes envelopes, publishes
//! them, keeps the statistics and abandons tasks whose results cannot be
//! delivered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use taskmill_api::{Codec, CodecExt, Headers, TaskInformation, TaskMessage, WorkerQueue};
use tracing::{debug, error, warn};

use crate::error::CallbackError;
use crate::health::TransientHealthRegistry;
use crate::stats::WorkerStats;

/// Receives the outcomes of tasks
///
/// Tracking info is removed from any published envelope whose destination
/// is the queue named in its `track_to`.
#[async_trait]
pub trait WorkerCallback: Send + Sync {
    /// Publish a non-final response
    async fn send(
        &self,
        task_information: &Arc<TaskInformation>,
        message: TaskMessage,
    ) -> Result<(), CallbackError>;

    /// Publish the final response; `None` acknowledges without publishing
    async fn complete(
        &self,
        task_information: &Arc<TaskInformation>,
        queue: Option<&str>,
        message: TaskMessage,
    );

    /// Return the inbound message for redelivery and back off ingestion
    async fn abandon(&self, task_information: &Arc<TaskInformation>, reason: &str);

    /// Publish the envelope to another queue without executing it
    async fn forward(
        &self,
        task_information: &Arc<TaskInformation>,
        queue: Option<&str>,
        message: TaskMessage,
        headers: &Headers,
    );

    /// Park the envelope on the paused queue
    async fn pause(
        &self,
        task_information: &Arc<TaskInformation>,
        paused_queue: &str,
        message: TaskMessage,
        headers: &Headers,
    );

    /// Acknowledge without publishing
    async fn discard(&self, task_information: &Arc<TaskInformation>);

    /// Publish a batched tracking report; not part of any task's accounting
    async fn report_update(&self, tracking_pipe: &str, message: TaskMessage);
}

/// [`WorkerCallback`] that publishes through a [`WorkerQueue`]
pub struct QueueWorkerCallback {
    queue: Arc<dyn WorkerQueue>,
    codec: Arc<dyn Codec>,
    stats: Arc<WorkerStats>,
    transient_health: Arc<TransientHealthRegistry>,
}

impl QueueWorkerCallback {
    pub fn new(
        queue: Arc<dyn WorkerQueue>,
        codec: Arc<dyn Codec>,
        stats: Arc<WorkerStats>,
        transient_health: Arc<TransientHealthRegistry>,
    ) -> Self {
        Self {
            queue,
            codec,
            stats,
            transient_health,
        }
    }

    async fn publish(
        &self,
        task_information: Option<&Arc<TaskInformation>>,
        queue: &str,
        mut message: TaskMessage,
        headers: &Headers,
        is_last_message: bool,
    ) -> Result<usize, CallbackError> {
        message.strip_tracking_for(Some(queue));
        let bytes = self.codec.encode(&message)?;
        let size = bytes.len();
        self.queue
            .publish(
                task_information,
                bytes,
                queue,
                headers,
                message.priority,
                is_last_message,
            )
            .await?;
        Ok(size)
    }

    fn record_finished(&self, message: &TaskMessage) {
        self.stats.record_task_finished(Utc::now());
        if message.task_status.is_successful_response() {
            self.stats.increment_tasks_succeeded();
        } else {
            self.stats.increment_tasks_failed();
        }
    }
}

#[async_trait]
impl WorkerCallback for QueueWorkerCallback {
    async fn send(
        &self,
        task_information: &Arc<TaskInformation>,
        message: TaskMessage,
    ) -> Result<(), CallbackError> {
        let Some(queue) = message.to.clone() else {
            self.queue.acknowledge_task(task_information).await;
            return Ok(());
        };
        debug!(task_id = %message.task_id, queue = %queue, "Sending response");
        self.publish(Some(task_information), &queue, message, &Headers::new(), false)
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        task_information: &Arc<TaskInformation>,
        queue: Option<&str>,
        message: TaskMessage,
    ) {
        let Some(queue) = queue else {
            debug!(task_id = %message.task_id, "No output queue, acknowledging task");
            self.queue.acknowledge_task(task_information).await;
            self.record_finished(&message);
            return;
        };

        let task_id = message.task_id.clone();
        let status = message.task_status;
        let finished = message.clone();
        match self
            .publish(Some(task_information), queue, message, &Headers::new(), true)
            .await
        {
            Ok(size) => {
                debug!(task_id = %task_id, queue = %queue, status = %status, "Task completed");
                self.stats.record_output_size(size);
                self.record_finished(&finished);
            }
            Err(e) => {
                error!(task_id = %task_id, queue = %queue, error = %e, "Failed to publish result");
                self.abandon(task_information, &e.to_string()).await;
            }
        }
    }

    async fn abandon(&self, task_information: &Arc<TaskInformation>, reason: &str) {
        warn!(
            message_id = %task_information.inbound_message_id(),
            reason = %reason,
            "Abandoning task, returning it to the queue"
        );
        self.queue.reject_task(task_information).await;
        self.stats.increment_tasks_rejected();
        self.queue.disconnect_incoming();
        self.transient_health.record_fault(reason);
    }

    async fn forward(
        &self,
        task_information: &Arc<TaskInformation>,
        queue: Option<&str>,
        message: TaskMessage,
        headers: &Headers,
    ) {
        let Some(queue) = queue else {
            debug!(task_id = %message.task_id, "No forwarding destination, acknowledging task");
            self.queue.acknowledge_task(task_information).await;
            self.stats.increment_tasks_forwarded();
            return;
        };

        let task_id = message.task_id.clone();
        match self
            .publish(Some(task_information), queue, message, headers, true)
            .await
        {
            Ok(_) => {
                debug!(task_id = %task_id, queue = %queue, "Task forwarded");
                self.stats.increment_tasks_forwarded();
            }
            Err(e) => {
                error!(task_id = %task_id, queue = %queue, error = %e, "Failed to forward task");
                self.abandon(task_information, &e.to_string()).await;
            }
        }
    }

    async fn pause(
        &self,
        task_information: &Arc<TaskInformation>,
        paused_queue: &str,
        message: TaskMessage,
        headers: &Headers,
    ) {
        let task_id = message.task_id.clone();
        match self
            .publish(Some(task_information), paused_queue, message, headers, true)
            .await
        {
            Ok(_) => {
                debug!(task_id = %task_id, queue = %paused_queue, "Task paused");
                self.stats.increment_tasks_paused();
            }
            Err(e) => {
                error!(task_id = %task_id, queue = %paused_queue, error = %e, "Failed to pause task");
                self.abandon(task_information, &e.to_string()).await;
            }
        }
    }

    async fn discard(&self, task_information: &Arc<TaskInformation>) {
        debug!(message_id = %task_information.inbound_message_id(), "Discarding task");
        self.queue.acknowledge_task(task_information).await;
        self.stats.increment_tasks_discarded();
    }

    async fn report_update(&self, tracking_pipe: &str, message: TaskMessage) {
        if let Err(e) = self
            .publish(None, tracking_pipe, message, &Headers::new(), false)
            .await
        {
            warn!(pipe = %tracking_pipe, error = %e, "Failed to publish tracking report");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskmill_api::{JsonCodec, TaskStatus, TrackingInfo};

    use super::*;
    use crate::memory::InMemoryWorkerQueue;

    struct Fixture {
        queue: Arc<InMemoryWorkerQueue>,
        stats: Arc<WorkerStats>,
        transient: Arc<TransientHealthRegistry>,
        callback: QueueWorkerCallback,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(InMemoryWorkerQueue::new("in"));
        let stats = Arc::new(WorkerStats::new());
        let transient = Arc::new(TransientHealthRegistry::new(Duration::from_secs(30)));
        let callback = QueueWorkerCallback::new(
            queue.clone(),
            Arc::new(JsonCodec::new()),
            stats.clone(),
            transient.clone(),
        );
        Fixture {
            queue,
            stats,
            transient,
            callback,
        }
    }

    fn finalized(id: &str) -> Arc<TaskInformation> {
        let info = Arc::new(TaskInformation::new(id));
        info.increment_response_count(true);
        info
    }

    fn result(status: TaskStatus) -> TaskMessage {
        TaskMessage::new("t1", "echo", 1, b"y".to_vec(), status).with_to("out")
    }

    #[tokio::test]
    async fn test_complete_publishes_and_counts() {
        let f = fixture();
        let info = finalized("m1");

        f.callback
            .complete(&info, Some("out"), result(TaskStatus::ResultSuccess))
            .await;

        let published = f.queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue, "out");
        assert!(published[0].is_last_message);
        assert_eq!(f.stats.tasks_succeeded(), 1);
        assert!(f.stats.last_task_finished().is_some());
        assert_eq!(f.queue.acknowledged(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_complete_failure_counts_failed() {
        let f = fixture();
        f.callback
            .complete(&finalized("m1"), Some("out"), result(TaskStatus::ResultException))
            .await;
        assert_eq!(f.stats.tasks_failed(), 1);
        assert_eq!(f.stats.tasks_succeeded(), 0);
    }

    #[tokio::test]
    async fn test_complete_without_queue_acknowledges() {
        let f = fixture();
        f.callback
            .complete(&finalized("m1"), None, result(TaskStatus::ResultSuccess))
            .await;
        assert!(f.queue.published().is_empty());
        assert_eq!(f.queue.acknowledged(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_fault_abandons() {
        let f = fixture();
        f.queue.fail_publishes_to("out");

        f.callback
            .complete(&finalized("m1"), Some("out"), result(TaskStatus::ResultSuccess))
            .await;

        assert_eq!(f.queue.rejected(), vec!["m1".to_string()]);
        assert_eq!(f.stats.tasks_rejected(), 1);
        assert_eq!(f.stats.tasks_succeeded(), 0);
        assert_eq!(f.queue.disconnect_count(), 1);
        assert!(!f.transient.check().is_healthy());
    }

    #[tokio::test]
    async fn test_tracking_stripped_at_track_to() {
        let f = fixture();
        let tracking = TrackingInfo::new("job1").with_track_to("out");
        let message = result(TaskStatus::ResultSuccess).with_tracking(tracking.clone());

        f.callback
            .complete(&finalized("m1"), Some("out"), message.clone())
            .await;
        f.callback
            .complete(&finalized("m2"), Some("elsewhere"), message)
            .await;

        let published = f.queue.published_messages();
        assert!(published[0].tracking.is_none());
        assert_eq!(published[1].tracking.as_ref(), Some(&tracking));
    }

    #[tokio::test]
    async fn test_forward_pause_discard_counters() {
        let f = fixture();
        let message = TaskMessage::new("t1", "echo", 1, Vec::new(), TaskStatus::NewTask);

        f.callback
            .forward(&finalized("m1"), Some("other"), message.clone(), &Headers::new())
            .await;
        f.callback
            .pause(&finalized("m2"), "paused", message, &Headers::new())
            .await;
        f.callback.discard(&finalized("m3")).await;

        assert_eq!(f.stats.tasks_forwarded(), 1);
        assert_eq!(f.stats.tasks_paused(), 1);
        assert_eq!(f.stats.tasks_discarded(), 1);
        assert_eq!(f.queue.published().len(), 2);
        assert_eq!(f.queue.acknowledged().len(), 3);
    }

    #[tokio::test]
    async fn test_report_update_is_not_acknowledged() {
        let f = fixture();
        let report = TaskMessage::new("r1", "TrackingReportTask", 1, Vec::new(), TaskStatus::NewTask)
            .with_to("tracking");

        f.callback.report_update("tracking", report).await;

        let published = f.queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].acknowledgement, None);
        assert!(f.queue.acknowledged().is_empty());
    }
}
