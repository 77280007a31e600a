//! In-memory queue transport for testing
//!
//! Records every publish, acknowledgement and rejection, and lets a test
//! deliver inbound messages straight to the registered callback.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use taskmill_api::{
    Headers, HealthResult, QueueError, TaskCallback, TaskCallbackError, TaskInformation,
    TaskMessage, WorkerQueue,
};

/// One recorded publish
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Inbound message the publish was counted against
    pub acknowledgement: Option<String>,
    pub queue: String,
    pub message: Vec<u8>,
    pub headers: Headers,
    pub priority: Option<u32>,
    pub is_last_message: bool,
}

/// In-memory implementation of [`WorkerQueue`]
///
/// Publishes are confirmed immediately, so the inbound message is
/// acknowledged as soon as its last response is counted.
pub struct InMemoryWorkerQueue {
    input_queue: String,
    paused_queue: Option<String>,
    callback: RwLock<Option<Arc<dyn TaskCallback>>>,
    published: RwLock<Vec<PublishedMessage>>,
    acknowledged: RwLock<Vec<String>>,
    rejected: RwLock<Vec<String>>,
    discarded: RwLock<Vec<String>>,
    failing_queues: RwLock<HashSet<String>>,
    healthy: AtomicBool,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    reconnects: AtomicUsize,
    shut_down: AtomicBool,
}

impl InMemoryWorkerQueue {
    pub fn new(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            paused_queue: None,
            callback: RwLock::new(None),
            published: RwLock::new(Vec::new()),
            acknowledged: RwLock::new(Vec::new()),
            rejected: RwLock::new(Vec::new()),
            discarded: RwLock::new(Vec::new()),
            failing_queues: RwLock::new(HashSet::new()),
            healthy: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_paused_queue(mut self, paused_queue: impl Into<String>) -> Self {
        self.paused_queue = Some(paused_queue.into());
        self
    }

    /// Hand a message to the registered callback as if it had been delivered
    pub async fn deliver(
        &self,
        message_id: &str,
        message: &[u8],
        headers: Headers,
    ) -> Result<Arc<TaskInformation>, TaskCallbackError> {
        let callback = self
            .callback
            .read()
            .clone()
            .ok_or_else(|| taskmill_api::TaskRejectedError::new("queue has not been started"))?;
        let info = Arc::new(TaskInformation::new(message_id));
        callback
            .register_new_task(info.clone(), message, headers)
            .await?;
        Ok(info)
    }

    /// Tell the callback the connection was lost
    pub fn drop_connection(&self) {
        if let Some(callback) = self.callback.read().clone() {
            callback.abort_tasks();
        }
    }

    /// Make every publish to `queue` fail
    pub fn fail_publishes_to(&self, queue: &str) {
        self.failing_queues.write().insert(queue.to_string());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().clone()
    }

    /// Published envelopes, decoded as JSON
    pub fn published_messages(&self) -> Vec<TaskMessage> {
        self.published
            .read()
            .iter()
            .filter_map(|p| serde_json::from_slice(&p.message).ok())
            .collect()
    }

    /// Published envelopes sent to `queue`
    pub fn published_to(&self, queue: &str) -> Vec<TaskMessage> {
        self.published
            .read()
            .iter()
            .filter(|p| p.queue == queue)
            .filter_map(|p| serde_json::from_slice(&p.message).ok())
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.read().clone()
    }

    pub fn rejected(&self) -> Vec<String> {
        self.rejected.read().clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn count_acknowledgement(&self, task_information: &TaskInformation) {
        if task_information.increment_acknowledgement_count() {
            self.acknowledged
                .write()
                .push(task_information.inbound_message_id().to_string());
        }
    }
}

#[async_trait]
impl WorkerQueue for InMemoryWorkerQueue {
    async fn start(&self, callback: Arc<dyn TaskCallback>) -> Result<(), QueueError> {
        if self.is_shut_down() {
            return Err(QueueError::Shutdown);
        }
        *self.callback.write() = Some(callback);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        acknowledgement: Option<&Arc<TaskInformation>>,
        message: Vec<u8>,
        target_queue: &str,
        headers: &Headers,
        priority: Option<u32>,
        is_last_message: bool,
    ) -> Result<(), QueueError> {
        if self.failing_queues.read().contains(target_queue) {
            return Err(QueueError::Publish {
                queue: target_queue.to_string(),
                reason: "publish refused".to_string(),
            });
        }
        self.published.write().push(PublishedMessage {
            acknowledgement: acknowledgement.map(|info| info.inbound_message_id().to_string()),
            queue: target_queue.to_string(),
            message,
            headers: headers.clone(),
            priority,
            is_last_message,
        });
        if let Some(info) = acknowledgement {
            self.count_acknowledgement(info);
        }
        Ok(())
    }

    async fn reject_task(&self, task_information: &Arc<TaskInformation>) {
        self.rejected
            .write()
            .push(task_information.inbound_message_id().to_string());
    }

    async fn discard_task(&self, task_information: &Arc<TaskInformation>) {
        self.discarded
            .write()
            .push(task_information.inbound_message_id().to_string());
    }

    async fn acknowledge_task(&self, task_information: &Arc<TaskInformation>) {
        self.count_acknowledgement(task_information);
    }

    fn input_queue(&self) -> &str {
        &self.input_queue
    }

    fn paused_queue(&self) -> Option<&str> {
        self.paused_queue.as_deref()
    }

    fn disconnect_incoming(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn reconnect_incoming(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn health_check(&self) -> HealthResult {
        if self.healthy.load(Ordering::SeqCst) {
            HealthResult::healthy()
        } else {
            HealthResult::unhealthy("in-memory queue marked unhealthy")
        }
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.callback.write().take();
    }
}
