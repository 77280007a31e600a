//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskmill_api::{
    Headers, HealthResult, QueueError, TaskInformation, TaskMessage, Worker, WorkerConfiguration,
    WorkerError, WorkerFactory, WorkerTask,
};

use crate::callback::WorkerCallback;
use crate::error::CallbackError;

#[derive(Debug, Clone)]
pub(crate) enum CallbackEvent {
    Send(TaskMessage),
    Complete {
        queue: Option<String>,
        message: TaskMessage,
    },
    Abandon(String),
    Forward {
        queue: Option<String>,
        message: TaskMessage,
    },
    Pause {
        queue: String,
        message: TaskMessage,
    },
    Discard,
    Report {
        pipe: String,
        message: TaskMessage,
    },
}

/// Records every callback in order
#[derive(Default)]
pub(crate) struct RecordingCallback {
    events: Mutex<Vec<CallbackEvent>>,
    fail_sends: AtomicBool,
}

impl RecordingCallback {
    pub(crate) fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    fn record(&self, event: CallbackEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl WorkerCallback for RecordingCallback {
    async fn send(&self, _: &Arc<TaskInformation>, message: TaskMessage) -> Result<(), CallbackError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CallbackError::Queue(QueueError::Connection("offline".into())));
        }
        self.record(CallbackEvent::Send(message));
        Ok(())
    }

    async fn complete(&self, _: &Arc<TaskInformation>, queue: Option<&str>, message: TaskMessage) {
        self.record(CallbackEvent::Complete {
            queue: queue.map(str::to_string),
            message,
        });
    }

    async fn abandon(&self, _: &Arc<TaskInformation>, reason: &str) {
        self.record(CallbackEvent::Abandon(reason.to_string()));
    }

    async fn forward(
        &self,
        _: &Arc<TaskInformation>,
        queue: Option<&str>,
        message: TaskMessage,
        _: &Headers,
    ) {
        self.record(CallbackEvent::Forward {
            queue: queue.map(str::to_string),
            message,
        });
    }

    async fn pause(&self, _: &Arc<TaskInformation>, queue: &str, message: TaskMessage, _: &Headers) {
        self.record(CallbackEvent::Pause {
            queue: queue.to_string(),
            message,
        });
    }

    async fn discard(&self, _: &Arc<TaskInformation>) {
        self.record(CallbackEvent::Discard);
    }

    async fn report_update(&self, pipe: &str, message: TaskMessage) {
        self.record(CallbackEvent::Report {
            pipe: pipe.to_string(),
            message,
        });
    }
}

/// Factory whose workers come from a closure
pub(crate) struct StubFactory {
    invalid_task_queue: String,
    configuration: Option<WorkerConfiguration>,
    threads: usize,
    make: Box<dyn Fn(Arc<dyn WorkerTask>) -> Result<Box<dyn Worker>, WorkerError> + Send + Sync>,
}

impl StubFactory {
    pub(crate) fn new(invalid_task_queue: &str) -> Self {
        Self {
            invalid_task_queue: invalid_task_queue.to_string(),
            configuration: None,
            threads: 1,
            make: Box::new(|_| Err(WorkerError::Failed(anyhow::anyhow!("no workers configured")))),
        }
    }

    pub(crate) fn with_configuration(mut self, configuration: WorkerConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub(crate) fn with_workers(
        mut self,
        make: impl Fn(Arc<dyn WorkerTask>) -> Result<Box<dyn Worker>, WorkerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.make = Box::new(make);
        self
    }
}

#[async_trait]
impl WorkerFactory for StubFactory {
    fn get_worker(&self, task: Arc<dyn WorkerTask>) -> Result<Box<dyn Worker>, WorkerError> {
        (self.make)(task)
    }

    fn worker_threads(&self) -> usize {
        self.threads
    }

    fn invalid_task_queue(&self) -> &str {
        &self.invalid_task_queue
    }

    fn worker_configuration(&self) -> Option<&WorkerConfiguration> {
        self.configuration.as_ref()
    }

    async fn health_check(&self) -> HealthResult {
        HealthResult::healthy()
    }
}
