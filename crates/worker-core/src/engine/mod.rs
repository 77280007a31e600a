//! Execution engines
//!
//! An [`ExecutionEngine`] runs submitted tasks. Two variants exist:
//!
//! - [`StreamingEngine`]: a fixed number of slots, each running one task at
//!   a time to completion.
//! - [`BulkEngine`]: dedicated slots that hand many tasks to one
//!   [`BulkWorker`](taskmill_api::BulkWorker) invocation, with a one-slot
//!   streaming engine as backup for tasks the bulk worker left unanswered.
//!
//! Aborting is cooperative: running work observes a cancellation token
//! and queued work is drained without running.

mod backlog;
mod bulk;
mod streaming;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskmill_api::{FactoryCapabilities, TaskRejectedError, WorkerFactory};
use tokio::sync::watch;
use tracing::{error, info};

pub use backlog::TaskBacklog;
pub use bulk::BulkEngine;
pub use streaming::StreamingEngine;

use crate::task::WorkerTaskImpl;

/// Runs when the execution substrate is broken beyond recovery
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Log the fault and exit the process
pub fn exit_process_handler() -> FatalHandler {
    Arc::new(|reason: &str| {
        error!(reason = %reason, "Unrecoverable fault in worker execution, exiting");
        std::process::exit(1);
    })
}

/// Engine construction options
#[derive(Clone)]
pub struct EngineOptions {
    /// Maximum queued tasks (`None` = unbounded)
    pub max_backlog: Option<usize>,
    pub fatal_handler: FatalHandler,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_backlog: None,
            fatal_handler: exit_process_handler(),
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Queue a task; fails when the backlog is full or the engine is shut down
    fn submit(&self, task: Arc<WorkerTaskImpl>) -> Result<(), TaskRejectedError>;

    /// Interrupt running work and drop queued work
    ///
    /// Returns how many tasks were interrupted or dropped.
    fn abort_tasks(&self) -> usize;

    /// No task is queued or running
    fn is_idle(&self) -> bool;

    fn backlog_size(&self) -> usize;

    /// Resolve once the engine is idle
    async fn wait_idle(&self);

    /// Stop taking tasks; slots exit after their current task
    fn shutdown(&self);

    /// Wait up to `timeout` for every slot to exit; true if they all did
    async fn await_termination(&self, timeout: Duration) -> bool;
}

/// Build the engine a factory asks for
///
/// Must be called within a tokio runtime.
pub fn create_engine(
    factory: Arc<dyn WorkerFactory>,
    capabilities: &FactoryCapabilities,
    options: EngineOptions,
) -> Arc<dyn ExecutionEngine> {
    let threads = factory.worker_threads().max(1);
    match &capabilities.bulk {
        Some(bulk_worker) => {
            info!(threads, "Starting bulk execution engine");
            Arc::new(BulkEngine::new(bulk_worker.clone(), factory, threads, options))
        }
        None => {
            info!(threads, "Starting streaming execution engine");
            Arc::new(StreamingEngine::new("streaming", factory, threads, options))
        }
    }
}

/// Number of engine slots that have not exited yet
pub(crate) struct LiveSlots {
    live: watch::Sender<usize>,
}

impl LiveSlots {
    pub(crate) fn new() -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(Self { live })
    }

    /// Count a slot as live until the returned guard drops
    pub(crate) fn enter(self: &Arc<Self>) -> SlotGuard {
        self.live.send_modify(|n| *n += 1);
        SlotGuard(self.clone())
    }

    /// Wait up to `timeout` for every slot to exit
    pub(crate) async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut live = self.live.subscribe();
        tokio::time::timeout(timeout, live.wait_for(|n| *n == 0))
            .await
            .map(|exited| exited.is_ok())
            .unwrap_or(false)
    }
}

/// Held by a running slot
pub(crate) struct SlotGuard(Arc<LiveSlots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
