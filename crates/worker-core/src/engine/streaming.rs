//! Streaming engine: one task per slot

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use taskmill_api::{TaskRejectedError, WorkerError, WorkerFactory, WorkerTask};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::{
    panic_message, EngineOptions, ExecutionEngine, FatalHandler, LiveSlots, SlotGuard, TaskBacklog,
};
use crate::task::WorkerTaskImpl;

struct StreamingInner {
    name: String,
    factory: Arc<dyn WorkerFactory>,
    backlog: TaskBacklog<Arc<WorkerTaskImpl>>,
    /// Cancelled and replaced on every abort
    interrupt: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    running: AtomicUsize,
    /// Queued plus running tasks
    in_flight: watch::Sender<usize>,
    fatal_handler: FatalHandler,
}

impl StreamingInner {
    /// Take the next task together with the token that interrupts it
    ///
    /// Claiming happens under the interrupt lock so an abort sees every
    /// task either queued or running.
    fn claim(&self) -> Option<(Arc<WorkerTaskImpl>, CancellationToken)> {
        let interrupt = self.interrupt.lock();
        let task = self.backlog.try_pop()?;
        self.running.fetch_add(1, Ordering::SeqCst);
        Some((task, interrupt.clone()))
    }

    fn finished(&self, count: usize) {
        self.in_flight
            .send_modify(|n| *n = n.saturating_sub(count));
    }

    async fn run_slot(self: Arc<Self>, slot: usize, _live: SlotGuard) {
        debug!(engine = %self.name, slot, "Execution slot started");
        loop {
            let available = tokio::select! {
                _ = self.shutdown.cancelled() => false,
                available = self.backlog.wait_available() => available,
            };
            if !available {
                break;
            }
            let Some((task, interrupt)) = self.claim() else {
                continue;
            };

            let outcome = AssertUnwindSafe(run_task(self.factory.as_ref(), task.clone(), interrupt))
                .catch_unwind()
                .await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished(1);

            if let Err(panic) = outcome {
                let reason = panic_message(panic.as_ref());
                error!(
                    engine = %self.name,
                    task_id = %task.task_id(),
                    reason = %reason,
                    "Worker panicked"
                );
                (self.fatal_handler)(&reason);
            }
        }
        debug!(engine = %self.name, slot, "Execution slot stopped");
    }
}

/// Run one task to its terminal response
///
/// An interrupted worker produces no response; the inbound message is left
/// for the transport to redeliver.
#[instrument(skip_all, fields(task_id = %task.task_id(), classifier = %task.classifier()))]
async fn run_task(
    factory: &dyn WorkerFactory,
    task: Arc<WorkerTaskImpl>,
    interrupt: CancellationToken,
) {
    if task.is_poison() {
        task.set_poison_response().await;
        task.stats().increment_poison_faults();
        error!(fault = "poison_message", "Refusing to run poison message");
        return;
    }

    let worker_task: Arc<dyn WorkerTask> = task.clone();
    let worker = match factory.get_worker(worker_task) {
        Ok(worker) => worker,
        Err(WorkerError::TaskRejected(e)) => return task.set_task_rejected(e).await,
        Err(WorkerError::InvalidTask(e)) => return task.set_invalid_task(e).await,
        Err(WorkerError::Interrupted) => {
            debug!("Interrupted while creating worker");
            return;
        }
        Err(WorkerError::Failed(e)) => {
            let reason = format!("failed to create worker: {e:#}");
            return task.set_task_rejected(TaskRejectedError::new(reason)).await;
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = interrupt.cancelled() => None,
        outcome = worker.do_work() => Some(outcome),
    };

    match outcome {
        None | Some(Err(WorkerError::Interrupted)) => {
            debug!(worker = %worker.worker_identifier(), "Worker interrupted, no response");
        }
        Some(Ok(response)) => task.set_response(response).await,
        Some(Err(WorkerError::TaskRejected(e))) => task.set_task_rejected(e).await,
        Some(Err(WorkerError::InvalidTask(e))) => task.set_invalid_task(e).await,
        Some(Err(WorkerError::Failed(e))) => {
            warn!(
                worker = %worker.worker_identifier(),
                error = %e,
                "Worker failed, using its general failure result"
            );
            task.set_response(worker.general_failure_result(&e)).await;
        }
    }
}

/// Fixed number of slots sharing one backlog
pub struct StreamingEngine {
    inner: Arc<StreamingInner>,
    slots: Arc<LiveSlots>,
}

impl StreamingEngine {
    /// Start `threads` slots; must be called within a tokio runtime
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn WorkerFactory>,
        threads: usize,
        options: EngineOptions,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        let inner = Arc::new(StreamingInner {
            name: name.into(),
            factory,
            backlog: TaskBacklog::new(options.max_backlog),
            interrupt: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            running: AtomicUsize::new(0),
            in_flight,
            fatal_handler: options.fatal_handler,
        });

        let slots = LiveSlots::new();
        for slot in 0..threads.max(1) {
            tokio::spawn(inner.clone().run_slot(slot, slots.enter()));
        }

        Self { inner, slots }
    }

    /// Number of tasks currently running
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for StreamingEngine {
    fn submit(&self, task: Arc<WorkerTaskImpl>) -> Result<(), TaskRejectedError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TaskRejectedError::new("execution engine is shut down"));
        }
        self.inner.in_flight.send_modify(|n| *n += 1);
        if self.inner.backlog.push(task).is_err() {
            self.inner.finished(1);
            return Err(TaskRejectedError::new("execution backlog is full"));
        }
        Ok(())
    }

    fn abort_tasks(&self) -> usize {
        let (drained, running) = {
            let mut interrupt = self.inner.interrupt.lock();
            interrupt.cancel();
            *interrupt = CancellationToken::new();
            let drained = self.inner.backlog.drain().len();
            (drained, self.inner.running.load(Ordering::SeqCst))
        };
        self.inner.finished(drained);
        warn!(
            engine = %self.inner.name,
            drained,
            interrupted = running,
            "Aborted tasks"
        );
        drained + running
    }

    fn is_idle(&self) -> bool {
        *self.inner.in_flight.borrow() == 0
    }

    fn backlog_size(&self) -> usize {
        self.inner.backlog.len()
    }

    async fn wait_idle(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        // The sender lives in `inner`, so the channel cannot close here
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }

    fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.backlog.close();
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        self.slots.wait_exited(timeout).await
    }
}
