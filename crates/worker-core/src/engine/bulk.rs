//! Bulk engine: many tasks per worker invocation
//!
//! Each slot waits for a task, claims it and hands it to one
//! [`BulkWorker::process_tasks`] call through a [`BulkCursor`]. The worker
//! pulls further tasks from the shared backlog through the same cursor.
//!
//! Unlike the streaming engine, a failed invocation is not fatal: the
//! error is logged, and every task the invocation claimed but left without
//! a response is resubmitted to a one-slot streaming engine. An
//! interrupted invocation is dropped without resubmitting anything.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use taskmill_api::{
    BulkWorker, BulkWorkerRuntime, TaskRejectedError, WorkerFactory, WorkerTask,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    panic_message, EngineOptions, ExecutionEngine, LiveSlots, SlotGuard, StreamingEngine,
    TaskBacklog,
};
use crate::task::WorkerTaskImpl;

struct BulkInner {
    bulk_worker: Arc<dyn BulkWorker>,
    backlog: TaskBacklog<Arc<WorkerTaskImpl>>,
    backup: StreamingEngine,
    interrupt: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    /// Tasks claimed by invocations in progress
    claimed: Mutex<Vec<Arc<WorkerTaskImpl>>>,
    /// Queued plus claimed tasks
    in_flight: watch::Sender<usize>,
}

impl BulkInner {
    /// Claim a task for an invocation whose interrupt token is `token`
    fn claim(&self, token: &CancellationToken) -> Option<Arc<WorkerTaskImpl>> {
        let _interrupt = self.interrupt.lock();
        if token.is_cancelled() {
            return None;
        }
        let task = self.backlog.try_pop()?;
        self.claimed.lock().push(task.clone());
        Some(task)
    }

    fn claim_first(&self) -> Option<(Arc<WorkerTaskImpl>, CancellationToken)> {
        let interrupt = self.interrupt.lock();
        let task = self.backlog.try_pop()?;
        self.claimed.lock().push(task.clone());
        Some((task, interrupt.clone()))
    }

    /// Claimed tasks still waiting for their terminal response
    fn unanswered(&self) -> usize {
        self.claimed
            .lock()
            .iter()
            .filter(|task| !task.is_response_set())
            .count()
    }

    fn release(&self, tasks: &[Arc<WorkerTaskImpl>]) {
        self.claimed
            .lock()
            .retain(|held| !tasks.iter().any(|task| Arc::ptr_eq(held, task)));
        self.finished(tasks.len());
    }

    fn finished(&self, count: usize) {
        self.in_flight
            .send_modify(|n| *n = n.saturating_sub(count));
    }

    async fn run_slot(self: Arc<Self>, slot: usize, _live: SlotGuard) {
        debug!(slot, "Bulk slot started");
        loop {
            let available = tokio::select! {
                _ = self.shutdown.cancelled() => false,
                available = self.backlog.wait_available() => available,
            };
            if !available {
                break;
            }
            let Some((first, interrupt)) = self.claim_first() else {
                continue;
            };

            let mut cursor = BulkCursor {
                inner: self.clone(),
                first: Some(first),
                pulled: Vec::new(),
                interrupt: interrupt.clone(),
            };
            let claimed = self.invoke(&mut cursor, &interrupt).await;
            self.release(&claimed);
        }
        debug!(slot, "Bulk slot stopped");
    }

    /// Run one invocation and recover its unanswered tasks
    ///
    /// Returns the tasks the invocation had claimed.
    async fn invoke(
        &self,
        cursor: &mut BulkCursor,
        interrupt: &CancellationToken,
    ) -> Vec<Arc<WorkerTaskImpl>> {
        let outcome = {
            let invocation = AssertUnwindSafe(self.bulk_worker.process_tasks(cursor)).catch_unwind();
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => None,
                outcome = invocation => Some(outcome),
            }
        };

        let claimed: Vec<_> = cursor.first.iter().chain(&cursor.pulled).cloned().collect();
        match outcome {
            None => {
                warn!(claimed = claimed.len(), "Bulk invocation interrupted, dropping its tasks");
                return claimed;
            }
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => error!(error = %e, "Bulk invocation failed"),
            Some(Err(panic)) => error!(
                reason = %panic_message(panic.as_ref()),
                "Bulk invocation panicked"
            ),
        }

        if let Some(first) = cursor.first.take() {
            warn!(
                task_id = %first.task_id(),
                "Bulk worker returned without taking its first task, running it on its own"
            );
            self.resubmit(first);
        }
        for task in cursor.pulled.drain(..) {
            if !task.is_response_set() {
                warn!(
                    task_id = %task.task_id(),
                    "Bulk worker left a task without a response, running it on its own"
                );
                self.resubmit(task);
            }
        }
        claimed
    }

    fn resubmit(&self, task: Arc<WorkerTaskImpl>) {
        let task_id = task.task_id().to_string();
        if let Err(e) = self.backup.submit(task) {
            error!(task_id = %task_id, error = %e, "Failed to resubmit task");
        }
    }
}

/// The tasks available to one bulk invocation
pub struct BulkCursor {
    inner: Arc<BulkInner>,
    /// The claimed task the worker has not taken yet
    first: Option<Arc<WorkerTaskImpl>>,
    /// Tasks handed to the worker
    pulled: Vec<Arc<WorkerTaskImpl>>,
    interrupt: CancellationToken,
}

impl BulkCursor {
    fn hand_out(&mut self, task: Arc<WorkerTaskImpl>) -> Arc<dyn WorkerTask> {
        self.pulled.push(task.clone());
        task
    }
}

#[async_trait]
impl BulkWorkerRuntime for BulkCursor {
    async fn next_task(&mut self) -> Option<Arc<dyn WorkerTask>> {
        if let Some(first) = self.first.take() {
            return Some(self.hand_out(first));
        }
        let task = self.inner.claim(&self.interrupt)?;
        Some(self.hand_out(task))
    }

    async fn next_task_within(&mut self, wait: Duration) -> Option<Arc<dyn WorkerTask>> {
        if let Some(task) = self.next_task().await {
            return Some(task);
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let available = tokio::select! {
                _ = self.interrupt.cancelled() => return None,
                available = tokio::time::timeout_at(deadline, self.inner.backlog.wait_available()) => available,
            };
            match available {
                Ok(true) => {
                    if let Some(task) = self.inner.claim(&self.interrupt) {
                        return Some(self.hand_out(task));
                    }
                }
                Ok(false) | Err(_) => return None,
            }
        }
    }
}

/// Dedicated slots feeding a bulk worker, backed by a one-slot streaming engine
pub struct BulkEngine {
    inner: Arc<BulkInner>,
    slots: Arc<LiveSlots>,
}

impl BulkEngine {
    /// Start `threads` bulk slots; must be called within a tokio runtime
    pub fn new(
        bulk_worker: Arc<dyn BulkWorker>,
        factory: Arc<dyn WorkerFactory>,
        threads: usize,
        options: EngineOptions,
    ) -> Self {
        let backup = StreamingEngine::new(
            "bulk-backup",
            factory,
            1,
            EngineOptions {
                max_backlog: None,
                fatal_handler: options.fatal_handler.clone(),
            },
        );
        let (in_flight, _) = watch::channel(0);
        let inner = Arc::new(BulkInner {
            bulk_worker,
            backlog: TaskBacklog::new(options.max_backlog),
            backup,
            interrupt: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            claimed: Mutex::new(Vec::new()),
            in_flight,
        });

        let slots = LiveSlots::new();
        for slot in 0..threads.max(1) {
            tokio::spawn(inner.clone().run_slot(slot, slots.enter()));
        }

        Self { inner, slots }
    }
}

#[async_trait]
impl ExecutionEngine for BulkEngine {
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
        let (drained, unanswered) = {
            let mut interrupt = self.inner.interrupt.lock();
            interrupt.cancel();
            *interrupt = CancellationToken::new();
            let drained = self.inner.backlog.drain().len();
            (drained, self.inner.unanswered())
        };
        self.inner.finished(drained);
        let backup = self.inner.backup.abort_tasks();
        warn!(drained, interrupted = unanswered, backup, "Aborted bulk tasks");
        drained + unanswered + backup
    }

    fn is_idle(&self) -> bool {
        *self.inner.in_flight.borrow() == 0 && self.inner.backup.is_idle()
    }

    fn backlog_size(&self) -> usize {
        self.inner.backlog.len() + self.inner.backup.backlog_size()
    }

    async fn wait_idle(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        // Unanswered tasks move to the backup before the bulk count drops
        let _ = in_flight.wait_for(|n| *n == 0).await;
        self.inner.backup.wait_idle().await;
    }

    fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.backlog.close();
        self.inner.backup.shutdown();
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let slots_done = self.slots.wait_exited(timeout).await;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let backup_done = self.inner.backup.await_termination(remaining).await;
        slots_done && backup_done
    }
}

#[cfg(test)]
mod tests {
    use taskmill_api::{
        Headers, TaskInformation, TaskMessage, TaskStatus, Worker, WorkerError, WorkerResponse,
    };

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::CoreConfig;
    use crate::task::DispatchContext;
    use crate::testing::{CallbackEvent, RecordingCallback, StubFactory};

    struct SingleWorker;

    #[async_trait]
    impl Worker for SingleWorker {
        async fn do_work(&self) -> Result<WorkerResponse, WorkerError> {
            Ok(WorkerResponse::success("single-out", "echo", 1, b"single".to_vec()))
        }

        fn worker_identifier(&self) -> &str {
            "single"
        }

        fn worker_api_version(&self) -> u32 {
            1
        }

        fn general_failure_result(&self, error: &anyhow::Error) -> WorkerResponse {
            WorkerResponse::exception("single-out", "echo", 1, error.to_string().into_bytes())
        }
    }

    /// Answers up to `take` tasks, then returns or fails
    struct TestBulkWorker {
        take: usize,
        answer: bool,
        fail: bool,
        invocations: AtomicUsize,
    }

    impl TestBulkWorker {
        fn new(take: usize, answer: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                take,
                answer,
                fail,
                invocations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BulkWorker for TestBulkWorker {
        async fn process_tasks(&self, runtime: &mut dyn BulkWorkerRuntime) -> anyhow::Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            for _ in 0..self.take {
                let Some(task) = runtime.next_task_within(Duration::from_millis(20)).await else {
                    break;
                };
                if self.answer {
                    task.set_response(WorkerResponse::success("bulk-out", "echo", 1, b"bulk".to_vec()))
                        .await;
                }
            }
            if self.fail {
                anyhow::bail!("batch store unavailable");
            }
            Ok(())
        }
    }

    /// Answers `answer` tasks, takes one more and never finishes
    struct StalledBulkWorker {
        answer: usize,
    }

    #[async_trait]
    impl BulkWorker for StalledBulkWorker {
        async fn process_tasks(&self, runtime: &mut dyn BulkWorkerRuntime) -> anyhow::Result<()> {
            for taken in 0..=self.answer {
                let Some(task) = runtime.next_task_within(Duration::from_secs(5)).await else {
                    break;
                };
                if taken < self.answer {
                    task.set_response(WorkerResponse::success("bulk-out", "echo", 1, b"bulk".to_vec()))
                        .await;
                }
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Harness {
        callback: Arc<RecordingCallback>,
        ctx: Arc<DispatchContext>,
        factory: Arc<StubFactory>,
    }

    fn harness() -> Harness {
        let callback = Arc::new(RecordingCallback::default());
        let factory = Arc::new(
            StubFactory::new("invalid")
                .with_workers(|_| Ok(Box::new(SingleWorker) as Box<dyn Worker>)),
        );
        let ctx = Arc::new(DispatchContext::new(
            callback.clone(),
            factory.clone(),
            Arc::new(CoreConfig::default()),
            "in",
        ));
        Harness {
            callback,
            ctx,
            factory,
        }
    }

    impl Harness {
        fn task(&self, id: &str) -> Arc<WorkerTaskImpl> {
            let message = TaskMessage::new(id, "echo", 1, b"x".to_vec(), TaskStatus::NewTask);
            Arc::new(WorkerTaskImpl::new(
                message,
                Arc::new(TaskInformation::new(id)),
                Headers::new(),
                false,
                self.ctx.clone(),
            ))
        }

        fn engine(&self, bulk_worker: Arc<dyn BulkWorker>) -> BulkEngine {
            BulkEngine::new(
                bulk_worker,
                self.factory.clone(),
                1,
                EngineOptions {
                    max_backlog: None,
                    fatal_handler: Arc::new(|reason: &str| panic!("unexpected fatal fault: {reason}")),
                },
            )
        }

        fn completed_to(&self) -> Vec<String> {
            self.callback
                .events()
                .into_iter()
                .filter_map(|event| match event {
                    CallbackEvent::Complete { queue, .. } => queue,
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_bulk_worker_answers_batch() {
        let h = harness();
        let worker = TestBulkWorker::new(10, true, false);
        let engine = h.engine(worker.clone());

        for i in 0..3 {
            engine.submit(h.task(&format!("t{i}"))).unwrap();
        }
        engine.wait_idle().await;

        assert_eq!(h.completed_to(), vec!["bulk-out"; 3]);
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn test_untaken_first_task_is_resubmitted() {
        let h = harness();
        let engine = h.engine(TestBulkWorker::new(0, true, false));

        engine.submit(h.task("t1")).unwrap();
        engine.wait_idle().await;

        let events = h.callback.events();
        assert_eq!(events.len(), 1);
        let CallbackEvent::Complete { queue, message } = &events[0] else {
            panic!("expected completion");
        };
        assert_eq!(queue.as_deref(), Some("single-out"));
        assert_eq!(message.task_id, "t1");
    }

    #[tokio::test]
    async fn test_unanswered_tasks_are_resubmitted_after_failure() {
        let h = harness();
        let engine = h.engine(TestBulkWorker::new(2, false, true));

        engine.submit(h.task("t1")).unwrap();
        engine.submit(h.task("t2")).unwrap();
        engine.wait_idle().await;

        let mut ids: Vec<_> = h
            .callback
            .events()
            .into_iter()
            .filter_map(|event| match event {
                CallbackEvent::Complete { queue, message } => {
                    assert_eq!(queue.as_deref(), Some("single-out"));
                    Some(message.task_id)
                }
                _ => None,
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_abort_counts_only_unanswered_tasks() {
        let h = harness();
        let engine = h.engine(Arc::new(StalledBulkWorker { answer: 2 }));

        for i in 0..3 {
            engine.submit(h.task(&format!("t{i}"))).unwrap();
        }
        while h.completed_to().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(engine.abort_tasks(), 1);
        engine.wait_idle().await;
        assert_eq!(h.completed_to().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_slots() {
        let h = harness();
        let engine = h.engine(TestBulkWorker::new(1, true, false));

        engine.shutdown();
        assert!(engine.await_termination(Duration::from_secs(1)).await);
        assert!(engine.submit(h.task("t1")).is_err());
    }
}
