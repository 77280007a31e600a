//! Dispatch core lifecycle
//!
//! [`WorkerCore`] wires a queue transport, a worker factory and the
//! dispatch machinery together, gates ingestion on health and coordinates
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use taskmill_api::{Codec, HealthResult, JsonCodec, TaskCallback, WorkerFactory, WorkerQueue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::callback::QueueWorkerCallback;
use crate::config::CoreConfig;
use crate::dispatch::TaskDispatcher;
use crate::engine::{
    create_engine, exit_process_handler, EngineOptions, ExecutionEngine, FatalHandler,
};
use crate::error::CoreError;
use crate::executor::TaskExecutor;
use crate::health::{
    FactoryHealthCheck, HealthCheck, HealthGate, IngestionControl, QueueHealthCheck,
    TransientHealthCheck, TransientHealthRegistry,
};
use crate::stats::WorkerStats;
use crate::status::{HttpJobStatusProber, JobStatusProber};
use crate::task::DispatchContext;

/// Lifecycle status of a [`WorkerCore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreStatus {
    Created,
    Running,
    Draining,
    Stopped,
}

/// Starts and pauses the queue on behalf of the health gate
struct QueueIngestion {
    queue: Arc<dyn WorkerQueue>,
    dispatcher: Arc<TaskDispatcher>,
}

#[async_trait]
impl IngestionControl for QueueIngestion {
    async fn start(&self) -> Result<(), CoreError> {
        let callback: Arc<dyn TaskCallback> = self.dispatcher.clone();
        self.queue.start(callback).await?;
        Ok(())
    }

    fn disconnect(&self) {
        self.queue.disconnect_incoming();
    }

    fn reconnect(&self) {
        self.queue.reconnect_incoming();
    }
}

/// Builds a [`WorkerCore`]
pub struct WorkerCoreBuilder {
    queue: Arc<dyn WorkerQueue>,
    factory: Arc<dyn WorkerFactory>,
    config: CoreConfig,
    codec: Arc<dyn Codec>,
    prober: Option<Arc<dyn JobStatusProber>>,
    fatal_handler: FatalHandler,
    health_checks: Vec<Arc<dyn HealthCheck>>,
}

impl WorkerCoreBuilder {
    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the HTTP job status prober
    pub fn with_prober(mut self, prober: Arc<dyn JobStatusProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Handler for faults that leave the execution engine unusable
    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    /// Gate ingestion on an additional check
    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    /// Assemble the core; must be called within a tokio runtime
    pub fn build(self) -> WorkerCore {
        let config = Arc::new(self.config);
        let stats = Arc::new(WorkerStats::new());
        let transient = Arc::new(TransientHealthRegistry::new(config.transient_health_window));
        let capabilities = self.factory.capabilities();
        let input_queue = self.queue.input_queue().to_string();

        let callback = Arc::new(QueueWorkerCallback::new(
            self.queue.clone(),
            self.codec.clone(),
            stats.clone(),
            transient.clone(),
        ));
        let ctx = Arc::new(
            DispatchContext::new(callback, self.factory.clone(), config.clone(), input_queue.clone())
                .with_stats(stats.clone()),
        );
        let engine = create_engine(
            self.factory.clone(),
            &capabilities,
            EngineOptions {
                max_backlog: config.max_backlog,
                fatal_handler: self.fatal_handler,
            },
        );
        let executor = TaskExecutor::new(ctx, engine.clone(), capabilities);

        let prober = self.prober.unwrap_or_else(|| {
            Arc::new(
                HttpJobStatusProber::new()
                    .with_default_interval_millis(config.default_status_check_interval_millis),
            )
        });
        let dispatcher = Arc::new(
            TaskDispatcher::new(
                executor,
                self.codec,
                config.clone(),
                stats.clone(),
                input_queue.clone(),
                self.queue.paused_queue().map(str::to_string),
            )
            .with_prober(prober),
        );

        let mut checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(QueueHealthCheck::new(self.queue.clone())),
            Arc::new(FactoryHealthCheck::new(self.factory.clone())),
            Arc::new(TransientHealthCheck::new(transient)),
        ];
        checks.extend(self.health_checks);
        let ingestion = Arc::new(QueueIngestion {
            queue: self.queue.clone(),
            dispatcher: dispatcher.clone(),
        });
        let gate = Arc::new(HealthGate::new(checks, ingestion));

        info!(
            input_queue = %input_queue,
            threads = self.factory.worker_threads(),
            "Dispatch core created"
        );

        WorkerCore {
            config,
            queue: self.queue,
            factory: self.factory,
            stats,
            engine,
            dispatcher,
            gate,
            status: RwLock::new(CoreStatus::Created),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }
}

/// A running dispatch core
///
/// # Example
///
/// ```ignore
/// use taskmill_core::{CoreConfig, WorkerCore};
///
/// let core = WorkerCore::builder(queue, factory)
///     .with_config(CoreConfig::from_env())
///     .build();
///
/// // Ingestion starts once every health check passes
/// core.start().await?;
///
/// // ... later
/// core.shutdown().await?;
/// ```
pub struct WorkerCore {
    config: Arc<CoreConfig>,
    queue: Arc<dyn WorkerQueue>,
    factory: Arc<dyn WorkerFactory>,
    stats: Arc<WorkerStats>,
    engine: Arc<dyn ExecutionEngine>,
    dispatcher: Arc<TaskDispatcher>,
    gate: Arc<HealthGate>,
    status: RwLock<CoreStatus>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerCore {
    pub fn builder(queue: Arc<dyn WorkerQueue>, factory: Arc<dyn WorkerFactory>) -> WorkerCoreBuilder {
        WorkerCoreBuilder {
            queue,
            factory,
            config: CoreConfig::default(),
            codec: Arc::new(JsonCodec::new()),
            prober: None,
            fatal_handler: exit_process_handler(),
            health_checks: Vec::new(),
        }
    }

    /// Run the health checks once and keep monitoring them
    ///
    /// Ingestion starts as soon as every check has passed, which may be
    /// on a later monitor tick.
    #[instrument(skip(self), fields(input_queue = %self.queue.input_queue()))]
    pub async fn start(&self) -> Result<(), CoreError> {
        {
            let mut status = self.status.write();
            match *status {
                CoreStatus::Created => *status = CoreStatus::Running,
                CoreStatus::Running => return Err(CoreError::AlreadyStarted),
                CoreStatus::Draining | CoreStatus::Stopped => return Err(CoreError::ShutDown),
            }
        }

        let health = self.gate.check_all().await;
        if !health.is_healthy() {
            warn!(message = ?health.message, "Not healthy yet, ingestion waits for the health monitor");
        }
        let monitor = self
            .gate
            .spawn_monitor(self.config.health_check_interval, self.shutdown.child_token());
        *self.monitor.lock() = Some(monitor);
        Ok(())
    }

    /// Run every gating check now
    pub async fn health_check(&self) -> HealthResult {
        self.gate.check_all().await
    }

    /// Whether the process is alive, regardless of readiness
    pub async fn liveness(&self) -> HealthResult {
        self.factory.liveness_check().await
    }

    pub fn status(&self) -> CoreStatus {
        *self.status.read()
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The callback deliveries are registered through
    pub fn task_callback(&self) -> Arc<dyn TaskCallback> {
        self.dispatcher.clone()
    }

    pub fn health_gate(&self) -> &Arc<HealthGate> {
        &self.gate
    }

    pub fn backlog_size(&self) -> usize {
        self.engine.backlog_size()
    }

    pub fn is_idle(&self) -> bool {
        self.engine.is_idle()
    }

    /// Resolve once no task is queued or running
    pub async fn wait_idle(&self) {
        self.engine.wait_idle().await;
    }

    /// Shut down, giving in-flight tasks the configured grace period
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.shutdown_within(self.config.shutdown_timeout).await
    }

    /// Stop ingestion, let in-flight tasks finish for up to `grace`, abort
    /// whatever is left and release the engine, the factory and the queue
    #[instrument(skip(self), fields(input_queue = %self.queue.input_queue()))]
    pub async fn shutdown_within(&self, grace: Duration) -> Result<(), CoreError> {
        {
            let mut status = self.status.write();
            if matches!(*status, CoreStatus::Draining | CoreStatus::Stopped) {
                return Ok(());
            }
            *status = CoreStatus::Draining;
        }
        info!(grace_ms = grace.as_millis() as u64, "Initiating graceful shutdown");

        self.shutdown.cancel();
        self.gate.close().await;
        self.queue.disconnect_incoming();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        let remaining = match tokio::time::timeout(grace, self.engine.wait_idle()).await {
            Ok(()) => {
                debug!("All tasks completed");
                0
            }
            Err(_) => {
                let aborted = self.engine.abort_tasks();
                warn!(aborted, "Shutdown grace period elapsed, aborting remaining tasks");
                self.stats.add_tasks_aborted(aborted as u64);
                aborted
            }
        };

        self.engine.shutdown();
        if !self.engine.await_termination(grace).await {
            warn!("Execution slots did not stop in time");
        }
        self.factory.shutdown().await;
        self.queue.shutdown().await;

        *self.status.write() = CoreStatus::Stopped;
        info!(remaining, "Dispatch core stopped");

        if remaining > 0 {
            return Err(CoreError::ShutdownTimeout { remaining });
        }
        Ok(())
    }
}
