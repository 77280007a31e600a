//! Health gating
//!
//! A [`HealthGate`] runs named health checks and reacts to their results.
//! Ingestion starts once every check has passed, stops as soon as any check
//! fails and resumes when all of them pass again.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use taskmill_api::{HealthResult, WorkerFactory, WorkerQueue};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;

/// A named health check
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthResult;
}

/// What the gate switches on and off
#[async_trait]
pub trait IngestionControl: Send + Sync {
    /// Begin consuming for the first time
    async fn start(&self) -> Result<(), CoreError>;

    fn disconnect(&self);

    fn reconnect(&self);
}

/// Recent faults that keep the worker unhealthy for a while
///
/// Each fault counts against health for `window` after it was recorded.
/// Expired faults are dropped on the next check.
pub struct TransientHealthRegistry {
    window: Duration,
    faults: Mutex<VecDeque<(Instant, String)>>,
}

impl TransientHealthRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            faults: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_fault(&self, reason: &str) {
        self.faults
            .lock()
            .push_back((Instant::now(), reason.to_string()));
    }

    pub fn check(&self) -> HealthResult {
        let mut faults = self.faults.lock();
        let now = Instant::now();
        while faults
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) >= self.window)
        {
            faults.pop_front();
        }

        match faults.back() {
            None => HealthResult::healthy(),
            Some((_, reason)) => HealthResult::unhealthy(format!(
                "{} recent fault(s), most recent: {reason}",
                faults.len()
            )),
        }
    }
}

#[derive(Default)]
struct GateState {
    unhealthy: HashSet<String>,
    started: bool,
    closed: bool,
}

/// Gates ingestion on the combined result of its checks
pub struct HealthGate {
    checks: Vec<Arc<dyn HealthCheck>>,
    ingestion: Arc<dyn IngestionControl>,
    state: tokio::sync::Mutex<GateState>,
}

impl HealthGate {
    /// Every check starts out unhealthy until it has passed once
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, ingestion: Arc<dyn IngestionControl>) -> Self {
        let unhealthy = checks.iter().map(|c| c.name().to_string()).collect();
        Self {
            checks,
            ingestion,
            state: tokio::sync::Mutex::new(GateState {
                unhealthy,
                ..Default::default()
            }),
        }
    }

    /// Names of the checks that failed on their last run
    pub async fn unhealthy_checks(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().await.unhealthy.iter().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    /// Stop reacting to check results
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    /// Run every check, reacting to each, and combine the results
    pub async fn check_all(&self) -> HealthResult {
        let mut failures = Vec::new();
        for check in &self.checks {
            let result = self.run_check(check.as_ref()).await;
            if !result.is_healthy() {
                let detail = result.message.unwrap_or_else(|| "unhealthy".to_string());
                failures.push(format!("{}: {detail}", check.name()));
            }
        }

        if failures.is_empty() {
            HealthResult::healthy()
        } else {
            HealthResult::unhealthy(failures.join("; "))
        }
    }

    /// Run one check and react to its result
    ///
    /// Checking and reacting happen under one lock so that concurrent
    /// checks cannot reorder disconnect and reconnect calls.
    pub async fn run_check(&self, check: &dyn HealthCheck) -> HealthResult {
        let mut state = self.state.lock().await;
        let result = check.check().await;
        if state.closed {
            return result;
        }

        let name = check.name();
        if result.is_healthy() {
            let recovered = state.unhealthy.remove(name);
            if recovered {
                info!(check = %name, "Health check recovered");
            }
            if state.unhealthy.is_empty() {
                if !state.started {
                    match self.ingestion.start().await {
                        Ok(()) => {
                            info!("All health checks passed, starting ingestion");
                            state.started = true;
                        }
                        Err(e) => error!(error = %e, "Failed to start ingestion"),
                    }
                } else if recovered {
                    info!("All health checks passed, reconnecting ingestion");
                    self.ingestion.reconnect();
                }
            }
        } else {
            let was_healthy = state.unhealthy.is_empty();
            if state.unhealthy.insert(name.to_string()) {
                warn!(check = %name, message = ?result.message, "Health check failed");
            }
            if was_healthy && state.started {
                warn!("Disconnecting ingestion until health recovers");
                self.ingestion.disconnect();
            }
        }
        result
    }

    /// Run all checks every `interval` until `shutdown` is cancelled
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        gate.check_all().await;
                    }
                }
            }
        })
    }
}

/// Health of the queue transport
pub struct QueueHealthCheck {
    queue: Arc<dyn WorkerQueue>,
}

impl QueueHealthCheck {
    pub fn new(queue: Arc<dyn WorkerQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl HealthCheck for QueueHealthCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> HealthResult {
        self.queue.health_check().await
    }
}

/// Readiness of the worker factory
pub struct FactoryHealthCheck {
    factory: Arc<dyn WorkerFactory>,
}

impl FactoryHealthCheck {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl HealthCheck for FactoryHealthCheck {
    fn name(&self) -> &str {
        "worker"
    }

    async fn check(&self) -> HealthResult {
        self.factory.health_check().await
    }
}

/// Recent abandoned tasks
pub struct TransientHealthCheck {
    registry: Arc<TransientHealthRegistry>,
}

impl TransientHealthCheck {
    pub fn new(registry: Arc<TransientHealthRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HealthCheck for TransientHealthCheck {
    fn name(&self) -> &str {
        "transient"
    }

    async fn check(&self) -> HealthResult {
        self.registry.check()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct ToggleCheck {
        name: String,
        healthy: AtomicBool,
    }

    impl ToggleCheck {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                healthy: AtomicBool::new(true),
            })
        }

        fn set(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HealthCheck for ToggleCheck {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check(&self) -> HealthResult {
            if self.healthy.load(Ordering::SeqCst) {
                HealthResult::healthy()
            } else {
                HealthResult::unhealthy("down")
            }
        }
    }

    #[derive(Default)]
    struct CountingIngestion {
        starts: AtomicUsize,
        disconnects: AtomicUsize,
        reconnects: AtomicUsize,
    }

    #[async_trait]
    impl IngestionControl for CountingIngestion {
        async fn start(&self) -> Result<(), CoreError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gate(checks: &[Arc<ToggleCheck>]) -> (HealthGate, Arc<CountingIngestion>) {
        let ingestion = Arc::new(CountingIngestion::default());
        let checks = checks
            .iter()
            .map(|c| c.clone() as Arc<dyn HealthCheck>)
            .collect();
        (HealthGate::new(checks, ingestion.clone()), ingestion)
    }

    #[tokio::test]
    async fn test_starts_only_after_all_checks_pass() {
        let a = ToggleCheck::new("a");
        let b = ToggleCheck::new("b");
        b.set(false);
        let (gate, ingestion) = gate(&[a.clone(), b.clone()]);

        let result = gate.check_all().await;
        assert!(!result.is_healthy());
        assert_eq!(ingestion.starts.load(Ordering::SeqCst), 0);
        assert_eq!(gate.unhealthy_checks().await, vec!["b".to_string()]);

        b.set(true);
        assert!(gate.check_all().await.is_healthy());
        assert_eq!(ingestion.starts.load(Ordering::SeqCst), 1);
        assert!(gate.is_started().await);

        gate.check_all().await;
        assert_eq!(ingestion.starts.load(Ordering::SeqCst), 1);
        assert_eq!(ingestion.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_disconnect_and_reconnect() {
        let a = ToggleCheck::new("a");
        let b = ToggleCheck::new("b");
        let c = ToggleCheck::new("c");
        let (gate, ingestion) = gate(&[a.clone(), b.clone(), c.clone()]);
        gate.check_all().await;

        b.set(false);
        gate.check_all().await;
        gate.check_all().await;
        assert_eq!(ingestion.disconnects.load(Ordering::SeqCst), 1);

        b.set(true);
        gate.check_all().await;
        assert_eq!(ingestion.reconnects.load(Ordering::SeqCst), 1);
        assert!(gate.unhealthy_checks().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_every_check() {
        let a = ToggleCheck::new("a");
        let b = ToggleCheck::new("b");
        let (gate, ingestion) = gate(&[a.clone(), b.clone()]);
        gate.check_all().await;

        a.set(false);
        b.set(false);
        gate.check_all().await;
        assert_eq!(ingestion.disconnects.load(Ordering::SeqCst), 1);

        a.set(true);
        gate.check_all().await;
        assert_eq!(ingestion.reconnects.load(Ordering::SeqCst), 0);

        b.set(true);
        gate.check_all().await;
        assert_eq!(ingestion.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_does_not_react() {
        let a = ToggleCheck::new("a");
        let (gate, ingestion) = gate(&[a.clone()]);
        gate.close().await;

        assert!(gate.check_all().await.is_healthy());
        assert_eq!(ingestion.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_runs_until_cancelled() {
        let a = ToggleCheck::new("a");
        let (gate, ingestion) = gate(&[a.clone()]);
        let gate = Arc::new(gate);
        let shutdown = CancellationToken::new();

        let handle = gate.spawn_monitor(Duration::from_secs(1), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ingestion.starts.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_transient_registry_window() {
        let registry = TransientHealthRegistry::new(Duration::from_millis(50));
        assert!(registry.check().is_healthy());

        registry.record_fault("publish failed");
        let result = registry.check();
        assert!(!result.is_healthy());
        assert!(result.message.unwrap().contains("publish failed"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(registry.check().is_healthy());
    }
}
