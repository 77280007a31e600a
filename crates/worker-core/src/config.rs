//! Core configuration
//!
//! Read once from the environment at startup and shared immutably.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of progress reports buffered before a flush
pub const DEFAULT_PROGRESS_REPORT_BUFFER_LIMIT: usize = 5;

/// Default interval between job status checks
pub const DEFAULT_STATUS_CHECK_INTERVAL_MILLIS: u64 = 120_000;

/// Dispatch core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Check whether tasks are addressed to this worker's input queue
    pub diverted_task_checking: bool,

    /// Report 0% progress for tasks moving through tracked pipelines
    pub zero_progress_reporting: bool,

    /// Progress reports buffered per task before a flush
    pub progress_report_buffer_limit: usize,

    /// Overrides the worker name in outgoing source info
    pub worker_name: Option<String>,

    /// Maximum tasks waiting in an execution engine (None = unbounded)
    pub max_backlog: Option<usize>,

    /// How long an abandoned task keeps the worker unhealthy
    #[serde(with = "duration_millis")]
    pub transient_health_window: Duration,

    /// Next status check interval when the status service gives none
    pub default_status_check_interval_millis: u64,

    /// Period of the health monitor
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Grace period for in-flight tasks during shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            diverted_task_checking: true,
            zero_progress_reporting: false,
            progress_report_buffer_limit: DEFAULT_PROGRESS_REPORT_BUFFER_LIMIT,
            worker_name: None,
            max_backlog: None,
            transient_health_window: Duration::from_secs(30),
            default_status_check_interval_millis: DEFAULT_STATUS_CHECK_INTERVAL_MILLIS,
            health_check_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKMILL_ENABLE_DIVERTED_TASK_CHECKING` (default: true)
    /// - `TASKMILL_ENABLE_ZERO_PROGRESS_REPORTING` (default: false)
    /// - `TASKMILL_PROGRESS_REPORT_BUFFER_LIMIT` (default: 5)
    /// - `TASKMILL_WORKER_NAME`
    /// - `TASKMILL_MAX_BACKLOG`
    /// - `TASKMILL_TRANSIENT_HEALTH_WINDOW_SECS` (default: 30)
    /// - `TASKMILL_STATUS_CHECK_INTERVAL_MS` (default: 120000)
    /// - `TASKMILL_HEALTH_CHECK_INTERVAL_SECS` (default: 10)
    /// - `TASKMILL_SHUTDOWN_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(default)
        };
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            diverted_task_checking: flag(
                "TASKMILL_ENABLE_DIVERTED_TASK_CHECKING",
                defaults.diverted_task_checking,
            ),
            zero_progress_reporting: flag(
                "TASKMILL_ENABLE_ZERO_PROGRESS_REPORTING",
                defaults.zero_progress_reporting,
            ),
            progress_report_buffer_limit: number("TASKMILL_PROGRESS_REPORT_BUFFER_LIMIT")
                .map(|n| (n as usize).max(1))
                .unwrap_or(defaults.progress_report_buffer_limit),
            worker_name: lookup("TASKMILL_WORKER_NAME").filter(|name| !name.trim().is_empty()),
            max_backlog: number("TASKMILL_MAX_BACKLOG").map(|n| n as usize),
            transient_health_window: number("TASKMILL_TRANSIENT_HEALTH_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.transient_health_window),
            default_status_check_interval_millis: number("TASKMILL_STATUS_CHECK_INTERVAL_MS")
                .unwrap_or(defaults.default_status_check_interval_millis),
            health_check_interval: number("TASKMILL_HEALTH_CHECK_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_interval),
            shutdown_timeout: number("TASKMILL_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    /// Enable or disable diverted task checking
    pub fn with_diverted_task_checking(mut self, enabled: bool) -> Self {
        self.diverted_task_checking = enabled;
        self
    }

    /// Enable or disable zero progress reporting
    pub fn with_zero_progress_reporting(mut self, enabled: bool) -> Self {
        self.zero_progress_reporting = enabled;
        self
    }

    /// Set the progress report buffer limit
    pub fn with_progress_report_buffer_limit(mut self, limit: usize) -> Self {
        self.progress_report_buffer_limit = limit.max(1);
        self
    }

    /// Override the worker name
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    /// Bound the execution engine backlog
    pub fn with_max_backlog(mut self, max: usize) -> Self {
        self.max_backlog = Some(max);
        self
    }

    /// Set the transient health window
    pub fn with_transient_health_window(mut self, window: Duration) -> Self {
        self.transient_health_window = window;
        self
    }

    /// Set the health monitor period
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
