// Logging setup for worker processes
//
// Installs a tracing-subscriber registry with an EnvFilter and a console layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name recorded at startup
    pub service_name: String,
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "taskmill_core=debug")
    pub log_filter: Option<String>,
    /// Include the event target in console output
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "taskmill-worker".to_string(),
            enable_console: true,
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKMILL_SERVICE_NAME`: Service name (default: "taskmill-worker")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("TASKMILL_SERVICE_NAME")
                .unwrap_or_else(|_| "taskmill-worker".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ..Default::default()
        }
    }

    /// Build the filter, falling back to `info` when none is set or it is invalid
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(config.env_filter())
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(service = %config.service_name, "Logging initialized");
    Ok(())
}
