//! # taskmill core
//!
//! Queue-driven task dispatch for taskmill workers.
//!
//! The core takes task envelopes from a [`WorkerQueue`](taskmill_api::WorkerQueue),
//! runs them through a pluggable [`WorkerFactory`](taskmill_api::WorkerFactory)
//! and publishes every outcome back through the queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerCore                           │
//! │   (health gating, monitor, graceful shutdown, statistics)    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TaskDispatcher                         │
//! │   (decode, poison detection, job status, routing decision)   │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │              TaskExecutor ─► ExecutionEngine                 │
//! │       (streaming slots, or bulk slots with a backup)         │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │          WorkerTaskImpl ─► QueueWorkerCallback               │
//! │   (response accounting, tracking reports, publish/abandon)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskmill_core::{init_telemetry, CoreConfig, TelemetryConfig, WorkerCore};
//!
//! init_telemetry(TelemetryConfig::from_env())?;
//!
//! let core = WorkerCore::builder(Arc::new(my_queue), Arc::new(MyFactory::new()))
//!     .with_config(CoreConfig::from_env())
//!     .build();
//! core.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! core.shutdown().await?;
//! ```

pub mod callback;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod lifecycle;
pub mod memory;
pub mod progress;
pub mod stats;
pub mod status;
pub mod task;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use callback::{QueueWorkerCallback, WorkerCallback};
pub use config::CoreConfig;
pub use dispatch::TaskDispatcher;
pub use engine::{create_engine, EngineOptions, ExecutionEngine, FatalHandler};
pub use error::{CallbackError, CoreError};
pub use executor::TaskExecutor;
pub use health::{HealthCheck, HealthGate, TransientHealthRegistry};
pub use lifecycle::{CoreStatus, WorkerCore, WorkerCoreBuilder};
pub use memory::InMemoryWorkerQueue;
pub use progress::{TrackingReport, TrackingReportStatus, TrackingReportTask};
pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use status::{HttpJobStatusProber, JobStatus, JobStatusError, JobStatusProber};
pub use task::WorkerTaskImpl;
pub use telemetry::{init_telemetry, TelemetryConfig};
