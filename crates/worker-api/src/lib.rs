//! # taskmill API
//!
//! Contracts shared by the taskmill dispatch core, queue transports and
//! worker implementations.
//!
//! - [`TaskMessage`] is the wire envelope for tasks and results, with optional
//!   [`TrackingInfo`] for job tracking.
//! - [`TaskInformation`] accounts for the responses one inbound message
//!   produces and the acknowledgements received for them.
//! - [`Worker`], [`WorkerTask`] and [`WorkerFactory`] are implemented by task
//!   processing code; [`BulkWorker`], [`DivertedTaskHandler`] and
//!   [`TaskForwardingEvaluator`] are optional factory capabilities.
//! - [`WorkerQueue`] and [`TaskCallback`] form the seam to a queue transport.
//! - [`Codec`] converts envelopes to and from bytes.
//!
//! ```text
//!  queue transport ──register_new_task──► TaskCallback (dispatch core)
//!        ▲                                      │
//!        │ publish / ack / reject               ▼
//!   WorkerQueue ◄──────────────────────── WorkerFactory ─► Worker::do_work
//! ```

pub mod codec;
pub mod error;
pub mod health;
pub mod message;
pub mod queue;
pub mod task_information;
pub mod worker;

pub use codec::{Codec, CodecError, CodecExt, DecodeMethod, JsonCodec};
pub use error::{InvalidTaskError, TaskRejectedError, WorkerError};
pub use health::{HealthResult, HealthStatus};
pub use message::{
    InvalidJobTaskIdError, SourceInfo, TaskMessage, TaskStatus, TrackingInfo,
    TASK_MESSAGE_VERSION,
};
pub use queue::{headers, Headers, QueueError, TaskCallback, TaskCallbackError, WorkerQueue};
pub use task_information::TaskInformation;
pub use worker::{
    BulkWorker, BulkWorkerRuntime, DivertedTaskAction, DivertedTaskHandler, FactoryCapabilities,
    ForwardingDecision, TaskForwardingEvaluator, Worker, WorkerConfiguration, WorkerFactory,
    WorkerResponse, WorkerTask,
};
