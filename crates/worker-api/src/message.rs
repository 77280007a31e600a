//! Task message envelope
//!
//! A [`TaskMessage`] carries one unit of work (or one result) between workers.
//! Binary fields are base64 encoded on the wire.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Current envelope format version
pub const TASK_MESSAGE_VERSION: u32 = 3;

/// Status of a task message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// A task to be processed
    NewTask,
    /// The task could not be understood by the worker that received it
    InvalidTask,
    /// The worker completed the task
    ResultSuccess,
    /// The worker ran the task but it failed
    ResultFailure,
    /// The worker failed with an unexpected fault
    ResultException,
}

impl TaskStatus {
    /// Whether a response carrying this status counts as a success
    pub fn is_successful_response(self) -> bool {
        matches!(self, Self::NewTask | Self::ResultSuccess)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewTask => write!(f, "NEW_TASK"),
            Self::InvalidTask => write!(f, "INVALID_TASK"),
            Self::ResultSuccess => write!(f, "RESULT_SUCCESS"),
            Self::ResultFailure => write!(f, "RESULT_FAILURE"),
            Self::ResultException => write!(f, "RESULT_EXCEPTION"),
        }
    }
}

/// The job task id could not be split into a job identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job task id: {job_task_id:?}")]
pub struct InvalidJobTaskIdError {
    pub job_task_id: String,
}

/// Job tracking details carried by a task while its job is being tracked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingInfo {
    /// `<jobId>[.<subtask>]*`
    #[serde(default)]
    pub job_task_id: String,

    /// When the job status was last checked
    #[serde(default)]
    pub last_status_check_time: Option<DateTime<Utc>>,

    /// Where the job status can be checked
    #[serde(default)]
    pub status_check_url: Option<String>,

    /// How long to wait between status checks
    #[serde(default)]
    pub status_check_interval_millis: u64,

    /// Queue that receives progress reports
    #[serde(default)]
    pub tracking_pipe: Option<String>,

    /// Queue at which tracking stops
    #[serde(default)]
    pub track_to: Option<String>,
}

impl TrackingInfo {
    /// Create tracking info for a job task
    pub fn new(job_task_id: impl Into<String>) -> Self {
        Self {
            job_task_id: job_task_id.into(),
            last_status_check_time: None,
            status_check_url: None,
            status_check_interval_millis: 0,
            tracking_pipe: None,
            track_to: None,
        }
    }

    /// Set the status check URL
    pub fn with_status_check_url(mut self, url: impl Into<String>) -> Self {
        self.status_check_url = Some(url.into());
        self
    }

    /// Set the tracking pipe
    pub fn with_tracking_pipe(mut self, pipe: impl Into<String>) -> Self {
        self.tracking_pipe = Some(pipe.into());
        self
    }

    /// Set the queue at which tracking stops
    pub fn with_track_to(mut self, queue: impl Into<String>) -> Self {
        self.track_to = Some(queue.into());
        self
    }

    /// Extract the job identifier (the segment before the first `.`)
    pub fn job_id(&self) -> Result<&str, InvalidJobTaskIdError> {
        let invalid = || InvalidJobTaskIdError {
            job_task_id: self.job_task_id.clone(),
        };

        let mut segments = self.job_task_id.split('.');
        let job_id = segments.next().unwrap_or_default();
        if job_id.is_empty() || job_id.contains('*') {
            return Err(invalid());
        }
        if segments.any(str::is_empty) {
            return Err(invalid());
        }
        Ok(job_id)
    }

    /// Whether a status check is due at `now`
    pub fn is_status_check_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_status_check_time {
            None => true,
            Some(last) => ChronoDuration::from_std(std::time::Duration::from_millis(
                self.status_check_interval_millis,
            ))
            .ok()
            .and_then(|interval| last.checked_add_signed(interval))
            .is_some_and(|next| now >= next),
        }
    }

    /// Record the outcome of a status check
    pub fn record_status_check(&mut self, checked_at: DateTime<Utc>, interval_millis: u64) {
        self.last_status_check_time = Some(checked_at);
        self.status_check_interval_millis = interval_millis;
    }

    /// Whether tracking ends when a message is published to `queue`
    ///
    /// A missing destination matches a missing `track_to`.
    pub fn ends_at(&self, queue: Option<&str>) -> bool {
        self.track_to.as_deref() == queue
    }

    /// Copy of this tracking info with `suffix` appended to the job task id
    pub fn with_job_task_id_suffix(&self, suffix: &str) -> Self {
        let mut tracking = self.clone();
        tracking.job_task_id.push_str(suffix);
        tracking
    }
}

/// Name and version of the agent that produced a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub name: String,
    pub version: String,
}

impl SourceInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

fn default_version() -> u32 {
    TASK_MESSAGE_VERSION
}

/// Wire envelope for tasks and results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    /// Envelope format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Identifier unique within a task chain
    #[serde(default)]
    pub task_id: String,

    /// Identifies the type of `task_data`
    pub task_classifier: String,

    /// Version of the `task_data` format
    pub task_api_version: u32,

    /// Task specific payload
    #[serde(default, with = "base64_bytes")]
    pub task_data: Vec<u8>,

    pub task_status: TaskStatus,

    /// Worker specific side-channel data
    #[serde(default, with = "base64_map")]
    pub context: HashMap<String, Vec<u8>>,

    /// Destination queue
    #[serde(default)]
    pub to: Option<String>,

    #[serde(default)]
    pub tracking: Option<TrackingInfo>,

    #[serde(default)]
    pub source_info: Option<SourceInfo>,

    #[serde(default)]
    pub priority: Option<u32>,

    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl TaskMessage {
    /// Create a new message with an empty context and no routing
    pub fn new(
        task_id: impl Into<String>,
        task_classifier: impl Into<String>,
        task_api_version: u32,
        task_data: impl Into<Vec<u8>>,
        task_status: TaskStatus,
    ) -> Self {
        Self {
            version: TASK_MESSAGE_VERSION,
            task_id: task_id.into(),
            task_classifier: task_classifier.into(),
            task_api_version,
            task_data: task_data.into(),
            task_status,
            context: HashMap::new(),
            to: None,
            tracking: None,
            source_info: None,
            priority: None,
            correlation_id: None,
        }
    }

    /// Set the destination queue
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Set the tracking info
    pub fn with_tracking(mut self, tracking: TrackingInfo) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set the source info
    pub fn with_source_info(mut self, source_info: SourceInfo) -> Self {
        self.source_info = Some(source_info);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Remove tracking info if publishing to `queue` ends tracking
    ///
    /// Returns true when the tracking info was removed.
    pub fn strip_tracking_for(&mut self, queue: Option<&str>) -> bool {
        if self
            .tracking
            .as_ref()
            .is_some_and(|tracking| tracking.ends_at(queue))
        {
            self.tracking = None;
            return true;
        }
        false
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_map {
    use std::collections::HashMap;

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(map: &HashMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &STANDARD.encode(value))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default();
        encoded
            .into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value.as_bytes())
                    .map(|bytes| (key, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
