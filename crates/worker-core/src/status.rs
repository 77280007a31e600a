//! Job status checks
//!
//! Tasks of tracked jobs carry a status check URL. Before executing such a
//! task the dispatcher asks a [`JobStatusProber`] whether the job is still
//! active. Only a positive "not found" stops the task; every other probe
//! fault is treated as an active job.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::CACHE_CONTROL;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use taskmill_api::TrackingInfo;
use tracing::{debug, instrument, warn};

use crate::config::DEFAULT_STATUS_CHECK_INTERVAL_MILLIS;

/// Cache size at which an insert first evicts every expired entry
const DEFAULT_CACHE_SWEEP_THRESHOLD: usize = 256;

/// Status of a tracked job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Active,
    Cancelled,
    Completed,
    Failed,
    Paused,
    Waiting,
}

impl FromStr for JobStatus {
    type Err = JobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "waiting" => Ok(Self::Waiting),
            other => Err(JobStatusError::Check(format!("unknown job status {other:?}"))),
        }
    }
}

/// Result of a status probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatusResponse {
    pub status: JobStatus,
    /// Recommended wait before the next check
    pub status_check_interval_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStatusError {
    /// The status service does not know the job
    #[error("job not found")]
    NotFound,

    #[error("job status check failed: {0}")]
    Check(String),
}

/// Looks up the status of a job
#[async_trait]
pub trait JobStatusProber: Send + Sync {
    async fn check_status(&self, status_check_url: &str)
        -> Result<JobStatusResponse, JobStatusError>;
}

struct CachedStatus {
    response: JobStatusResponse,
    expires_at: Instant,
}

/// Probes job status over HTTP
///
/// `GET <url>` answers with the status name as plain text or a JSON string.
/// `404` means the job no longer exists. `Cache-Control: max-age` sets both
/// the next check interval and how long the answer is cached in memory.
pub struct HttpJobStatusProber {
    client: reqwest::Client,
    default_interval_millis: u64,
    cache: DashMap<String, CachedStatus>,
    sweep_threshold: usize,
}

impl HttpJobStatusProber {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            default_interval_millis: DEFAULT_STATUS_CHECK_INTERVAL_MILLIS,
            cache: DashMap::new(),
            sweep_threshold: DEFAULT_CACHE_SWEEP_THRESHOLD,
        }
    }

    /// Set the interval used when the response has no usable max-age
    pub fn with_default_interval_millis(mut self, millis: u64) -> Self {
        self.default_interval_millis = millis;
        self
    }

    /// Set the cache size at which inserts evict expired entries
    pub fn with_cache_sweep_threshold(mut self, entries: usize) -> Self {
        self.sweep_threshold = entries;
        self
    }

    /// Number of cached responses, including expired ones not yet evicted
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, url: &str) -> Option<JobStatusResponse> {
        let now = Instant::now();
        let hit = self
            .cache
            .get(url)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.response);
        if hit.is_none() {
            self.cache.remove_if(url, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    /// Cache a response, evicting expired entries once the cache is large
    ///
    /// Status check URLs are usually per job and rarely looked up again
    /// after they expire, so lookups alone never shrink the cache.
    fn store(&self, url: &str, response: JobStatusResponse, ttl: Duration) {
        let now = Instant::now();
        if self.cache.len() >= self.sweep_threshold {
            let before = self.cache.len();
            self.cache.retain(|_, entry| entry.expires_at > now);
            debug!(
                evicted = before.saturating_sub(self.cache.len()),
                "Evicted expired job status entries"
            );
        }
        self.cache.insert(
            url.to_string(),
            CachedStatus {
                response,
                expires_at: now + ttl,
            },
        );
    }
}

impl Default for HttpJobStatusProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract `max-age` seconds from a Cache-Control header value
fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().trim_matches('"').parse().ok()
        } else {
            None
        }
    })
}

#[async_trait]
impl JobStatusProber for HttpJobStatusProber {
    #[instrument(skip(self))]
    async fn check_status(
        &self,
        status_check_url: &str,
    ) -> Result<JobStatusResponse, JobStatusError> {
        if let Some(response) = self.cached(status_check_url) {
            debug!(status = ?response.status, "Using cached job status");
            return Ok(response);
        }

        let response = self
            .client
            .get(status_check_url)
            .send()
            .await
            .map_err(|e| JobStatusError::Check(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(JobStatusError::NotFound);
        }
        if !response.status().is_success() {
            return Err(JobStatusError::Check(format!(
                "status service returned {}",
                response.status()
            )));
        }

        let max_age = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age);

        let body = response
            .text()
            .await
            .map_err(|e| JobStatusError::Check(e.to_string()))?;
        let status: JobStatus = body.trim().trim_matches('"').parse()?;

        let result = JobStatusResponse {
            status,
            status_check_interval_millis: max_age
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(self.default_interval_millis),
        };

        if let Some(secs) = max_age.filter(|secs| *secs > 0) {
            self.store(status_check_url, result, Duration::from_secs(secs));
        }

        Ok(result)
    }
}

/// What the dispatcher should assume about a task's job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusOutcome {
    Status(JobStatus),
    JobNotFound,
}

/// Check the job of a tracked task if a check is due, updating the tracking
/// info with the time of the check and the next interval
pub async fn check_job_status(
    prober: Option<&dyn JobStatusProber>,
    tracking: &mut TrackingInfo,
) -> JobStatusOutcome {
    let Some(url) = tracking.status_check_url.clone() else {
        return JobStatusOutcome::Status(JobStatus::Active);
    };
    let now = Utc::now();
    if !tracking.is_status_check_due(now) {
        return JobStatusOutcome::Status(JobStatus::Active);
    }
    let Some(prober) = prober else {
        debug!(job_task_id = %tracking.job_task_id, "No job status prober configured");
        return JobStatusOutcome::Status(JobStatus::Active);
    };

    match prober.check_status(&url).await {
        Ok(response) => {
            tracking.record_status_check(now, response.status_check_interval_millis);
            JobStatusOutcome::Status(response.status)
        }
        Err(JobStatusError::NotFound) => JobStatusOutcome::JobNotFound,
        Err(e) => {
            warn!(
                job_task_id = %tracking.job_task_id,
                url = %url,
                error = %e,
                "Job status check failed, assuming the job is active"
            );
            JobStatusOutcome::Status(JobStatus::Active)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedProber(Result<JobStatusResponse, JobStatusError>);

    #[async_trait]
    impl JobStatusProber for FixedProber {
        async fn check_status(&self, _: &str) -> Result<JobStatusResponse, JobStatusError> {
            self.0.clone()
        }
    }

    #[test]
    fn test_parse_job_status() {
        assert_eq!("Active".parse::<JobStatus>().unwrap(), JobStatus::Active);
        assert_eq!(" PAUSED ".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!("Running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age("max-age=30"), Some(30));
        assert_eq!(parse_max_age("no-transform, max-age=5, private"), Some(5));
        assert_eq!(parse_max_age("no-cache"), None);
        assert_eq!(parse_max_age("max-age=soon"), None);
    }

    #[tokio::test]
    async fn test_http_probe_active_with_max_age() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/j1/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Cache-Control", "max-age=30")
                    .set_body_string("\"Active\""),
            )
            .expect(1)
            .mount(&server)
            .await;

        let prober = HttpJobStatusProber::new();
        let url = format!("{}/jobs/j1/status", server.uri());

        let response = prober.check_status(&url).await.unwrap();
        assert_eq!(response.status, JobStatus::Active);
        assert_eq!(response.status_check_interval_millis, 30_000);

        // Served from the cache; the mock expects a single request
        let cached = prober.check_status(&url).await.unwrap();
        assert_eq!(cached, response);
        assert_eq!(prober.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted_on_insert() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Cache-Control", "max-age=30")
                    .set_body_string("Active"),
            )
            .mount(&server)
            .await;

        let prober = HttpJobStatusProber::new().with_cache_sweep_threshold(2);
        let stale = JobStatusResponse {
            status: JobStatus::Active,
            status_check_interval_millis: 1_000,
        };
        prober.store("http://status/jobs/a", stale, Duration::ZERO);
        prober.store("http://status/jobs/b", stale, Duration::ZERO);
        assert_eq!(prober.cached_entries(), 2);

        prober
            .check_status(&format!("{}/jobs/c/status", server.uri()))
            .await
            .unwrap();

        assert_eq!(prober.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_http_probe_default_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Paused"))
            .mount(&server)
            .await;

        let prober = HttpJobStatusProber::new();
        let response = prober.check_status(&server.uri()).await.unwrap();

        assert_eq!(response.status, JobStatus::Paused);
        assert_eq!(response.status_check_interval_millis, 120_000);
        assert_eq!(prober.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_http_probe_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let prober = HttpJobStatusProber::new();
        assert_eq!(
            prober.check_status(&server.uri()).await,
            Err(JobStatusError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_http_probe_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let prober = HttpJobStatusProber::new();
        assert!(matches!(
            prober.check_status(&server.uri()).await,
            Err(JobStatusError::Check(_))
        ));
    }

    #[tokio::test]
    async fn test_check_without_url_is_active() {
        let mut tracking = TrackingInfo::new("job1");
        let prober = FixedProber(Err(JobStatusError::NotFound));

        let outcome = check_job_status(Some(&prober), &mut tracking).await;
        assert_eq!(outcome, JobStatusOutcome::Status(JobStatus::Active));
        assert!(tracking.last_status_check_time.is_none());
    }

    #[tokio::test]
    async fn test_check_records_interval() {
        let mut tracking = TrackingInfo::new("job1").with_status_check_url("http://status/j1");
        let prober = FixedProber(Ok(JobStatusResponse {
            status: JobStatus::Waiting,
            status_check_interval_millis: 5_000,
        }));

        let outcome = check_job_status(Some(&prober), &mut tracking).await;
        assert_eq!(outcome, JobStatusOutcome::Status(JobStatus::Waiting));
        assert!(tracking.last_status_check_time.is_some());
        assert_eq!(tracking.status_check_interval_millis, 5_000);

        // Not due again yet
        let failing = FixedProber(Err(JobStatusError::NotFound));
        let outcome = check_job_status(Some(&failing), &mut tracking).await;
        assert_eq!(outcome, JobStatusOutcome::Status(JobStatus::Active));
    }

    #[tokio::test]
    async fn test_check_not_found() {
        let mut tracking = TrackingInfo::new("job1").with_status_check_url("http://status/j1");
        let prober = FixedProber(Err(JobStatusError::NotFound));

        let outcome = check_job_status(Some(&prober), &mut tracking).await;
        assert_eq!(outcome, JobStatusOutcome::JobNotFound);
    }

    #[tokio::test]
    async fn test_check_fault_assumes_active() {
        let mut tracking = TrackingInfo::new("job1").with_status_check_url("http://status/j1");
        let prober = FixedProber(Err(JobStatusError::Check("connection refused".into())));

        let outcome = check_job_status(Some(&prober), &mut tracking).await;
        assert_eq!(outcome, JobStatusOutcome::Status(JobStatus::Active));
        assert!(tracking.last_status_check_time.is_none());
    }
}
