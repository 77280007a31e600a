//! Job tracking reports
//!
//! Responses of tracked tasks produce [`TrackingReport`]s. A task buffers its
//! reports and publishes them in batches, one [`TrackingReportTask`] envelope
//! per tracking pipe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use taskmill_api::{TaskMessage, TaskStatus};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::callback::WorkerCallback;

/// Classifier of batched tracking report envelopes
pub const TRACKING_REPORT_CLASSIFIER: &str = "TrackingReportTask";

/// Api version of [`TrackingReportTask`]
pub const TRACKING_REPORT_API_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingReportStatus {
    Progress,
    Complete,
    Failed,
    Retry,
}

/// Why a tracked task failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingReportFailure {
    pub failure_id: String,
    pub failure_time: DateTime<Utc>,
    pub failure_source: String,
    pub failure_message: String,
}

/// Progress of one job task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingReport {
    pub job_task_id: String,
    pub status: TrackingReportStatus,
    pub estimated_percentage_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TrackingReportFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl TrackingReport {
    pub fn progress(job_task_id: impl Into<String>, percentage: u32) -> Self {
        Self {
            job_task_id: job_task_id.into(),
            status: TrackingReportStatus::Progress,
            estimated_percentage_completed: percentage.min(100),
            failure: None,
            retries: None,
        }
    }

    pub fn complete(job_task_id: impl Into<String>) -> Self {
        Self {
            job_task_id: job_task_id.into(),
            status: TrackingReportStatus::Complete,
            estimated_percentage_completed: 100,
            failure: None,
            retries: None,
        }
    }

    pub fn failed(job_task_id: impl Into<String>, failure: TrackingReportFailure) -> Self {
        Self {
            job_task_id: job_task_id.into(),
            status: TrackingReportStatus::Failed,
            estimated_percentage_completed: 0,
            failure: Some(failure),
            retries: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Payload of a tracking report envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingReportTask {
    pub tracking_reports: Vec<TrackingReport>,
}

/// Inputs for deciding which report an outgoing message produces
pub struct ReportContext<'a> {
    /// Name of the worker publishing the message
    pub source: &'a str,
    pub zero_progress_reporting: bool,
    /// Text of the rejected-marker header for poison messages
    pub poison_reason: Option<&'a str>,
    pub retries: Option<u32>,
}

/// The report an outgoing message produces, with the pipe it goes to
///
/// `message` is the envelope about to be published, before its tracking
/// info is stripped. Messages leaving tracking report completion or
/// failure; other messages report 0% progress when zero progress
/// reporting is on.
pub fn report_for_message(
    message: &TaskMessage,
    ctx: &ReportContext<'_>,
) -> Option<(String, TrackingReport)> {
    let tracking = message.tracking.as_ref()?;
    let pipe = tracking.tracking_pipe.as_deref().filter(|p| !p.is_empty())?;
    let job_task_id = tracking.job_task_id.as_str();

    if let Some(reason) = ctx.poison_reason {
        let report = TrackingReport::failed(job_task_id, failure(ctx.source, reason));
        return Some((pipe.to_string(), with_retries(report, ctx.retries)));
    }

    let report = if tracking.ends_at(message.to.as_deref()) {
        if message.task_status.is_successful_response() {
            TrackingReport::complete(job_task_id)
        } else {
            let reason = format!("task finished with status {}", message.task_status);
            TrackingReport::failed(job_task_id, failure(ctx.source, &reason))
        }
    } else if ctx.zero_progress_reporting
        && matches!(
            message.task_status,
            TaskStatus::NewTask | TaskStatus::ResultSuccess | TaskStatus::ResultFailure
        )
    {
        TrackingReport::progress(job_task_id, 0)
    } else {
        return None;
    };

    Some((pipe.to_string(), with_retries(report, ctx.retries)))
}

fn with_retries(report: TrackingReport, retries: Option<u32>) -> TrackingReport {
    match retries {
        Some(retries) => report.with_retries(retries),
        None => report,
    }
}

fn failure(source: &str, message: &str) -> TrackingReportFailure {
    TrackingReportFailure {
        failure_id: Uuid::now_v7().to_string(),
        failure_time: Utc::now(),
        failure_source: source.to_string(),
        failure_message: message.to_string(),
    }
}

/// Reports waiting to be published, grouped by tracking pipe on flush
pub struct ProgressReportBuffer {
    limit: usize,
    reports: Mutex<Vec<(String, TrackingReport)>>,
}

impl ProgressReportBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Queue a report; returns true when the buffer reached its limit
    pub fn push(&self, pipe: String, report: TrackingReport) -> bool {
        let mut reports = self.reports.lock();
        reports.push((pipe, report));
        reports.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Queue a report and publish the batch if the limit was reached
    pub async fn add(&self, pipe: String, report: TrackingReport, callback: &dyn WorkerCallback) {
        if self.push(pipe, report) {
            self.flush(callback).await;
        }
    }

    /// Publish everything buffered, one envelope per pipe
    pub async fn flush(&self, callback: &dyn WorkerCallback) {
        let reports = std::mem::take(&mut *self.reports.lock());
        if reports.is_empty() {
            return;
        }

        let mut by_pipe: BTreeMap<String, Vec<TrackingReport>> = BTreeMap::new();
        for (pipe, report) in reports {
            by_pipe.entry(pipe).or_default().push(report);
        }

        for (pipe, tracking_reports) in by_pipe {
            debug!(pipe = %pipe, count = tracking_reports.len(), "Flushing tracking reports");
            match report_envelope(&pipe, TrackingReportTask { tracking_reports }) {
                Ok(message) => callback.report_update(&pipe, message).await,
                Err(e) => warn!(pipe = %pipe, error = %e, "Failed to build tracking report"),
            }
        }
    }
}

fn report_envelope(pipe: &str, task: TrackingReportTask) -> Result<TaskMessage, serde_json::Error> {
    let data = serde_json::to_vec(&task)?;
    Ok(TaskMessage::new(
        Uuid::now_v7().to_string(),
        TRACKING_REPORT_CLASSIFIER,
        TRACKING_REPORT_API_VERSION,
        data,
        TaskStatus::NewTask,
    )
    .with_to(pipe))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use taskmill_api::{Headers, TaskInformation, TrackingInfo};

    use super::*;
    use crate::error::CallbackError;

    #[derive(Default)]
    struct RecordingCallback {
        updates: Mutex<Vec<(String, TaskMessage)>>,
    }

    #[async_trait]
    impl WorkerCallback for RecordingCallback {
        async fn send(&self, _: &Arc<TaskInformation>, _: TaskMessage) -> Result<(), CallbackError> {
            Ok(())
        }
        async fn complete(&self, _: &Arc<TaskInformation>, _: Option<&str>, _: TaskMessage) {}
        async fn abandon(&self, _: &Arc<TaskInformation>, _: &str) {}
        async fn forward(&self, _: &Arc<TaskInformation>, _: Option<&str>, _: TaskMessage, _: &Headers) {}
        async fn pause(&self, _: &Arc<TaskInformation>, _: &str, _: TaskMessage, _: &Headers) {}
        async fn discard(&self, _: &Arc<TaskInformation>) {}
        async fn report_update(&self, pipe: &str, message: TaskMessage) {
            self.updates.lock().push((pipe.to_string(), message));
        }
    }

    fn ctx(zero_progress_reporting: bool) -> ReportContext<'static> {
        ReportContext {
            source: "echo",
            zero_progress_reporting,
            poison_reason: None,
            retries: None,
        }
    }

    fn tracked(status: TaskStatus, to: &str) -> TaskMessage {
        TaskMessage::new("t1", "echo", 1, Vec::new(), status)
            .with_to(to)
            .with_tracking(
                TrackingInfo::new("job1.2")
                    .with_tracking_pipe("tracking")
                    .with_track_to("done"),
            )
    }

    #[test]
    fn test_complete_when_leaving_tracking() {
        let message = tracked(TaskStatus::ResultSuccess, "done");
        let (pipe, report) = report_for_message(&message, &ctx(false)).unwrap();
        assert_eq!(pipe, "tracking");
        assert_eq!(report.status, TrackingReportStatus::Complete);
        assert_eq!(report.job_task_id, "job1.2");
        assert_eq!(report.estimated_percentage_completed, 100);
    }

    #[test]
    fn test_failed_when_leaving_tracking_with_failure() {
        let message = tracked(TaskStatus::ResultException, "done");
        let (_, report) = report_for_message(&message, &ctx(false)).unwrap();
        assert_eq!(report.status, TrackingReportStatus::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.failure_source, "echo");
        assert!(failure.failure_message.contains("RESULT_EXCEPTION"));
    }

    #[test]
    fn test_zero_progress_only_when_enabled() {
        let message = tracked(TaskStatus::ResultSuccess, "next");
        assert!(report_for_message(&message, &ctx(false)).is_none());

        let (_, report) = report_for_message(&message, &ctx(true)).unwrap();
        assert_eq!(report.status, TrackingReportStatus::Progress);
        assert_eq!(report.estimated_percentage_completed, 0);

        let invalid = tracked(TaskStatus::InvalidTask, "next");
        assert!(report_for_message(&invalid, &ctx(true)).is_none());
    }

    #[test]
    fn test_poison_report_carries_reason() {
        let message = tracked(TaskStatus::ResultException, "rejects");
        let ctx = ReportContext {
            poison_reason: Some("retry limit exceeded"),
            retries: Some(3),
            ..ctx(false)
        };
        let (_, report) = report_for_message(&message, &ctx).unwrap();
        assert_eq!(report.status, TrackingReportStatus::Failed);
        assert_eq!(report.retries, Some(3));
        assert_eq!(report.failure.unwrap().failure_message, "retry limit exceeded");
    }

    #[test]
    fn test_no_report_without_pipe() {
        let message = TaskMessage::new("t1", "echo", 1, Vec::new(), TaskStatus::ResultSuccess)
            .with_to("done")
            .with_tracking(TrackingInfo::new("job1").with_track_to("done"));
        assert!(report_for_message(&message, &ctx(true)).is_none());
    }

    #[tokio::test]
    async fn test_buffer_flushes_at_limit() {
        let buffer = ProgressReportBuffer::new(2);
        let callback = RecordingCallback::default();

        buffer
            .add("tracking".into(), TrackingReport::progress("job1.1", 0), &callback)
            .await;
        assert!(callback.updates.lock().is_empty());

        buffer
            .add("tracking".into(), TrackingReport::progress("job1.2", 0), &callback)
            .await;
        assert!(buffer.is_empty());

        let updates = callback.updates.lock();
        assert_eq!(updates.len(), 1);
        let (pipe, message) = &updates[0];
        assert_eq!(pipe, "tracking");
        assert_eq!(message.task_classifier, TRACKING_REPORT_CLASSIFIER);
        assert_eq!(message.to.as_deref(), Some("tracking"));

        let payload: TrackingReportTask = serde_json::from_slice(&message.task_data).unwrap();
        assert_eq!(payload.tracking_reports.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_groups_by_pipe() {
        let buffer = ProgressReportBuffer::new(10);
        let callback = RecordingCallback::default();

        buffer.push("a".into(), TrackingReport::complete("job1"));
        buffer.push("b".into(), TrackingReport::complete("job2"));
        buffer.push("a".into(), TrackingReport::complete("job3"));
        buffer.flush(&callback).await;

        let updates = callback.updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].0, "a");
        let payload: TrackingReportTask = serde_json::from_slice(&updates[0].1.task_data).unwrap();
        assert_eq!(payload.tracking_reports.len(), 2);
        assert_eq!(updates[1].0, "b");
    }
}
