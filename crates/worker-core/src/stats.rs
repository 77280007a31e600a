//! Worker statistics
//!
//! Lock-free counters updated by the dispatcher and completion callback.
//! Exporters read them through [`WorkerStats::snapshot`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const SIZE_BUCKETS: usize = 32;

/// Distribution of payload sizes in power-of-two buckets
///
/// Bucket `i` counts sizes in `[2^(i-1), 2^i)`; bucket 0 counts empty
/// payloads and the last bucket absorbs everything larger.
pub struct SizeHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    buckets: [AtomicU64; SIZE_BUCKETS],
}

impl SizeHistogram {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one payload size in bytes
    pub fn record(&self, size: usize) {
        let size = size as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(size, Ordering::Relaxed);
        self.min.fetch_min(size, Ordering::Relaxed);
        self.max.fetch_max(size, Ordering::Relaxed);
        self.buckets[Self::bucket_index(size)].fetch_add(1, Ordering::Relaxed);
    }

    fn bucket_index(size: u64) -> usize {
        let bits = (u64::BITS - size.leading_zeros()) as usize;
        bits.min(SIZE_BUCKETS - 1)
    }

    pub fn snapshot(&self) -> SizeHistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        SizeHistogramSnapshot {
            count,
            sum: self.sum.load(Ordering::Relaxed),
            min: (count > 0).then(|| self.min.load(Ordering::Relaxed)),
            max: (count > 0).then(|| self.max.load(Ordering::Relaxed)),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

impl Default for SizeHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeHistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub buckets: Vec<u64>,
}

/// Counters for one running dispatch core
#[derive(Default)]
pub struct WorkerStats {
    tasks_received: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_aborted: AtomicU64,
    tasks_forwarded: AtomicU64,
    tasks_paused: AtomicU64,
    tasks_discarded: AtomicU64,
    /// Poison messages refused before reaching a worker
    poison_faults: AtomicU64,
    /// Milliseconds since the epoch, 0 when no task has finished
    last_task_finished_millis: AtomicI64,
    input_sizes: SizeHistogram,
    output_sizes: SizeHistogram,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_tasks_received(&self) {
        self.tasks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tasks_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tasks_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tasks_aborted(&self, count: u64) {
        self.tasks_aborted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_tasks_forwarded(&self) {
        self.tasks_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tasks_paused(&self) {
        self.tasks_paused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tasks_discarded(&self) {
        self.tasks_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_poison_faults(&self) {
        self.poison_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_finished(&self, at: DateTime<Utc>) {
        self.last_task_finished_millis
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_input_size(&self, size: usize) {
        self.input_sizes.record(size);
    }

    pub fn record_output_size(&self, size: usize) {
        self.output_sizes.record(size);
    }

    pub fn tasks_received(&self) -> u64 {
        self.tasks_received.load(Ordering::Relaxed)
    }

    pub fn tasks_rejected(&self) -> u64 {
        self.tasks_rejected.load(Ordering::Relaxed)
    }

    pub fn tasks_succeeded(&self) -> u64 {
        self.tasks_succeeded.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    pub fn tasks_aborted(&self) -> u64 {
        self.tasks_aborted.load(Ordering::Relaxed)
    }

    pub fn tasks_forwarded(&self) -> u64 {
        self.tasks_forwarded.load(Ordering::Relaxed)
    }

    pub fn tasks_paused(&self) -> u64 {
        self.tasks_paused.load(Ordering::Relaxed)
    }

    pub fn tasks_discarded(&self) -> u64 {
        self.tasks_discarded.load(Ordering::Relaxed)
    }

    pub fn poison_faults(&self) -> u64 {
        self.poison_faults.load(Ordering::Relaxed)
    }

    pub fn last_task_finished(&self) -> Option<DateTime<Utc>> {
        match self.last_task_finished_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            tasks_received: self.tasks_received(),
            tasks_rejected: self.tasks_rejected(),
            tasks_succeeded: self.tasks_succeeded(),
            tasks_failed: self.tasks_failed(),
            tasks_aborted: self.tasks_aborted(),
            tasks_forwarded: self.tasks_forwarded(),
            tasks_paused: self.tasks_paused(),
            tasks_discarded: self.tasks_discarded(),
            poison_faults: self.poison_faults(),
            last_task_finished: self.last_task_finished(),
            input_sizes: self.input_sizes.snapshot(),
            output_sizes: self.output_sizes.snapshot(),
        }
    }
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub tasks_received: u64,
    pub tasks_rejected: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_aborted: u64,
    pub tasks_forwarded: u64,
    pub tasks_paused: u64,
    pub tasks_discarded: u64,
    pub poison_faults: u64,
    pub last_task_finished: Option<DateTime<Utc>>,
    pub input_sizes: SizeHistogramSnapshot,
    pub output_sizes: SizeHistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let histogram = SizeHistogram::new();
        histogram.record(0);
        histogram.record(1);
        histogram.record(3);
        histogram.record(1024);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.sum, 1028);
        assert_eq!(snapshot.min, Some(0));
        assert_eq!(snapshot.max, Some(1024));
        assert_eq!(snapshot.buckets[0], 1);
        assert_eq!(snapshot.buckets[1], 1);
        assert_eq!(snapshot.buckets[2], 1);
        assert_eq!(snapshot.buckets[11], 1);
    }

    #[test]
    fn test_histogram_huge_values_use_last_bucket() {
        let histogram = SizeHistogram::new();
        histogram.record(usize::MAX);
        assert_eq!(histogram.snapshot().buckets[SIZE_BUCKETS - 1], 1);
    }

    #[test]
    fn test_empty_histogram() {
        let snapshot = SizeHistogram::new().snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.min, None);
        assert_eq!(snapshot.max, None);
    }

    #[test]
    fn test_counters() {
        let stats = WorkerStats::new();
        stats.increment_tasks_received();
        stats.increment_tasks_received();
        stats.increment_tasks_succeeded();
        stats.add_tasks_aborted(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tasks_received, 2);
        assert_eq!(snapshot.tasks_succeeded, 1);
        assert_eq!(snapshot.tasks_aborted, 3);
        assert_eq!(snapshot.last_task_finished, None);
    }

    #[test]
    fn test_last_task_finished() {
        let stats = WorkerStats::new();
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        stats.record_task_finished(now);
        assert_eq!(stats.last_task_finished(), Some(now));
    }
}
