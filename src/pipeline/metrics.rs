//! Per-stage throughput counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters maintained by a running stage. Shared with the coordinator
/// through an `Arc`, updated with relaxed atomics since nothing orders
/// on them.
#[derive(Debug, Default)]
pub struct StageMetrics {
    /// Records fetched from the upstream source
    pub records_in: AtomicU64,

    /// Records written to the stage's output
    pub records_out: AtomicU64,

    /// Records diverted to the sideline on schema violations
    pub sidelined: AtomicU64,

    /// Records dropped by filter rules
    pub dropped: AtomicU64,

    /// Micro-batches committed (checkpoint advanced)
    pub batches: AtomicU64,
}

impl StageMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_records_in(&self, count: u64) {
        self.records_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_records_out(&self, count: u64) {
        self.records_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_sidelined(&self, count: u64) {
        self.sidelined.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
            sidelined: self.sidelined.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one stage's counters at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub sidelined: u64,
    pub dropped: u64,
    pub batches: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "in: {} | out: {} | sidelined: {} | dropped: {} | batches: {}",
            self.records_in, self.records_out, self.sidelined, self.dropped, self.batches
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = StageMetrics::new();

        metrics.add_records_in(10);
        metrics.add_records_in(5);
        metrics.add_records_out(12);
        metrics.add_sidelined(2);
        metrics.add_dropped(1);
        metrics.add_batch();
        metrics.add_batch();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_in, 15);
        assert_eq!(snapshot.records_out, 12);
        assert_eq!(snapshot.sidelined, 2);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.batches, 2);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = StageMetrics::new();
        metrics.add_records_in(3);

        let display = format!("{}", metrics.snapshot());
        assert!(display.contains("in: 3"));
        assert!(display.contains("batches: 0"));
    }
}
