//! Lock-free cycle counters
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not drive any decision in the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Process-lifetime counters for the poll loop
#[derive(Debug, Default)]
pub struct CycleMetrics {
    cycles: AtomicU64,
    records_seen: AtomicU64,
    records_rejected: AtomicU64,
    entities_published: AtomicU64,
    discovery_published: AtomicU64,
    publish_failures: AtomicU64,
    snapshots_unparsable: AtomicU64,
}

impl CycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_seen(&self) {
        self.records_seen.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.records_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_published(&self) {
        self.entities_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discovery(&self) {
        self.discovery_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_unparsable(&self) {
        self.snapshots_unparsable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            records_seen: self.records_seen.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            entities_published: self.entities_published.load(Ordering::Relaxed),
            discovery_published: self.discovery_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            snapshots_unparsable: self.snapshots_unparsable.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CycleMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub records_seen: u64,
    pub records_rejected: u64,
    pub entities_published: u64,
    pub discovery_published: u64,
    pub publish_failures: u64,
    pub snapshots_unparsable: u64,
}

impl MetricsSnapshot {
    pub fn log(&self) {
        info!(
            cycles = %self.cycles,
            records_seen = %self.records_seen,
            records_rejected = %self.records_rejected,
            entities_published = %self.entities_published,
            discovery_published = %self.discovery_published,
            publish_failures = %self.publish_failures,
            snapshots_unparsable = %self.snapshots_unparsable,
            "metrics_totals"
        );
    }
}
