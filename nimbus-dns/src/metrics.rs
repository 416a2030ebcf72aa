//! Global counters for the periodic stats report

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the ingress loop and the workers
#[derive(Debug, Default)]
pub struct Metrics {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    malformed: AtomicU64,
    queue_dropped: AtomicU64,
    upstream_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_drop(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter values without resetting them
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }

    /// Read and zero the counters; used by the interval stats reporter
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries: self.queries.swap(0, Ordering::Relaxed),
            cache_hits: self.cache_hits.swap(0, Ordering::Relaxed),
            cache_misses: self.cache_misses.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            queue_dropped: self.queue_dropped.swap(0, Ordering::Relaxed),
            upstream_failures: self.upstream_failures.swap(0, Ordering::Relaxed),
        }
    }
}

/// Counter values at a point in time
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub malformed: u64,
    pub queue_dropped: u64,
    pub upstream_failures: u64,
}

impl MetricsSnapshot {
    /// Cache hit rate as a percentage, 0 when nothing was answered
    pub fn hit_rate(&self) -> f64 {
        let answered = self.cache_hits + self.cache_misses;
        if answered == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / answered as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_query();
        metrics.record_query();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_queue_drop();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.queue_dropped, 1);
        assert_eq!(snapshot.malformed, 0);
    }

    #[test]
    fn test_snapshot_and_reset_zeroes() {
        let metrics = Metrics::new();
        metrics.record_query();
        metrics.record_malformed();

        let first = metrics.snapshot_and_reset();
        assert_eq!(first.queries, 1);
        assert_eq!(first.malformed, 1);

        let second = metrics.snapshot();
        assert_eq!(second.queries, 0);
        assert_eq!(second.malformed, 0);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().hit_rate(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert!((metrics.snapshot().hit_rate() - 75.0).abs() < 1e-9);
    }
}
