//! Upstream DoH endpoint pool with health tracking
//!
//! Endpoints are selected round-robin in configured order. An endpoint that
//! fails repeatedly is taken out of rotation and silently re-admitted once
//! its recovery interval has elapsed; a single success restores it fully.
//! When every endpoint is down, selection falls back to the one that failed
//! longest ago rather than refusing to answer.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Consecutive failures before an endpoint is taken out of rotation
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How long an endpoint stays out of rotation after its last failure
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Smoothing factor for the response-time moving average
const RESPONSE_TIME_EWMA_ALPHA: f64 = 0.2;

/// A single DoH endpoint with its health state
#[derive(Debug)]
pub struct UpstreamEndpoint {
    url: String,
    /// Original hostname when bootstrap replaced the URL host with an IP
    host_override: Option<String>,
    healthy: bool,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    avg_response_ms: f64,
}

impl UpstreamEndpoint {
    /// Create a new endpoint, initially healthy
    pub fn new(url: String, host_override: Option<String>) -> Self {
        Self {
            url,
            host_override,
            healthy: true,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            last_failure_at: None,
            avg_response_ms: 0.0,
        }
    }

    /// The endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// An endpoint is available when healthy, or when its recovery interval
    /// has elapsed since the last failure.
    fn is_available(&self, now: Instant, recovery_interval: Duration) -> bool {
        self.healthy
            || self
                .last_failure_at
                .map(|at| now.duration_since(at) >= recovery_interval)
                .unwrap_or(true)
    }
}

/// A selected endpoint, detached from the manager so no lock is held
/// while the request is in flight
#[derive(Debug, Clone)]
pub struct SelectedUpstream {
    /// Index for reporting the outcome back to the manager
    pub index: usize,
    /// The endpoint URL
    pub url: String,
    /// Host header override, when bootstrap rewrote the URL
    pub host_override: Option<String>,
}

/// Per-endpoint summary for the periodic stats report
#[derive(Debug, Clone)]
pub struct UpstreamStats {
    pub url: String,
    pub healthy: bool,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_ms: f64,
}

/// Pool of upstream endpoints with round-robin selection
pub struct UpstreamManager {
    endpoints: Vec<UpstreamEndpoint>,
    next: usize,
    failure_threshold: u32,
    recovery_interval: Duration,
}

impl UpstreamManager {
    /// Create a manager with the default failure threshold and recovery interval
    pub fn new(endpoints: Vec<UpstreamEndpoint>) -> Result<Self> {
        Self::with_limits(
            endpoints,
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_RECOVERY_INTERVAL,
        )
    }

    /// Create a manager with explicit health thresholds
    pub fn with_limits(
        endpoints: Vec<UpstreamEndpoint>,
        failure_threshold: u32,
        recovery_interval: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("no upstream DoH endpoints configured".into()));
        }

        log::info!(
            "upstream pool: {}",
            endpoints
                .iter()
                .map(|e| e.url.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            endpoints,
            next: 0,
            failure_threshold,
            recovery_interval,
        })
    }

    /// Number of configured endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Check if the pool is empty (never true for a constructed manager)
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Select the next available endpoint
    ///
    /// The round-robin index advances exactly once per call; the availability
    /// filter is applied after indexing, probing forward until every endpoint
    /// has been visited. When all endpoints are unavailable, the one whose
    /// last failure is oldest is returned as a best-effort fallback. `None`
    /// is only possible for an empty pool.
    pub fn select(&mut self) -> Option<SelectedUpstream> {
        if self.endpoints.is_empty() {
            return None;
        }

        let now = Instant::now();
        let len = self.endpoints.len();
        let start = self.next % len;
        self.next = self.next.wrapping_add(1);

        for offset in 0..len {
            let index = (start + offset) % len;
            if self.endpoints[index].is_available(now, self.recovery_interval) {
                return Some(self.handle(index));
            }
        }

        let index = self
            .endpoints
            .iter()
            .enumerate()
            .min_by_key(|(_, endpoint)| endpoint.last_failure_at)
            .map(|(index, _)| index)?;
        log::warn!(
            "all upstreams down, falling back to {}",
            self.endpoints[index].url
        );
        Some(self.handle(index))
    }

    fn handle(&self, index: usize) -> SelectedUpstream {
        let endpoint = &self.endpoints[index];
        SelectedUpstream {
            index,
            url: endpoint.url.clone(),
            host_override: endpoint.host_override.clone(),
        }
    }

    /// Record a successful exchange with the endpoint at `index`
    pub fn record_success(&mut self, index: usize, elapsed_ms: f64) {
        let Some(endpoint) = self.endpoints.get_mut(index) else {
            return;
        };

        endpoint.successes += 1;
        endpoint.consecutive_failures = 0;
        if !endpoint.healthy {
            log::info!("upstream {} recovered", endpoint.url);
        }
        endpoint.healthy = true;
        endpoint.avg_response_ms = if endpoint.successes == 1 {
            elapsed_ms
        } else {
            RESPONSE_TIME_EWMA_ALPHA * elapsed_ms
                + (1.0 - RESPONSE_TIME_EWMA_ALPHA) * endpoint.avg_response_ms
        };
    }

    /// Record a failed exchange with the endpoint at `index`
    pub fn record_failure(&mut self, index: usize) {
        let failure_threshold = self.failure_threshold;
        let Some(endpoint) = self.endpoints.get_mut(index) else {
            return;
        };

        endpoint.failures += 1;
        endpoint.consecutive_failures += 1;
        endpoint.last_failure_at = Some(Instant::now());

        if endpoint.consecutive_failures >= failure_threshold && endpoint.healthy {
            endpoint.healthy = false;
            log::warn!(
                "upstream {} marked down after {} consecutive failures",
                endpoint.url,
                endpoint.consecutive_failures
            );
        }
    }

    /// Snapshot per-endpoint statistics for logging
    pub fn stats_snapshot(&self) -> Vec<UpstreamStats> {
        self.endpoints
            .iter()
            .map(|endpoint| UpstreamStats {
                url: endpoint.url.clone(),
                healthy: endpoint.healthy,
                successes: endpoint.successes,
                failures: endpoint.failures,
                avg_response_ms: endpoint.avg_response_ms,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager(count: usize) -> UpstreamManager {
        let endpoints = (0..count)
            .map(|i| UpstreamEndpoint::new(format!("https://u{}.example/dns-query", i), None))
            .collect();
        UpstreamManager::new(endpoints).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(UpstreamManager::new(Vec::new()).is_err());
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut manager = make_manager(3);
        let mut counts = [0usize; 3];
        for _ in 0..9 {
            let selected = manager.select().unwrap();
            counts[selected.index] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn test_index_advances_once_per_select() {
        let mut manager = make_manager(2);
        assert_eq!(manager.select().unwrap().index, 0);
        assert_eq!(manager.select().unwrap().index, 1);
        assert_eq!(manager.select().unwrap().index, 0);
    }

    #[test]
    fn test_unhealthy_endpoint_skipped() {
        let mut manager = make_manager(2);
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            manager.record_failure(0);
        }

        for _ in 0..4 {
            assert_eq!(manager.select().unwrap().index, 1);
        }
    }

    #[test]
    fn test_below_threshold_stays_in_rotation() {
        let mut manager = make_manager(2);
        manager.record_failure(0);
        manager.record_failure(0);

        let indices: Vec<usize> = (0..4).map(|_| manager.select().unwrap().index).collect();
        assert!(indices.contains(&0));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut manager = make_manager(2);
        manager.record_failure(0);
        manager.record_failure(0);
        manager.record_success(0, 10.0);
        manager.record_failure(0);
        manager.record_failure(0);

        // Never reached three in a row, so endpoint 0 is still selectable.
        let indices: Vec<usize> = (0..4).map(|_| manager.select().unwrap().index).collect();
        assert!(indices.contains(&0));
    }

    #[test]
    fn test_recovery_readmits_endpoint() {
        let endpoints = vec![
            UpstreamEndpoint::new("https://u0.example/dns-query".into(), None),
            UpstreamEndpoint::new("https://u1.example/dns-query".into(), None),
        ];
        let mut manager =
            UpstreamManager::with_limits(endpoints, 3, Duration::from_millis(20)).unwrap();

        for _ in 0..3 {
            manager.record_failure(0);
        }
        assert_eq!(manager.select().unwrap().index, 1);

        std::thread::sleep(Duration::from_millis(30));
        let indices: Vec<usize> = (0..4).map(|_| manager.select().unwrap().index).collect();
        assert!(indices.contains(&0));
    }

    #[test]
    fn test_success_flips_healthy_back() {
        let mut manager = make_manager(2);
        for _ in 0..3 {
            manager.record_failure(0);
        }
        assert!(!manager.stats_snapshot()[0].healthy);

        manager.record_success(0, 12.0);
        assert!(manager.stats_snapshot()[0].healthy);
    }

    #[test]
    fn test_all_down_falls_back_to_oldest_failure() {
        let endpoints = vec![
            UpstreamEndpoint::new("https://u0.example/dns-query".into(), None),
            UpstreamEndpoint::new("https://u1.example/dns-query".into(), None),
        ];
        let mut manager =
            UpstreamManager::with_limits(endpoints, 1, Duration::from_secs(600)).unwrap();

        manager.record_failure(0);
        std::thread::sleep(Duration::from_millis(5));
        manager.record_failure(1);

        // Endpoint 0 failed first, so it is the best-effort fallback.
        assert_eq!(manager.select().unwrap().index, 0);
    }

    #[test]
    fn test_sole_endpoint_always_returned() {
        let endpoints = vec![UpstreamEndpoint::new(
            "https://solo.example/dns-query".into(),
            None,
        )];
        let mut manager =
            UpstreamManager::with_limits(endpoints, 1, Duration::from_secs(600)).unwrap();

        manager.record_failure(0);
        assert_eq!(manager.select().unwrap().index, 0);
    }

    #[test]
    fn test_response_time_moving_average() {
        let mut manager = make_manager(1);
        manager.record_success(0, 100.0);
        manager.record_success(0, 200.0);

        let stats = manager.stats_snapshot();
        assert!((stats[0].avg_response_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_counters() {
        let mut manager = make_manager(1);
        manager.record_success(0, 5.0);
        manager.record_success(0, 5.0);
        manager.record_failure(0);

        let stats = manager.stats_snapshot();
        assert_eq!(stats[0].successes, 2);
        assert_eq!(stats[0].failures, 1);
    }
}
