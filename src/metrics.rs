//! Per-provider metrics
//!
//! Tracks counters, a rolling latency window, and a timestamped window of
//! recent errors for each provider, and derives a health classification
//! from them. Records are mutated under a per-provider lock; readers take a
//! point-in-time [`MetricsSnapshot`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Capacity of the rolling latency window (successful requests)
pub const LATENCY_WINDOW_SIZE: usize = 100;

/// Width of the recent-error window in seconds
pub const ERROR_WINDOW_SECS: i64 = 60;

/// Requests required before health is derived from data
pub const MIN_REQUESTS_FOR_HEALTH: u64 = 5;

/// Successes required before the latency degradation check applies
pub const MIN_SUCCESSES_FOR_LATENCY_CHECK: u64 = 20;

/// Recent error rate at or above which a provider is degraded
pub const ERROR_RATE_THRESHOLD_DEGRADED: f64 = 0.3;

/// Recent error rate at or above which a provider is unhealthy
pub const ERROR_RATE_THRESHOLD_UNHEALTHY: f64 = 0.6;

/// Rolling latency must exceed this multiple of the cumulative average
/// before latency alone degrades a provider
pub const LATENCY_THRESHOLD_FACTOR_DEGRADED: f64 = 2.0;

/// Derived health classification of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally (or too little data to say otherwise)
    Healthy,
    /// Elevated error rate or latency
    Degraded,
    /// Failing most requests
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Gauge encoding: 1 healthy, 0.5 degraded, 0 unhealthy.
    #[must_use]
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }

    /// Preference rank for routing: lower is better.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

/// Mutable per-provider record.
#[derive(Debug)]
pub struct ProviderMetrics {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    /// Cumulative latency over successful requests only
    total_latency_ms: f64,
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
    total_cost_rub: f64,
    latency_window: VecDeque<f64>,
    error_timestamps: VecDeque<DateTime<Utc>>,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderMetrics {
    /// Create an empty record with pre-allocated windows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_latency_ms: 0.0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_cost_rub: 0.0,
            latency_window: VecDeque::with_capacity(LATENCY_WINDOW_SIZE),
            error_timestamps: VecDeque::with_capacity(64),
        }
    }

    /// Record a successful attempt.
    pub fn record_success(
        &mut self,
        latency_ms: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_rub: f64,
    ) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_latency_ms += latency_ms;
        self.total_prompt_tokens += prompt_tokens;
        self.total_completion_tokens += completion_tokens;
        self.total_cost_rub += cost_rub;

        if self.latency_window.len() == LATENCY_WINDOW_SIZE {
            self.latency_window.pop_front();
        }
        self.latency_window.push_back(latency_ms);
    }

    /// Record a failed attempt at the given wall-clock time.
    ///
    /// Failures contribute to request counters and the error window only;
    /// latency and token totals track successful requests.
    pub fn record_error(&mut self, at: DateTime<Utc>) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.error_timestamps.push_back(at);
        self.compact_errors(at);
    }

    /// Take a consistent point-in-time snapshot, compacting the error
    /// window first.
    pub fn snapshot(&mut self) -> MetricsSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Snapshot against an explicit clock.
    pub fn snapshot_at(&mut self, now: DateTime<Utc>) -> MetricsSnapshot {
        self.compact_errors(now);

        let avg_latency_ms = self.total_latency_ms / (self.successful_requests.max(1)) as f64;
        let rolling_avg_latency_ms = if self.latency_window.is_empty() {
            None
        } else {
            Some(self.latency_window.iter().sum::<f64>() / self.latency_window.len() as f64)
        };

        let recent_errors = self.error_timestamps.len() as u64;
        let recent_error_rate = if self.total_requests < MIN_REQUESTS_FOR_HEALTH {
            0.0
        } else {
            recent_errors as f64 / (self.total_requests.max(1)) as f64
        };

        let success_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        };

        let health_status = derive_health(
            self.total_requests,
            self.successful_requests,
            recent_error_rate,
            avg_latency_ms,
            rolling_avg_latency_ms,
        );

        MetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            total_latency_ms: self.total_latency_ms,
            total_prompt_tokens: self.total_prompt_tokens,
            total_completion_tokens: self.total_completion_tokens,
            total_tokens: self.total_prompt_tokens + self.total_completion_tokens,
            total_cost_rub: self.total_cost_rub,
            recent_errors,
            avg_latency_ms,
            rolling_avg_latency_ms,
            recent_error_rate,
            success_rate,
            health_status,
        }
    }

    /// Drop error timestamps older than the window.
    fn compact_errors(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::seconds(ERROR_WINDOW_SECS);
        while let Some(front) = self.error_timestamps.front() {
            if *front < cutoff {
                self.error_timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Health classification rules, applied to already-derived quantities.
fn derive_health(
    total: u64,
    successes: u64,
    recent_error_rate: f64,
    avg_latency_ms: f64,
    rolling_avg_latency_ms: Option<f64>,
) -> HealthStatus {
    // Optimistic until there is enough data.
    if total < MIN_REQUESTS_FOR_HEALTH {
        return HealthStatus::Healthy;
    }
    if recent_error_rate >= ERROR_RATE_THRESHOLD_UNHEALTHY {
        return HealthStatus::Unhealthy;
    }
    if recent_error_rate >= ERROR_RATE_THRESHOLD_DEGRADED {
        return HealthStatus::Degraded;
    }
    if successes >= MIN_SUCCESSES_FOR_LATENCY_CHECK {
        if let Some(rolling) = rolling_avg_latency_ms {
            if avg_latency_ms > 0.0 && rolling > LATENCY_THRESHOLD_FACTOR_DEGRADED * avg_latency_ms
            {
                return HealthStatus::Degraded;
            }
        }
    }
    HealthStatus::Healthy
}

/// Point-in-time view of a provider's metrics, including derived fields.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// All attempts
    pub total_requests: u64,
    /// Successful attempts
    pub successful_requests: u64,
    /// Failed attempts
    pub failed_requests: u64,
    /// Cumulative latency over successful attempts, in milliseconds
    pub total_latency_ms: f64,
    /// Prompt tokens processed
    pub total_prompt_tokens: u64,
    /// Completion tokens produced
    pub total_completion_tokens: u64,
    /// Prompt plus completion tokens
    pub total_tokens: u64,
    /// Accumulated cost in rubles
    pub total_cost_rub: f64,
    /// Errors inside the 60 s window
    pub recent_errors: u64,
    /// Cumulative average latency in milliseconds
    pub avg_latency_ms: f64,
    /// Mean of the rolling latency window, if any samples exist
    pub rolling_avg_latency_ms: Option<f64>,
    /// Recent errors over total requests (0 below the data threshold)
    pub recent_error_rate: f64,
    /// Successes over total requests
    pub success_rate: f64,
    /// Derived health classification
    pub health_status: HealthStatus,
}

impl MetricsSnapshot {
    /// Latency figure used for routing decisions: the rolling average when
    /// available, the cumulative average otherwise, zero without data.
    #[must_use]
    pub fn effective_latency_ms(&self) -> f64 {
        self.rolling_avg_latency_ms.unwrap_or(self.avg_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let mut metrics = ProviderMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.successful_requests, 0);
        assert_eq!(snap.failed_requests, 0);
        assert_eq!(snap.total_latency_ms, 0.0);
        assert_eq!(snap.avg_latency_ms, 0.0);
        assert!(snap.rolling_avg_latency_ms.is_none());
        assert_eq!(snap.recent_error_rate, 0.0);
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.health_status, HealthStatus::Healthy);
    }

    #[test]
    fn test_record_success_updates_counters() {
        let mut metrics = ProviderMetrics::new();
        metrics.record_success(100.0, 0, 0, 0.0);
        metrics.record_success(200.0, 0, 0, 0.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.failed_requests, 0);
        assert_eq!(snap.total_latency_ms, 300.0);
        assert_eq!(snap.avg_latency_ms, 150.0);
        assert_eq!(snap.rolling_avg_latency_ms, Some(150.0));
        assert_eq!(snap.success_rate, 1.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let mut metrics = ProviderMetrics::new();
        for i in 0..150 {
            metrics.record_success(f64::from(i), 0, 0, 0.0);
        }
        assert_eq!(metrics.latency_window.len(), LATENCY_WINDOW_SIZE);
        // Last 100 values: 50..=149
        assert_eq!(metrics.latency_window.front().copied(), Some(50.0));
        assert_eq!(metrics.latency_window.back().copied(), Some(149.0));
    }

    #[test]
    fn test_record_error_counts_and_window() {
        let mut metrics = ProviderMetrics::new();
        let now = Utc::now();

        metrics.record_error(now);
        let snap = metrics.snapshot_at(now);
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.successful_requests, 0);
        assert_eq!(snap.total_latency_ms, 0.0);
        assert_eq!(snap.recent_errors, 1);
    }

    #[test]
    fn test_old_error_timestamps_are_compacted() {
        let mut metrics = ProviderMetrics::new();
        let now = Utc::now();

        metrics.record_error(now - ChronoDuration::seconds(70));
        metrics.record_error(now);

        let snap = metrics.snapshot_at(now);
        assert_eq!(snap.failed_requests, 2);
        assert_eq!(snap.recent_errors, 1);
    }

    #[test]
    fn test_counter_consistency_under_mixed_sequence() {
        let mut metrics = ProviderMetrics::new();
        let now = Utc::now();
        for i in 0..50 {
            if i % 3 == 0 {
                metrics.record_error(now);
            } else {
                metrics.record_success(10.0, 5, 7, 0.01);
            }
            let snap = metrics.snapshot_at(now);
            assert_eq!(
                snap.total_requests,
                snap.successful_requests + snap.failed_requests
            );
        }
    }

    #[test]
    fn test_tokens_and_cost_accumulate() {
        let mut metrics = ProviderMetrics::new();
        metrics.record_success(100.0, 10, 20, 0.05);
        metrics.record_success(150.0, 15, 25, 0.08);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_prompt_tokens, 25);
        assert_eq!(snap.total_completion_tokens, 45);
        assert_eq!(snap.total_tokens, 70);
        assert!((snap.total_cost_rub - 0.13).abs() < 1e-9);

        // Failures leave token totals untouched.
        metrics.record_error(Utc::now());
        let snap = metrics.snapshot();
        assert_eq!(snap.total_tokens, 70);
    }

    #[test]
    fn test_recent_error_rate_needs_enough_data() {
        let mut metrics = ProviderMetrics::new();
        let now = Utc::now();

        // Below the threshold the rate is conventionally zero.
        metrics.record_error(now);
        metrics.record_error(now);
        assert_eq!(metrics.snapshot_at(now).recent_error_rate, 0.0);
        assert_eq!(metrics.snapshot_at(now).health_status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_unhealthy_by_error_rate() {
        let mut metrics = ProviderMetrics::new();
        let now = Utc::now();
        for _ in 0..3 {
            metrics.record_success(100.0, 0, 0, 0.0);
        }
        for _ in 0..7 {
            metrics.record_error(now);
        }
        let snap = metrics.snapshot_at(now);
        assert!(snap.recent_error_rate >= ERROR_RATE_THRESHOLD_UNHEALTHY);
        assert_eq!(snap.health_status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_degraded_by_error_rate() {
        let mut metrics = ProviderMetrics::new();
        let now = Utc::now();
        for _ in 0..6 {
            metrics.record_success(100.0, 0, 0, 0.0);
        }
        for _ in 0..4 {
            metrics.record_error(now);
        }
        let snap = metrics.snapshot_at(now);
        assert!(snap.recent_error_rate >= ERROR_RATE_THRESHOLD_DEGRADED);
        assert!(snap.recent_error_rate < ERROR_RATE_THRESHOLD_UNHEALTHY);
        assert_eq!(snap.health_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_health_healthy_with_clean_record() {
        let mut metrics = ProviderMetrics::new();
        for _ in 0..10 {
            metrics.record_success(100.0, 0, 0, 0.0);
        }
        assert_eq!(metrics.snapshot().health_status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_degraded_by_latency_regression() {
        let mut metrics = ProviderMetrics::new();
        // Long history of fast responses keeps the cumulative average low.
        for _ in 0..200 {
            metrics.record_success(100.0, 0, 0, 0.0);
        }
        // The rolling window then fills entirely with slow responses.
        for _ in 0..100 {
            metrics.record_success(600.0, 0, 0, 0.0);
        }

        let snap = metrics.snapshot();
        let rolling = snap.rolling_avg_latency_ms.unwrap();
        assert!((rolling - 600.0).abs() < 1.0);
        assert!(rolling > LATENCY_THRESHOLD_FACTOR_DEGRADED * snap.avg_latency_ms);
        assert_eq!(snap.health_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_effective_latency_prefers_rolling() {
        let mut metrics = ProviderMetrics::new();
        assert_eq!(metrics.snapshot().effective_latency_ms(), 0.0);

        metrics.record_success(100.0, 0, 0, 0.0);
        let snap = metrics.snapshot();
        assert_eq!(snap.effective_latency_ms(), 100.0);
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(HealthStatus::Healthy.gauge_value(), 1.0);
        assert_eq!(HealthStatus::Degraded.gauge_value(), 0.5);
        assert_eq!(HealthStatus::Unhealthy.gauge_value(), 0.0);
    }
}
