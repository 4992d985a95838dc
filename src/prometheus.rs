//! Prometheus series for router observability
//!
//! A small, self-contained registry holding the fixed series exported at
//! `/metrics`. Each router owns its own registry, so several routers in one
//! process stay independent. Fractional values (rubles, health) are stored
//! as fixed-point milli-units in atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Histogram bucket bounds for per-attempt latency, in seconds
pub const LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Label key: a fixed-order vector of (name, value) pairs.
type LabelKey = Vec<(String, String)>;

/// A thread-safe counter.
#[derive(Debug, Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter of milli-units, for monotonically growing fractional values.
#[derive(Debug, Default)]
struct MilliCounter {
    milli: AtomicU64,
}

impl MilliCounter {
    fn add(&self, value: f64) {
        self.milli
            .fetch_add((value * 1000.0).round() as u64, Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        self.milli.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// A gauge of milli-units.
#[derive(Debug, Default)]
struct MilliGauge {
    milli: AtomicU64,
}

impl MilliGauge {
    fn set(&self, value: f64) {
        self.milli
            .store((value * 1000.0).round() as u64, Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        self.milli.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// A histogram with fixed bucket bounds.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_milli: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds.iter().map(|b| (*b, AtomicU64::new(0))).collect(),
            sum_milli: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.sum_milli
            .fetch_add((value * 1000.0).round() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A family of values keyed by label set.
#[derive(Debug)]
struct Family<M> {
    entries: RwLock<HashMap<LabelKey, Arc<M>>>,
}

impl<M> Family<M> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch or create the member for a label set. The read lock covers the
    /// hot path; the write lock is only taken for first-seen label sets.
    fn get_or_create(&self, labels: &[(&str, &str)], make: impl FnOnce() -> M) -> Arc<M> {
        let key: LabelKey = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();

        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(member) = entries.get(&key) {
                return member.clone();
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    fn snapshot(&self) -> Vec<(LabelKey, Arc<M>)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<_> = entries
            .iter()
            .map(|(labels, member)| (labels.clone(), member.clone()))
            .collect();
        items.sort_by(|(a, _), (b, _)| a.cmp(b));
        items
    }
}

/// Format label pairs as `{key1="val1",key2="val2"}`.
fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{{{}}}", parts.join(","))
}

/// The fixed series exported by a router.
#[derive(Debug)]
pub struct MetricsRegistry {
    requests_total: Family<Counter>,
    latency_seconds: Family<Histogram>,
    tokens_total: Family<Counter>,
    cost_total: Family<MilliCounter>,
    provider_health: Family<MilliGauge>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: Family::new(),
            latency_seconds: Family::new(),
            tokens_total: Family::new(),
            cost_total: Family::new(),
            provider_health: Family::new(),
        }
    }

    /// Count one attempt and observe its latency.
    pub fn observe_request(&self, provider: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };
        self.requests_total
            .get_or_create(&[("provider", provider), ("status", status)], Counter::default)
            .add(1);
        self.latency_seconds
            .get_or_create(&[("provider", provider)], || Histogram::new(LATENCY_BUCKETS))
            .observe(latency_secs);
    }

    /// Count processed tokens.
    pub fn add_tokens(&self, provider: &str, prompt: u64, completion: u64) {
        self.tokens_total
            .get_or_create(&[("provider", provider), ("type", "prompt")], Counter::default)
            .add(prompt);
        self.tokens_total
            .get_or_create(
                &[("provider", provider), ("type", "completion")],
                Counter::default,
            )
            .add(completion);
    }

    /// Count accumulated cost in rubles.
    pub fn add_cost(&self, provider: &str, rub: f64) {
        self.cost_total
            .get_or_create(&[("provider", provider)], MilliCounter::default)
            .add(rub);
    }

    /// Set the health gauge (1 healthy, 0.5 degraded, 0 unhealthy).
    pub fn set_health(&self, provider: &str, value: f64) {
        self.provider_health
            .get_or_create(&[("provider", provider)], MilliGauge::default)
            .set(value);
    }

    /// Render all series in the Prometheus text format (v0.0.4).
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP llm_requests_total Total LLM requests per provider and status\n");
        out.push_str("# TYPE llm_requests_total counter\n");
        for (labels, counter) in self.requests_total.snapshot() {
            out.push_str(&format!(
                "llm_requests_total{} {}\n",
                format_labels(&labels),
                counter.get()
            ));
        }

        out.push_str("# HELP llm_request_latency_seconds Per-attempt request latency\n");
        out.push_str("# TYPE llm_request_latency_seconds histogram\n");
        for (labels, histogram) in self.latency_seconds.snapshot() {
            for (bound, count) in &histogram.buckets {
                let mut bucket_labels = labels.clone();
                bucket_labels.push(("le".to_string(), format!("{bound}")));
                out.push_str(&format!(
                    "llm_request_latency_seconds_bucket{} {}\n",
                    format_labels(&bucket_labels),
                    count.load(Ordering::Relaxed)
                ));
            }
            let mut inf_labels = labels.clone();
            inf_labels.push(("le".to_string(), "+Inf".to_string()));
            out.push_str(&format!(
                "llm_request_latency_seconds_bucket{} {}\n",
                format_labels(&inf_labels),
                histogram.count.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "llm_request_latency_seconds_sum{} {}\n",
                format_labels(&labels),
                histogram.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0
            ));
            out.push_str(&format!(
                "llm_request_latency_seconds_count{} {}\n",
                format_labels(&labels),
                histogram.count.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP llm_tokens_total Tokens processed per provider\n");
        out.push_str("# TYPE llm_tokens_total counter\n");
        for (labels, counter) in self.tokens_total.snapshot() {
            out.push_str(&format!(
                "llm_tokens_total{} {}\n",
                format_labels(&labels),
                counter.get()
            ));
        }

        out.push_str("# HELP llm_cost_total Accumulated cost in rubles per provider\n");
        out.push_str("# TYPE llm_cost_total counter\n");
        for (labels, counter) in self.cost_total.snapshot() {
            out.push_str(&format!(
                "llm_cost_total{} {}\n",
                format_labels(&labels),
                counter.get()
            ));
        }

        out.push_str("# HELP llm_provider_health Provider health (1 healthy, 0.5 degraded, 0 unhealthy)\n");
        out.push_str("# TYPE llm_provider_health gauge\n");
        for (labels, gauge) in self.provider_health.snapshot() {
            out.push_str(&format!(
                "llm_provider_health{} {}\n",
                format_labels(&labels),
                gauge.get()
            ));
        }

        out
    }
}
