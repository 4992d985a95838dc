//! Router - strategy-driven provider selection with transparent failover
//!
//! The router owns an ordered list of providers, picks a starting provider
//! per call according to its strategy, and on failure walks the remaining
//! providers in registration order until one succeeds or all fail. Every
//! attempt updates the provider's metrics record and the Prometheus series,
//! and emits a structured request event.

use crate::error::{Error, Result};
use crate::exporter::MetricsServer;
use crate::metrics::{MetricsSnapshot, ProviderMetrics};
use crate::pricing::PricingTable;
use crate::prometheus::MetricsRegistry;
use crate::provider::{GenerationParams, LlmProvider, ProviderInfo, TextStream};
use crate::tokenization::count_tokens;
use futures::{Stream, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{info, instrument, warn};

// ============================================================================
// Strategy
// ============================================================================

/// Rule for picking the starting provider of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Rotate through providers in registration order
    RoundRobin,
    /// Uniformly random starting provider
    Random,
    /// First provider whose health probe passes
    FirstAvailable,
    /// Best health class, lowest observed latency within it
    BestAvailable,
}

impl RoutingStrategy {
    /// Canonical name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::FirstAvailable => "first-available",
            Self::BestAvailable => "best-available",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "first-available" => Ok(Self::FirstAvailable),
            "best-available" => Ok(Self::BestAvailable),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// One registered provider with its metrics record.
struct ProviderEntry {
    provider: Arc<dyn LlmProvider>,
    info: ProviderInfo,
    metrics: Mutex<ProviderMetrics>,
}

impl ProviderEntry {
    fn snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }
}

/// Exporter lifecycle state. `started` never resets: the metrics server may
/// be started at most once per router.
#[derive(Default)]
struct ExporterState {
    started: bool,
    server: Option<MetricsServer>,
}

/// Multi-provider LLM router.
pub struct Router {
    strategy: RoutingStrategy,
    entries: Vec<Arc<ProviderEntry>>,
    rr_index: AtomicUsize,
    pricing: PricingTable,
    registry: Arc<MetricsRegistry>,
    exporter: tokio::sync::Mutex<ExporterState>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("strategy", &self.strategy)
            .field("provider_count", &self.entries.len())
            .finish()
    }
}

impl Router {
    /// Create a router from a strategy name. Unknown names fail fast.
    pub fn new(strategy: &str) -> Result<Self> {
        Ok(Self::with_strategy(strategy.parse()?))
    }

    /// Create a router from a parsed strategy.
    #[must_use]
    pub fn with_strategy(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            entries: Vec::new(),
            rr_index: AtomicUsize::new(0),
            pricing: PricingTable::default(),
            registry: Arc::new(MetricsRegistry::new()),
            exporter: tokio::sync::Mutex::new(ExporterState::default()),
        }
    }

    /// Replace the pricing table (instance-scoped, no global state).
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// The configured strategy.
    #[must_use]
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Register a provider. Names must be unique within the router; the
    /// list is append-only for the router's lifetime.
    pub fn add_provider(&mut self, provider: Arc<dyn LlmProvider>) -> Result<()> {
        let info = provider.describe();
        if self.entries.iter().any(|e| e.info.name == info.name) {
            return Err(Error::InvalidRequest(format!(
                "provider '{}' is already registered",
                info.name
            )));
        }
        info!(provider = %info.name, model = %info.model, kind = %info.kind, "registering provider");
        self.entries.push(Arc::new(ProviderEntry {
            provider,
            info,
            metrics: Mutex::new(ProviderMetrics::new()),
        }));
        Ok(())
    }

    /// Registered provider names, in registration order.
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.info.name.clone()).collect()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time metrics snapshots, keyed by provider name.
    #[must_use]
    pub fn get_metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.entries
            .iter()
            .map(|e| (e.info.name.clone(), e.snapshot()))
            .collect()
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Pick the starting index for one call.
    ///
    /// The round-robin index advances once per call, not per attempt: the
    /// next call starts at the neighbor of this call's starting provider
    /// regardless of how many fallbacks this call consumed.
    async fn select_start(&self) -> usize {
        let n = self.entries.len();
        match self.strategy {
            RoutingStrategy::RoundRobin => self.rr_index.fetch_add(1, Ordering::Relaxed) % n,
            RoutingStrategy::Random => rand::thread_rng().gen_range(0..n),
            RoutingStrategy::FirstAvailable => {
                for (i, entry) in self.entries.iter().enumerate() {
                    if entry.provider.health_check().await {
                        return i;
                    }
                }
                // Nothing probes healthy: walk everyone from the beginning.
                0
            }
            RoutingStrategy::BestAvailable => {
                let mut best = 0usize;
                let mut best_key = (u8::MAX, f64::INFINITY);
                for (i, entry) in self.entries.iter().enumerate() {
                    let snap = entry.snapshot();
                    let key = (snap.health_status.rank(), snap.effective_latency_ms());
                    if key.0 < best_key.0 || (key.0 == best_key.0 && key.1 < best_key.1) {
                        best = i;
                        best_key = key;
                    }
                }
                best
            }
        }
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    fn record_success(
        &self,
        entry: &ProviderEntry,
        latency_ms: f64,
        streaming: bool,
        prompt: &str,
        completion: &str,
    ) {
        let prompt_tokens = u64::from(count_tokens(prompt, &entry.info.model));
        let completion_tokens = u64::from(count_tokens(completion, &entry.info.model));
        let total_tokens = prompt_tokens + completion_tokens;
        let cost = self.pricing.cost(
            entry.info.kind.as_str(),
            Some(&entry.info.model),
            total_tokens,
        );

        entry
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_success(latency_ms, prompt_tokens, completion_tokens, cost);

        let name = entry.info.name.as_str();
        self.registry.observe_request(name, true, latency_ms / 1000.0);
        self.registry.add_tokens(name, prompt_tokens, completion_tokens);
        self.registry.add_cost(name, cost);

        info!(
            provider = name,
            model = %entry.info.model,
            latency_ms,
            streaming,
            success = true,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_rub = (cost * 100.0).round() / 100.0,
            "request_completed"
        );
    }

    fn record_failure(&self, entry: &ProviderEntry, latency_ms: f64, streaming: bool, err: &Error) {
        entry
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_error(chrono::Utc::now());

        let name = entry.info.name.as_str();
        self.registry.observe_request(name, false, latency_ms / 1000.0);

        warn!(
            provider = name,
            model = %entry.info.model,
            latency_ms,
            streaming,
            success = false,
            error_kind = err.kind(),
            error = %err,
            "request_failed"
        );
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route a unary generation request through the fallback loop.
    #[instrument(skip(self, prompt, params), fields(strategy = self.strategy.as_str()))]
    pub async fn route(&self, prompt: &str, params: Option<GenerationParams>) -> Result<String> {
        if self.entries.is_empty() {
            return Err(Error::NoProviders);
        }
        let params = params.unwrap_or_default();
        params.validate()?;

        let n = self.entries.len();
        let start = self.select_start().await;
        let mut last_err = None;

        for i in 0..n {
            let entry = &self.entries[(start + i) % n];
            let began = Instant::now();
            match entry.provider.generate(prompt, &params).await {
                Ok(text) => {
                    let latency_ms = began.elapsed().as_secs_f64() * 1000.0;
                    self.record_success(entry, latency_ms, false, prompt, &text);
                    return Ok(text);
                }
                Err(err) => {
                    let latency_ms = began.elapsed().as_secs_f64() * 1000.0;
                    self.record_failure(entry, latency_ms, false, &err);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(Error::NoProviders))
    }

    /// Route a streaming generation request.
    ///
    /// Selection and ordering match [`route`](Self::route), but fallback is
    /// permitted only while no chunk has reached the caller. Once the first
    /// chunk is out, a later error terminates the stream and is reported
    /// without trying further providers.
    #[instrument(skip(self, prompt, params), fields(strategy = self.strategy.as_str()))]
    pub async fn route_stream(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<TextStream> {
        if self.entries.is_empty() {
            return Err(Error::NoProviders);
        }
        let params = params.unwrap_or_default();
        params.validate()?;

        let n = self.entries.len();
        let start = self.select_start().await;
        let mut last_err = None;

        for i in 0..n {
            let entry = self.entries[(start + i) % n].clone();
            let began = Instant::now();
            match entry.provider.generate_stream(prompt, &params).await {
                Err(err) => {
                    let latency_ms = began.elapsed().as_secs_f64() * 1000.0;
                    self.record_failure(&entry, latency_ms, true, &err);
                    last_err = Some(err);
                    continue;
                }
                Ok(mut stream) => {
                    // Still pre-flight: pull the first chunk here so a
                    // failure before any output can fall back.
                    match stream.next().await {
                        Some(Err(err)) => {
                            let latency_ms = began.elapsed().as_secs_f64() * 1000.0;
                            self.record_failure(&entry, latency_ms, true, &err);
                            last_err = Some(err);
                            continue;
                        }
                        None => {
                            let latency_ms = began.elapsed().as_secs_f64() * 1000.0;
                            self.record_success(&entry, latency_ms, true, prompt, "");
                            return Ok(Box::pin(futures::stream::empty()));
                        }
                        Some(Ok(first)) => {
                            return Ok(Box::pin(AccountedStream {
                                inner: stream,
                                pending_first: Some(first),
                                entry,
                                router: RouterAccounting {
                                    pricing: self.pricing.clone(),
                                    registry: self.registry.clone(),
                                },
                                began,
                                prompt: prompt.to_string(),
                                collected: String::new(),
                                finished: false,
                            }));
                        }
                    }
                }
            }
        }

        Err(last_err.unwrap_or(Error::NoProviders))
    }

    // ========================================================================
    // Metrics server
    // ========================================================================

    /// Start the Prometheus endpoint on the given TCP port.
    ///
    /// May be called at most once per router; a port of 0 binds an
    /// ephemeral port (see [`metrics_port`](Self::metrics_port)).
    pub async fn start_metrics_server(&self, port: u16) -> Result<()> {
        let mut state = self.exporter.lock().await;
        if state.started {
            return Err(Error::MetricsServerRunning);
        }

        let entries = self.entries.clone();
        let server = MetricsServer::start(
            self.registry.clone(),
            move || {
                entries
                    .iter()
                    .map(|e| (e.info.name.clone(), e.snapshot().health_status.gauge_value()))
                    .collect()
            },
            port,
        )
        .await?;

        state.started = true;
        state.server = Some(server);
        Ok(())
    }

    /// Port the metrics server is bound to, if running.
    pub async fn metrics_port(&self) -> Option<u16> {
        self.exporter.lock().await.server.as_ref().map(MetricsServer::port)
    }

    /// Stop the Prometheus endpoint. Idempotent; the background task is
    /// cancelled before the port is released.
    pub async fn stop_metrics_server(&self) {
        let server = self.exporter.lock().await.server.take();
        if let Some(server) = server {
            server.stop().await;
        }
    }
}

// ============================================================================
// Stream accounting
// ============================================================================

/// The pieces of router state a live stream needs for its terminal
/// accounting.
struct RouterAccounting {
    pricing: PricingTable,
    registry: Arc<MetricsRegistry>,
}

/// Wrapper stream that forwards chunks and records metrics and the request
/// event when the stream ends. A stream dropped before its end records
/// nothing: a cancelled call is neither success nor failure.
struct AccountedStream {
    inner: TextStream,
    pending_first: Option<String>,
    entry: Arc<ProviderEntry>,
    router: RouterAccounting,
    began: Instant,
    prompt: String,
    collected: String,
    finished: bool,
}

impl AccountedStream {
    fn finish_success(&mut self) {
        self.finished = true;
        let latency_ms = self.began.elapsed().as_secs_f64() * 1000.0;
        let info = &self.entry.info;

        let prompt_tokens = u64::from(count_tokens(&self.prompt, &info.model));
        let completion_tokens = u64::from(count_tokens(&self.collected, &info.model));
        let total_tokens = prompt_tokens + completion_tokens;
        let cost = self
            .router
            .pricing
            .cost(info.kind.as_str(), Some(&info.model), total_tokens);

        self.entry
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_success(latency_ms, prompt_tokens, completion_tokens, cost);
        self.router
            .registry
            .observe_request(&info.name, true, latency_ms / 1000.0);
        self.router
            .registry
            .add_tokens(&info.name, prompt_tokens, completion_tokens);
        self.router.registry.add_cost(&info.name, cost);

        info!(
            provider = %info.name,
            model = %info.model,
            latency_ms,
            streaming = true,
            success = true,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_rub = (cost * 100.0).round() / 100.0,
            "request_completed"
        );
    }

    fn finish_failure(&mut self, err: &Error) {
        self.finished = true;
        let latency_ms = self.began.elapsed().as_secs_f64() * 1000.0;
        let info = &self.entry.info;

        self.entry
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_error(chrono::Utc::now());
        self.router
            .registry
            .observe_request(&info.name, false, latency_ms / 1000.0);

        warn!(
            provider = %info.name,
            model = %info.model,
            latency_ms,
            streaming = true,
            success = false,
            error_kind = err.kind(),
            error = %err,
            "request_failed"
        );
    }
}

impl Stream for AccountedStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(first) = this.pending_first.take() {
            this.collected.push_str(&first);
            return Poll::Ready(Some(Ok(first)));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.collected.push_str(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                // Chunks already reached the caller: report, never fall back.
                this.finish_failure(&err);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish_success();
                Poll::Ready(None)
            }
        }
    }
}
