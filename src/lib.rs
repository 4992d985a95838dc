//! llm-orchestrator - Multi-provider LLM routing
//!
//! This crate routes text-generation requests across heterogeneous LLM
//! backends behind one uniform contract:
//! - Router: strategy-driven selection with transparent failover
//! - Providers: GigaChat (OAuth2), YandexGPT, local Ollama, and a mock
//! - Metrics: per-provider counters, rolling latency and error windows,
//!   and a derived health classification that feeds routing
//! - Pricing: token counting and ruble cost accounting per request
//! - Prometheus: an embedded `/metrics` endpoint per router instance
//!
//! ```no_run
//! use llm_orchestrator::{MockProvider, ProviderConfig, Router};
//! use std::sync::Arc;
//!
//! # async fn demo() -> llm_orchestrator::Result<()> {
//! let mut router = Router::new("round-robin")?;
//! router.add_provider(Arc::new(MockProvider::new(
//!     ProviderConfig::new("mock-1").with_model("mock-normal"),
//! )))?;
//!
//! let answer = router.route("What is Rust?", None).await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
mod exporter;
pub mod gigachat;
pub mod metrics;
pub mod mock;
pub mod ollama;
pub mod pricing;
pub mod prometheus;
pub mod provider;
pub mod router;
pub mod tokenization;
pub mod yandexgpt;

pub use error::{Error, Result};
pub use metrics::{HealthStatus, MetricsSnapshot, ProviderMetrics};
pub use pricing::{calculate_cost, PricingTable};
pub use provider::{
    GenerationParams, LlmProvider, ProviderConfig, ProviderInfo, ProviderKind, TextStream,
};
pub use router::{Router, RoutingStrategy};
pub use tokenization::{count_tokens, estimate_tokens_fallback};

// Re-export provider types
pub use gigachat::GigaChatProvider;
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use yandexgpt::YandexGptProvider;
