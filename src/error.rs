//! Error types for llm-orchestrator

use thiserror::Error;

/// Orchestrator error type.
///
/// The first five variants form the provider error taxonomy: every concrete
/// provider maps its wire-level failures onto one of them and never leaks
/// transport-specific error types. The remaining variants belong to the
/// router and metrics-server planes.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials rejected by the backend
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Rate limit exceeded
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// Request deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed request or unknown model/endpoint
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Backend-side failure (5xx, connection, DNS, TLS, malformed response)
    #[error("provider error: {0}")]
    Provider(String),

    /// Unknown routing strategy name
    #[error("unknown routing strategy: {0}")]
    UnknownStrategy(String),

    /// The router has no registered providers
    #[error("no providers registered")]
    NoProviders,

    /// The metrics server was already started for this router
    #[error("metrics server already started for this router")]
    MetricsServerRunning,

    /// The requested metrics port is taken
    #[error("port {0} is already in use, try another port (e.g. {next})", next = .0 + 1)]
    PortInUse(u16),
}

impl Error {
    /// Stable lowercase label for this error's kind, used in request events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::RateLimit(_) => "rate_limit",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Provider(_) => "provider",
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::NoProviders => "no_providers",
            Self::MetricsServerRunning => "metrics_server_running",
            Self::PortInUse(_) => "port_in_use",
        }
    }

    /// Whether a provider-local retry loop may absorb this error.
    ///
    /// Only rate limits and timeouts are transient; everything else
    /// propagates immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit(_) | Self::Timeout(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
