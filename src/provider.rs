//! Provider contract and shared provider plumbing
//!
//! This module defines the configuration and parameter types, the
//! [`LlmProvider`] trait that every backend implements, and the shared
//! retry helper used by the remote providers.

use crate::error::{Error, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

/// Minimum key length to display partial key
const MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY: usize = 8;

/// Number of characters to show at start/end of masked key
const KEY_MASK_VISIBLE_CHARS: usize = 4;

/// Upper bound on a single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A lazy, finite, single-shot sequence of response chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Mask an API key for safe display in logs.
///
/// Shows first 4 and last 4 characters for keys longer than 8 characters,
/// otherwise shows "****" to prevent exposure of short keys.
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    if key.len() <= MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY {
        return "****".to_string();
    }
    format!(
        "{}...{}",
        &key[..KEY_MASK_VISIBLE_CHARS],
        &key[key.len() - KEY_MASK_VISIBLE_CHARS..]
    )
}

// ============================================================================
// Configuration
// ============================================================================

/// Immutable descriptor for a provider instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Identity used in logs, metrics labels, and provider lookup
    pub name: String,
    /// Credential material; semantics are provider-specific
    pub api_key: Option<String>,
    /// Endpoint override; each provider has a built-in default
    pub base_url: Option<String>,
    /// Upper bound on a single request attempt, in seconds (1..=300)
    pub timeout_secs: u64,
    /// Cap for the provider-local retry loop (0..=10)
    pub max_retries: u32,
    /// Peer certificate verification (some backends use local trust anchors)
    pub verify_tls: bool,
    /// Backend-specific model identifier
    pub model: Option<String>,
    /// OAuth2 scope, used only by providers that require it
    pub scope: Option<String>,
    /// Cloud folder identifier required by some backends
    pub tenant_id: Option<String>,
}

// Custom Debug implementation to mask the API key
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_key", &self.api_key.as_deref().map(mask_api_key))
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("verify_tls", &self.verify_tls)
            .field("model", &self.model)
            .field("scope", &self.scope)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl ProviderConfig {
    /// Create a configuration with defaults for everything but the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: None,
            base_url: None,
            timeout_secs: 30,
            max_retries: 3,
            verify_tls: true,
            model: None,
            scope: None,
            tenant_id: None,
        }
    }

    /// Set the API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the per-attempt timeout in seconds
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the retry cap
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enable or disable TLS peer verification
    #[must_use]
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Set the model identifier
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the OAuth2 scope
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the cloud folder identifier
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Per-attempt timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidRequest("provider name must not be empty".into()));
        }
        if !(1..=300).contains(&self.timeout_secs) {
            return Err(Error::InvalidRequest(format!(
                "timeout must be within 1..=300 seconds, got {}",
                self.timeout_secs
            )));
        }
        if self.max_retries > 10 {
            return Err(Error::InvalidRequest(format!(
                "max_retries must be within 0..=10, got {}",
                self.max_retries
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Generation parameters
// ============================================================================

/// Per-call generation knobs.
///
/// Providers may ignore parameters they do not support; they never fail a
/// request solely because an unsupported field is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature (0.0..=2.0)
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Nucleus sampling cutoff (0.0..=1.0)
    pub top_p: f32,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            stop: None,
        }
    }
}

impl GenerationParams {
    /// Create parameters with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the token cap
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the nucleus sampling cutoff
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the stop sequences
    #[must_use]
    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::InvalidRequest(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidRequest("max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be within 0.0..=1.0, got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Provider identity
// ============================================================================

/// Backend family of a provider, used for metrics labels and pricing lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local simulation provider
    Mock,
    /// GigaChat (Sber) remote API
    GigaChat,
    /// YandexGPT foundation-models API
    YandexGpt,
    /// Local Ollama inference server
    Ollama,
}

impl ProviderKind {
    /// Lowercase identifier used as a pricing key and metrics label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::GigaChat => "gigachat",
            Self::YandexGpt => "yandexgpt",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-describing provider identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Instance name (unique within a router)
    pub name: String,
    /// Effective model identifier
    pub model: String,
    /// Backend family
    pub kind: ProviderKind,
}

// ============================================================================
// Provider trait
// ============================================================================

/// Uniform contract every backend satisfies.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Identity used for metrics labels and pricing lookup.
    fn describe(&self) -> ProviderInfo;

    /// Known model identifiers for this backend.
    fn models(&self) -> Vec<String>;

    /// Produce a complete response for the prompt.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Produce a lazy, single-shot sequence of response chunks.
    ///
    /// An `Err` returned from this call is a pre-flight failure and is
    /// eligible for router-level fallback; an `Err` yielded by the stream
    /// after one or more chunks terminates the stream without fallback.
    ///
    /// Backends without native streaming inherit this implementation, which
    /// yields the whole unary response as a single chunk.
    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream> {
        let text = self.generate(prompt, params).await?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok::<String, Error>(text)
        })))
    }

    /// Lightweight liveness probe.
    ///
    /// Never errors; implementations bound it with an internal 5 s deadline
    /// and collapse any failure to `false`.
    async fn health_check(&self) -> bool;
}

// ============================================================================
// Retry helper
// ============================================================================

/// Run an attempt with exponential backoff on transient errors.
///
/// Retries only errors for which [`Error::is_retryable`] holds (rate limits
/// and timeouts), sleeping 1, 2, 4, ... seconds capped at 30 s, for at most
/// `max_retries` extra attempts. All other errors propagate immediately.
pub(crate) async fn call_with_retries<T, F, Fut>(
    provider: &str,
    max_retries: u32,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && tries < max_retries => {
                tries += 1;
                warn!(
                    provider,
                    attempt = tries,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "transient provider error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Byte-stream line splitting
// ============================================================================

/// Incremental splitter turning a byte stream into complete lines.
///
/// Both streaming wire protocols in this crate (SSE frames, NDJSON) are
/// line-delimited; partial lines are buffered until their terminator
/// arrives.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every newly completed line (without `\n`).
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_mask_api_key_long() {
        let masked = mask_api_key("sk-1234567890abcdefghij");
        assert_eq!(masked, "sk-1...ghij");
        assert!(!masked.contains("567890"));
    }

    #[test]
    fn test_mask_api_key_short() {
        assert_eq!(mask_api_key("short"), "****");
        assert_eq!(mask_api_key(""), "****");
    }

    #[test]
    fn test_config_defaults() {
        let config = ProviderConfig::new("p1");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert!(config.verify_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ProviderConfig::new("giga")
            .with_api_key("secret-key-12345")
            .with_base_url("https://example.test/api/v1")
            .with_timeout_secs(60)
            .with_max_retries(1)
            .with_verify_tls(false)
            .with_model("GigaChat-Pro")
            .with_scope("GIGACHAT_API_CORP")
            .with_tenant_id("folder-1");

        assert_eq!(config.name, "giga");
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.model.as_deref(), Some("GigaChat-Pro"));
        assert!(!config.verify_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_bad_ranges() {
        assert!(ProviderConfig::new("").validate().is_err());
        assert!(ProviderConfig::new("p").with_timeout_secs(0).validate().is_err());
        assert!(ProviderConfig::new("p").with_timeout_secs(301).validate().is_err());
        assert!(ProviderConfig::new("p").with_max_retries(11).validate().is_err());
    }

    #[test]
    fn test_config_debug_masks_api_key() {
        let config = ProviderConfig::new("p").with_api_key("super-secret-key-42");
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-key-42"));
        assert!(debug.contains("supe"));
    }

    #[test]
    fn test_params_defaults() {
        let params = GenerationParams::default();
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_tokens, 1000);
        assert_eq!(params.top_p, 1.0);
        assert!(params.stop.is_none());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        assert!(GenerationParams::new().with_temperature(2.5).validate().is_err());
        assert!(GenerationParams::new().with_max_tokens(0).validate().is_err());
        assert!(GenerationParams::new().with_top_p(1.5).validate().is_err());
        assert!(GenerationParams::new()
            .with_temperature(2.0)
            .with_top_p(0.0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_provider_kind_labels() {
        assert_eq!(ProviderKind::Mock.as_str(), "mock");
        assert_eq!(ProviderKind::GigaChat.as_str(), "gigachat");
        assert_eq!(ProviderKind::YandexGpt.as_str(), "yandexgpt");
        assert_eq!(ProviderKind::Ollama.as_str(), "ollama");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_absorb_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = call_with_retries("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::RateLimit("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_do_not_touch_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = call_with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Authentication("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_and_surface_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = call_with_retries("test", 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::RateLimit("busy".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::RateLimit(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_line_buffer_splits_and_buffers() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"partial").is_empty());
        let lines = buf.push(b" line\r\nsecond\nthird");
        assert_eq!(lines, vec!["partial line".to_string(), "second".to_string()]);
        let lines = buf.push(b"\n");
        assert_eq!(lines, vec!["third".to_string()]);
    }
}
