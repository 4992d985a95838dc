//! GigaChat (Sber) provider
//!
//! Authentication exchanges a long-lived authorization key for a short-lived
//! access token (about 30 minutes) via the OAuth2 endpoint. The cached token
//! is guarded by an async lock, so concurrent requests coalesce onto a
//! single refresh. A 401 during a chat request invalidates the cache,
//! refreshes exactly once, and re-issues the request with a fresh
//! correlation id; a second 401 is an authentication failure.

use crate::error::{Error, Result};
use crate::provider::{
    call_with_retries, GenerationParams, LineBuffer, LlmProvider, ProviderConfig, ProviderInfo,
    ProviderKind, TextStream,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// OAuth2 token endpoint
pub const OAUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";

/// Default OAuth2 scope (personal tier)
pub const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";

/// Default model
pub const DEFAULT_MODEL: &str = "GigaChat";

/// Known GigaChat models
pub const MODELS: &[&str] = &["GigaChat", "GigaChat-Plus", "GigaChat-Pro"];

/// Tokens this close to expiry are treated as expired
const TOKEN_EXPIRY_BUFFER_MS: i64 = 60_000;

/// Ceiling on the health probe, regardless of the configured timeout
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Expiry timestamp in milliseconds since the Unix epoch
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ============================================================================
// Token cache
// ============================================================================

#[derive(Debug, Clone)]
struct CachedToken {
    secret: String,
    expires_at_ms: i64,
}

impl CachedToken {
    fn is_valid(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms - TOKEN_EXPIRY_BUFFER_MS
    }
}

// ============================================================================
// Provider
// ============================================================================

/// GigaChat provider with OAuth2 token management.
#[derive(Debug)]
pub struct GigaChatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    oauth_url: String,
    /// Single-flight guard: holding the lock across the refresh means
    /// concurrent callers wait for the in-flight refresh instead of
    /// launching their own.
    token: Mutex<Option<CachedToken>>,
}

impl GigaChatProvider {
    /// Create a provider. `config.api_key` (the authorization key) is
    /// required; `verify_tls = false` accepts the Sber trust anchors
    /// without a local CA bundle.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        if config.api_key.is_none() {
            return Err(Error::InvalidRequest(
                "api_key is required for GigaChatProvider".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::Provider(format!("http client error: {e}")))?;

        Ok(Self {
            config,
            client,
            oauth_url: OAUTH_URL.to_string(),
            token: Mutex::new(None),
        })
    }

    /// Override the OAuth2 endpoint (corporate proxies, test stands).
    #[must_use]
    pub fn with_oauth_url(mut self, url: impl Into<String>) -> Self {
        self.oauth_url = url.into();
        self
    }

    fn model(&self) -> &str {
        self.config.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn scope(&self) -> &str {
        self.config.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    fn chat_url(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{base}/chat/completions")
    }

    fn authorization_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    /// Return a valid access token, refreshing through the single-flight
    /// lock when the cached one is missing or about to expire.
    async fn ensure_access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Some(cached) = guard.as_ref() {
            if cached.is_valid(now_ms) {
                return Ok(cached.secret.clone());
            }
        }

        debug!(provider = %self.config.name, "fetching new OAuth2 token");
        let token = self.fetch_token().await?;
        let secret = token.secret.clone();
        *guard = Some(token);
        Ok(secret)
    }

    /// Drop the cached token so the next request refreshes.
    async fn invalidate_token(&self) {
        let mut guard = self.token.lock().await;
        *guard = None;
    }

    /// Exchange the authorization key for an access token.
    async fn fetch_token(&self) -> Result<CachedToken> {
        let response = self
            .client
            .post(&self.oauth_url)
            .header("Authorization", format!("Bearer {}", self.authorization_key()))
            .header("RqUID", Uuid::new_v4().to_string())
            .form(&[("scope", self.scope())])
            .send()
            .await
            .map_err(|e| map_transport_error("OAuth2 token request", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication("invalid authorization key".into()));
        }
        if !status.is_success() {
            return Err(Error::Provider(format!(
                "OAuth2 token request failed (HTTP {status})"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid OAuth2 token response: {e}")))?;

        debug!(
            provider = %self.config.name,
            expires_at_ms = token.expires_at,
            "OAuth2 token refreshed"
        );
        Ok(CachedToken {
            secret: token.access_token,
            expires_at_ms: token.expires_at,
        })
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model().to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop.clone(),
            stream,
        }
    }

    /// Send a chat request with token-expiry recovery: on 401 the cached
    /// token is invalidated, refreshed exactly once, and the request is
    /// re-issued with fresh credentials and a new correlation id. A second
    /// 401 surfaces as an authentication failure.
    async fn send_chat(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let token = self.ensure_access_token().await?;
        let response = self
            .client
            .post(self.chat_url())
            .header("Authorization", format!("Bearer {token}"))
            .header("RqUID", Uuid::new_v4().to_string())
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error("GigaChat API request", e))?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(
            provider = %self.config.name,
            "token rejected during request, refreshing and retrying"
        );
        self.invalidate_token().await;
        let token = self.ensure_access_token().await?;
        let response = self
            .client
            .post(self.chat_url())
            .header("Authorization", format!("Bearer {token}"))
            .header("RqUID", Uuid::new_v4().to_string())
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error("GigaChat API request", e))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(
                "authentication failed after token refresh".into(),
            ));
        }
        Ok(response)
    }

    async fn generate_once(&self, body: &ChatRequest) -> Result<String> {
        let response = self.send_chat(body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid response format: {e}")))?;
        data.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::Provider("response contained no choices".into()))
    }
}

#[async_trait::async_trait]
impl LlmProvider for GigaChatProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.config.name.clone(),
            model: self.model().to_string(),
            kind: ProviderKind::GigaChat,
        }
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| (*m).to_string()).collect()
    }

    #[instrument(skip(self, prompt, params), fields(provider = %self.config.name))]
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let body = self.build_request(prompt, params, false);
        call_with_retries(&self.config.name, self.config.max_retries, || {
            self.generate_once(&body)
        })
        .await
    }

    #[instrument(skip(self, prompt, params), fields(provider = %self.config.name))]
    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream> {
        let body = self.build_request(prompt, params, true);
        let response = self.send_chat(&body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }

        Ok(sse_text_stream(response.bytes_stream()))
    }

    async fn health_check(&self) -> bool {
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.ensure_access_token()).await {
            Ok(Ok(_)) => {
                debug!(provider = %self.config.name, "health check passed");
                true
            }
            Ok(Err(err)) => {
                warn!(provider = %self.config.name, error = %err, "health check failed");
                false
            }
            Err(_) => {
                warn!(provider = %self.config.name, "health check timed out");
                false
            }
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn map_transport_error(operation: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{operation} timed out"))
    } else if err.is_connect() {
        Error::Provider(format!("{operation} connection error: {err}"))
    } else {
        Error::Provider(format!("{operation} network error: {err}"))
    }
}

fn map_status_error(status: reqwest::StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.to_string()
            }
        });

    match status.as_u16() {
        400 => Error::InvalidRequest(format!("bad request: {message}")),
        401 => Error::Authentication(format!("authentication failed: {message}")),
        404 => Error::InvalidRequest(format!("invalid model or endpoint: {message}")),
        422 => Error::InvalidRequest(format!("validation error: {message}")),
        429 => Error::RateLimit(format!("rate limit exceeded: {message}")),
        500.. => Error::Provider(format!("server error: {message}")),
        _ => Error::Provider(format!("unexpected error (HTTP {status}): {message}")),
    }
}

// ============================================================================
// SSE parsing
// ============================================================================

struct SseState<S> {
    bytes: std::pin::Pin<Box<S>>,
    lines: LineBuffer,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn an SSE byte stream of `data: <json>` frames into text chunks.
fn sse_text_stream<S>(bytes: S) -> TextStream
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        lines: LineBuffer::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.done {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(buf)) => {
                    for line in st.lines.push(&buf) {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if payload == "[DONE]" {
                            st.done = true;
                            break;
                        }
                        match serde_json::from_str::<StreamChunk>(payload) {
                            Ok(frame) => {
                                let text = frame
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|c| c.delta.content)
                                    .unwrap_or_default();
                                if !text.is_empty() {
                                    st.pending.push_back(text);
                                }
                            }
                            Err(err) => {
                                st.done = true;
                                return Some((
                                    Err(Error::Provider(format!("invalid stream frame: {err}"))),
                                    st,
                                ));
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(map_transport_error("GigaChat stream", err)), st));
                }
                None => {
                    st.done = true;
                }
            }
        }
    }))
}
