//! Ollama local inference provider
//!
//! Stateless HTTP client for a loopback Ollama server. No credentials; the
//! health probe lists the installed models via `/api/tags`. Streaming uses
//! Ollama's newline-delimited JSON protocol.

use crate::error::{Error, Result};
use crate::provider::{
    call_with_retries, GenerationParams, LineBuffer, LlmProvider, ProviderConfig, ProviderInfo,
    ProviderKind, TextStream,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default Ollama API URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Default model
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Models commonly present on an installation (the live list comes from
/// `/api/tags`)
pub const SUGGESTED_MODELS: &[&str] = &["llama3.2", "llama3.1", "mistral", "codellama", "qwen2.5"];

/// Ceiling on the health probe
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

// ============================================================================
// Provider
// ============================================================================

/// Local Ollama provider.
pub struct OllamaProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    /// Cached list of installed models
    cached_models: RwLock<Vec<String>>,
}

impl OllamaProvider {
    /// Create a provider. No credentials are needed for a local server.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Provider(format!("http client error: {e}")))?;

        Ok(Self {
            config,
            client,
            cached_models: RwLock::new(Vec::new()),
        })
    }

    fn model(&self) -> &str {
        self.config.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// List installed models from the server, refreshing the cache.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "Ollama returned status {}",
                response.status()
            )));
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid tags response: {e}")))?;
        let models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();

        if let Ok(mut cache) = self.cached_models.write() {
            *cache = models.clone();
        }
        Ok(models)
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams, stream: bool) -> OllamaChatRequest {
        // stop sequences are not forwarded; num_predict carries the token cap.
        OllamaChatRequest {
            model: self.model().to_string(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
                top_p: params.top_p,
            },
            stream,
        }
    }

    async fn send_chat(&self, body: &OllamaChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url());
        debug!(model = %body.model, "sending request to Ollama");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }
        Ok(response)
    }

    async fn generate_once(&self, body: &OllamaChatRequest) -> Result<String> {
        let response = self.send_chat(body).await?;
        let data: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid response format: {e}")))?;
        Ok(data.message.content)
    }
}

#[async_trait::async_trait]
impl LlmProvider for OllamaProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.config.name.clone(),
            model: self.model().to_string(),
            kind: ProviderKind::Ollama,
        }
    }

    fn models(&self) -> Vec<String> {
        if let Ok(cache) = self.cached_models.read() {
            if !cache.is_empty() {
                return cache.clone();
            }
        }
        SUGGESTED_MODELS.iter().map(|m| (*m).to_string()).collect()
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
        Ok(ndjson_text_stream(response.bytes_stream()))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url());
        let probe = self.client.get(&url).send();
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await {
            Ok(Ok(response)) => response.status().is_success(),
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

fn map_transport_error(err: reqwest::Error) -> Error {
    if err.is_connect() {
        Error::Provider(format!("failed to connect to Ollama: {err}"))
    } else if err.is_timeout() {
        Error::Timeout("request to Ollama timed out".into())
    } else {
        Error::Provider(format!("network error to Ollama: {err}"))
    }
}

fn map_status_error(status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        // Unknown model: Ollama answers 404 until the model is pulled.
        404 => Error::InvalidRequest(format!(
            "model not available, pull it first with `ollama pull`: {body}"
        )),
        500.. => Error::Provider(format!("Ollama server error (HTTP {status}): {body}")),
        _ => Error::Provider(format!("Ollama error (HTTP {status}): {body}")),
    }
}

// ============================================================================
// NDJSON parsing
// ============================================================================

struct NdjsonState<S> {
    bytes: std::pin::Pin<Box<S>>,
    lines: LineBuffer,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn Ollama's line-delimited JSON body into text chunks.
fn ndjson_text_stream<S>(bytes: S) -> TextStream
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
{
    let state = NdjsonState {
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
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<OllamaStreamChunk>(&line) {
                            Ok(frame) => {
                                if let Some(message) = frame.message {
                                    if !message.content.is_empty() {
                                        st.pending.push_back(message.content);
                                    }
                                }
                                if frame.done {
                                    st.done = true;
                                    break;
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
                    return Some((Err(map_transport_error(err)), st));
                }
                None => {
                    st.done = true;
                }
            }
        }
    }))
}
