//! YandexGPT foundation-models provider
//!
//! Stateless client for the Yandex Cloud completion API. Authentication is
//! an IAM token plus a folder id; models are addressed by `gpt://` URI.
//! The API has no streaming endpoint here, so streaming falls back to a
//! single chunk.

use crate::error::{Error, Result};
use crate::provider::{
    call_with_retries, GenerationParams, LlmProvider, ProviderConfig, ProviderInfo, ProviderKind,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default completion endpoint
pub const DEFAULT_BASE_URL: &str = "https://llm.api.cloud.yandex.net/foundationModels/v1";

/// Default model
pub const DEFAULT_MODEL: &str = "yandexgpt/latest";

/// Known YandexGPT models
pub const MODELS: &[&str] = &["yandexgpt/latest", "yandexgpt-lite/latest"];

/// Ceiling on the health probe
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest {
    model_uri: String,
    completion_options: CompletionOptions,
    messages: Vec<YandexMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct YandexMessage {
    role: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    result: CompletionResult,
}

#[derive(Debug, Deserialize)]
struct CompletionResult {
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    message: AlternativeMessage,
}

#[derive(Debug, Deserialize)]
struct AlternativeMessage {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ============================================================================
// Provider
// ============================================================================

/// YandexGPT provider.
#[derive(Debug)]
pub struct YandexGptProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl YandexGptProvider {
    /// Create a provider. Both `api_key` (IAM token) and `tenant_id`
    /// (cloud folder id) are required.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        if config.api_key.is_none() {
            return Err(Error::InvalidRequest(
                "api_key is required for YandexGptProvider".into(),
            ));
        }
        if config.tenant_id.is_none() {
            return Err(Error::InvalidRequest(
                "tenant_id (folder id) is required for YandexGptProvider".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::Provider(format!("http client error: {e}")))?;

        Ok(Self { config, client })
    }

    fn model(&self) -> &str {
        self.config.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn folder_id(&self) -> &str {
        self.config.tenant_id.as_deref().unwrap_or_default()
    }

    fn completion_url(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{base}/completion")
    }

    /// Full model URI: values already carrying a scheme are used verbatim,
    /// otherwise the model is resolved inside the configured folder.
    fn model_uri(&self) -> String {
        let model = self.model();
        if model.contains("://") {
            model.to_string()
        } else {
            format!("gpt://{}/{}", self.folder_id(), model)
        }
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams) -> CompletionRequest {
        // top_p and stop sequences are not part of this API and are ignored.
        CompletionRequest {
            model_uri: self.model_uri(),
            completion_options: CompletionOptions {
                stream: false,
                temperature: params.temperature,
                max_tokens: params.max_tokens,
            },
            messages: vec![YandexMessage {
                role: "user".to_string(),
                text: prompt.to_string(),
            }],
        }
    }

    async fn generate_once(&self, body: &CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(self.completion_url())
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.as_deref().unwrap_or_default()),
            )
            .header("x-folder-id", self.folder_id())
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }

        let data: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid response format: {e}")))?;
        data.result
            .alternatives
            .into_iter()
            .next()
            .map(|alt| alt.message.text)
            .ok_or_else(|| Error::Provider("response contained no alternatives".into()))
    }
}

#[async_trait::async_trait]
impl LlmProvider for YandexGptProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.config.name.clone(),
            model: self.model().to_string(),
            kind: ProviderKind::YandexGpt,
        }
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| (*m).to_string()).collect()
    }

    #[instrument(skip(self, prompt, params), fields(provider = %self.config.name))]
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let body = self.build_request(prompt, params);
        debug!(model_uri = %body.model_uri, "sending completion request");
        call_with_retries(&self.config.name, self.config.max_retries, || {
            self.generate_once(&body)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        // A one-token completion doubles as the cheapest availability probe.
        let body = self.build_request("ping", &GenerationParams::default().with_max_tokens(1));
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.generate_once(&body)).await {
            Ok(Ok(_)) => true,
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
    if err.is_timeout() {
        Error::Timeout("request to YandexGPT API timed out".into())
    } else if err.is_connect() {
        Error::Provider(format!("connection error to YandexGPT API: {err}"))
    } else {
        Error::Provider(format!("network error to YandexGPT API: {err}"))
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
        401 | 403 => Error::Authentication(message),
        404 => Error::InvalidRequest(message),
        422 => Error::InvalidRequest(format!("validation error: {message}")),
        429 => Error::RateLimit(message),
        500.. => Error::Provider(format!("server error: {message}")),
        _ => Error::Provider(format!("unexpected error (HTTP {status}): {message}")),
    }
}
