//! Mock provider for tests and demos
//!
//! A purely local provider whose `model` field selects a simulation mode:
//! normal response, timeout, rate limit, authentication failure, or invalid
//! request. Models containing `unhealthy` fail the health probe.

use crate::error::{Error, Result};
use crate::provider::{GenerationParams, LlmProvider, ProviderConfig, ProviderInfo, ProviderKind, TextStream};
use std::time::Duration;
use tracing::debug;

/// Default simulation mode
pub const DEFAULT_MODEL: &str = "mock-normal";

/// Simulated response delay in normal mode
const RESPONSE_DELAY: Duration = Duration::from_millis(100);

/// Simulation behaviors encoded in the model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockMode {
    Normal,
    Timeout,
    RateLimit,
    AuthError,
    InvalidRequest,
}

impl MockMode {
    fn from_model(model: &str) -> Self {
        if model.contains("mock-timeout") {
            Self::Timeout
        } else if model.contains("mock-ratelimit") {
            Self::RateLimit
        } else if model.contains("mock-auth-error") {
            Self::AuthError
        } else if model.contains("mock-invalid-request") {
            Self::InvalidRequest
        } else {
            Self::Normal
        }
    }
}

/// Local simulation provider.
pub struct MockProvider {
    config: ProviderConfig,
    mode: MockMode,
}

impl MockProvider {
    /// Create a mock provider; the mode comes from `config.model`.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        let mode = MockMode::from_model(config.model.as_deref().unwrap_or(DEFAULT_MODEL));
        Self { config, mode }
    }

    fn model(&self) -> &str {
        self.config.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Build the (possibly truncated) normal-mode response.
    fn response_for(&self, prompt: &str, params: &GenerationParams) -> String {
        let response = format!("Mock response to: {prompt}");
        response.chars().take(params.max_tokens as usize).collect()
    }

    /// Return the simulated failure for non-normal modes.
    fn simulated_failure(&self) -> Option<Error> {
        match self.mode {
            MockMode::Normal => None,
            MockMode::Timeout => Some(Error::Timeout("Mock timeout simulation".into())),
            MockMode::RateLimit => Some(Error::RateLimit("Mock rate limit simulation".into())),
            MockMode::AuthError => {
                Some(Error::Authentication("Mock authentication failure".into()))
            }
            MockMode::InvalidRequest => {
                Some(Error::InvalidRequest("Mock invalid request".into()))
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.config.name.clone(),
            model: self.model().to_string(),
            kind: ProviderKind::Mock,
        }
    }

    fn models(&self) -> Vec<String> {
        vec![
            "mock-normal".to_string(),
            "mock-timeout".to_string(),
            "mock-ratelimit".to_string(),
            "mock-auth-error".to_string(),
            "mock-invalid-request".to_string(),
        ]
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        if let Some(err) = self.simulated_failure() {
            return Err(err);
        }
        tokio::time::sleep(RESPONSE_DELAY).await;
        debug!(provider = %self.config.name, "mock response generated");
        Ok(self.response_for(prompt, params))
    }

    async fn generate_stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream> {
        if let Some(err) = self.simulated_failure() {
            return Err(err);
        }
        tokio::time::sleep(RESPONSE_DELAY).await;

        // Word-by-word chunks whose concatenation equals the unary response.
        let response = self.response_for(prompt, params);
        let chunks: Vec<Result<String>> = response
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn health_check(&self) -> bool {
        !self.model().to_lowercase().contains("unhealthy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn provider(model: &str) -> MockProvider {
        MockProvider::new(ProviderConfig::new("test").with_model(model))
    }

    #[tokio::test]
    async fn test_normal_mode_returns_response() {
        let response = provider("mock-normal")
            .generate("Hello, world!", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(response, "Mock response to: Hello, world!");
    }

    #[tokio::test]
    async fn test_default_mode_is_normal() {
        let provider = MockProvider::new(ProviderConfig::new("test"));
        let response = provider
            .generate("Hi", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(response, "Mock response to: Hi");
        assert!(provider.health_check().await);
    }

    #[tokio::test]
    async fn test_max_tokens_truncates_characters() {
        let params = GenerationParams::default().with_max_tokens(10);
        let response = provider("mock-normal")
            .generate("Hello, world!", &params)
            .await
            .unwrap();
        assert_eq!(response.chars().count(), 10);
        assert_eq!(response, "Mock respo");
    }

    #[tokio::test]
    async fn test_timeout_mode() {
        let err = provider("mock-timeout")
            .generate("test prompt", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.to_string().contains("Mock timeout simulation"));
    }

    #[tokio::test]
    async fn test_ratelimit_mode() {
        let err = provider("mock-ratelimit")
            .generate("test prompt", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimit(_)));
    }

    #[tokio::test]
    async fn test_auth_error_mode() {
        let err = provider("mock-auth-error")
            .generate("test prompt", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_invalid_request_mode() {
        let err = provider("mock-invalid-request")
            .generate("test prompt", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(provider("mock-normal").health_check().await);
        // Error modes are still "up"; they fail on generate only.
        assert!(provider("mock-timeout").health_check().await);
        assert!(!provider("mock-normal-unhealthy").health_check().await);
        assert!(!provider("unhealthy").health_check().await);
    }

    #[tokio::test]
    async fn test_health_check_marker_is_case_insensitive() {
        assert!(!provider("mock-UNHEALTHY").health_check().await);
        assert!(!provider("mock-Unhealthy").health_check().await);
    }

    #[tokio::test]
    async fn test_stream_concatenates_to_unary_response() {
        let p = provider("mock-normal");
        let params = GenerationParams::default();
        let expected = p.generate("Hello, world!", &params).await.unwrap();

        let mut stream = p.generate_stream("Hello, world!", &params).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), expected);
    }

    #[tokio::test]
    async fn test_stream_respects_max_tokens() {
        let p = provider("mock-normal");
        let params = GenerationParams::default().with_max_tokens(10);
        let expected = p.generate("Hello, world!", &params).await.unwrap();

        let mut stream = p.generate_stream("Hello, world!", &params).await.unwrap();
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap());
        }
        assert_eq!(collected, expected);
        assert_eq!(collected.chars().count(), 10);
    }

    #[tokio::test]
    async fn test_stream_error_modes_fail_before_first_chunk() {
        let err = provider("mock-timeout")
            .generate_stream("test", &GenerationParams::default())
            .await
            .err()
            .expect("stream creation should fail");
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_describe() {
        let info = provider("mock-ratelimit").describe();
        assert_eq!(info.name, "test");
        assert_eq!(info.model, "mock-ratelimit");
        assert_eq!(info.kind, ProviderKind::Mock);
    }
}
