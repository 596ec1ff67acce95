use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error};

/// Client for a single OpenAI-compatible chat completions endpoint.
///
/// `endpoint` is the full URL of the completions resource, not a base URL.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> ModelResult<Self> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(ModelError::InvalidConfig {
                message: "Endpoint cannot be empty".to_string(),
            });
        }
        if timeout.is_zero() {
            return Err(ModelError::InvalidConfig {
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Unknown {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn handle_http_error(err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::ServiceUnavailable {
                message: "Request timeout".to_string(),
            }
        } else if err.is_connect() {
            ModelError::ServiceUnavailable {
                message: "Cannot connect to model endpoint".to_string(),
            }
        } else {
            ModelError::Network(err)
        }
    }

    fn status_error(status: reqwest::StatusCode, body: String) -> ModelError {
        match status.as_u16() {
            401 | 403 => ModelError::Authentication,
            429 => ModelError::RateLimit,
            503 => ModelError::ServiceUnavailable {
                message: format!("Endpoint unavailable: {}", body),
            },
            code => ModelError::Http { status: code, body },
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn chat(&self, mut request: ChatRequest) -> ModelResult<ChatResponse> {
        if request.model.is_empty() {
            request.model = self.model.clone();
        }
        debug!(endpoint = %self.endpoint, model = %request.model, "Sending chat completion");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(Self::handle_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(endpoint = %self.endpoint, status = %status, "Chat completion rejected");
            return Err(Self::status_error(status, body));
        }

        let body = response.text().await.map_err(Self::handle_http_error)?;
        let parsed: ChatResponse = serde_json::from_str(&body)?;
        Ok(parsed)
    }
}
