use crate::types::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Authentication,

    #[error("Empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

pub type ModelResult<T> = Result<T, ModelError>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Choice, FinishReason, MessageRole};

    struct MockProvider;

    #[async_trait]
    impl ModelProvider for MockProvider {
        async fn chat(&self, _request: ChatRequest) -> ModelResult<ChatResponse> {
            Ok(ChatResponse {
                choices: vec![Choice {
                    message: ChatMessage::assistant("Mock response"),
                    finish_reason: Some(FinishReason::Stop),
                }],
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn test_mock_provider() {
        let provider = MockProvider;

        let request = ChatRequest::new("mock-model", vec![ChatMessage::user("Hello")]);

        let response = provider.chat(request).await.unwrap();
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].message.role, MessageRole::Assistant);
    }

    #[test]
    fn test_error_messages() {
        let err = ModelError::Http {
            status: 503,
            body: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "Provider returned HTTP 503: busy");

        let err = ModelError::EmptyResponse {
            provider: "ark".to_string(),
        };
        assert_eq!(err.to_string(), "Empty response from ark");
    }
}
