//! Client for the agent under test.
//!
//! Two request shapes are supported. Chatflow agents take a `query` plus named
//! inputs on `POST /chat-messages` and answer in `answer`. Workflow agents take
//! named inputs only on `POST /workflows/run` and answer with a nested
//! `data.outputs` object, which is serialized to text as the generated answer.

use crate::dataset::Row;
use crate::schema::{ParameterSchema, SchemaError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Agent call timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },

    #[error("Agent returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Agent response has no {field} field")]
    MissingAnswer { field: &'static str },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid agent configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid parameter schema: {0}")]
    Schema(#[from] SchemaError),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    Chatflow,
    Workflow,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentType::Chatflow => f.write_str("chatflow"),
            AgentType::Workflow => f.write_str("workflow"),
        }
    }
}

/// Connection parameters of the agent under test.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEndpoint {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub agent_type: AgentType,
}

fn default_user() -> String {
    "agent-bench".to_string()
}

impl AgentEndpoint {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            user: default_user(),
            agent_type,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl fmt::Debug for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("user", &self.user)
            .field("agent_type", &self.agent_type)
            .finish()
    }
}

/// One request to the agent per call.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Send one row and return the generated answer text.
    async fn invoke(&self, row: &Row) -> AgentResult<String>;

    /// Fetch the agent's declared input parameters.
    async fn fetch_parameters(&self) -> AgentResult<ParameterSchema>;
}

pub struct HttpAgentClient {
    client: reqwest::Client,
    endpoint: AgentEndpoint,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(endpoint: AgentEndpoint, timeout: Duration) -> AgentResult<Self> {
        if endpoint.base_url.trim().is_empty() {
            return Err(AgentError::InvalidConfig {
                message: "base_url cannot be empty".to_string(),
            });
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    fn request_body(&self, row: &Row) -> Value {
        match self.endpoint.agent_type {
            AgentType::Chatflow => json!({
                "inputs": row.inputs(),
                "query": row.query(),
                "response_mode": "blocking",
                "conversation_id": "",
                "user": self.endpoint.user,
            }),
            AgentType::Workflow => json!({
                "inputs": row.inputs(),
                "response_mode": "blocking",
                "user": self.endpoint.user,
            }),
        }
    }

    fn extract_answer(&self, body: &Value) -> AgentResult<String> {
        match self.endpoint.agent_type {
            AgentType::Chatflow => body
                .get("answer")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(AgentError::MissingAnswer { field: "answer" }),
            AgentType::Workflow => {
                let outputs = body
                    .pointer("/data/outputs")
                    .filter(|v| !v.is_null())
                    .ok_or(AgentError::MissingAnswer {
                        field: "data.outputs",
                    })?;
                Ok(serde_json::to_string(outputs)?)
            }
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout {
                seconds: self.timeout.as_secs_f64(),
            }
        } else {
            AgentError::Network(err)
        }
    }

    async fn read_json(&self, response: reqwest::Response) -> AgentResult<Value> {
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;
        if !status.is_success() {
            error!(status = %status, "Agent request rejected");
            return Err(AgentError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentClient {
    async fn invoke(&self, row: &Row) -> AgentResult<String> {
        let path = match self.endpoint.agent_type {
            AgentType::Chatflow => "chat-messages",
            AgentType::Workflow => "workflows/run",
        };
        let url = self.endpoint.url(path);
        debug!(url = %url, agent_type = %self.endpoint.agent_type, "Invoking agent");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.endpoint.api_key)
            .json(&self.request_body(row))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body = self.read_json(response).await?;
        self.extract_answer(&body)
    }

    async fn fetch_parameters(&self) -> AgentResult<ParameterSchema> {
        let url = self.endpoint.url("parameters");
        debug!(url = %url, "Fetching agent parameters");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.endpoint.api_key)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body = self.read_json(response).await?;
        Ok(ParameterSchema::from_response(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server, agent_type: AgentType) -> HttpAgentClient {
        let endpoint = AgentEndpoint::new(format!("{}/v1/", server.url()), "app-key", agent_type)
            .with_user("tester");
        HttpAgentClient::new(endpoint, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_chatflow_invocation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat-messages")
            .match_header("authorization", "Bearer app-key")
            .match_body(Matcher::PartialJson(json!({
                "inputs": {"city": "Paris"},
                "query": "weather?",
                "response_mode": "blocking",
                "conversation_id": "",
                "user": "tester"
            })))
            .with_status(200)
            .with_body(r#"{"answer": "Sunny", "conversation_id": "c1"}"#)
            .create_async()
            .await;

        let row = Row::new()
            .with_field("city", "Paris")
            .with_field("query", "weather?")
            .with_field("reference_answer", "Sunny and warm");
        let answer = client(&server, AgentType::Chatflow).invoke(&row).await.unwrap();
        assert_eq!(answer, "Sunny");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_workflow_invocation_serializes_outputs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/workflows/run")
            .with_status(200)
            .with_body(r#"{"workflow_run_id": "w1", "data": {"status": "succeeded", "outputs": {"text": "done"}}}"#)
            .create_async()
            .await;

        let answer = client(&server, AgentType::Workflow)
            .invoke(&Row::new().with_field("topic", "x"))
            .await
            .unwrap();
        assert_eq!(answer, r#"{"text":"done"}"#);
    }

    #[tokio::test]
    async fn test_invocation_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat-messages")
            .with_status(400)
            .with_body(r#"{"code": "invalid_param"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v1/workflows/run")
            .with_status(200)
            .with_body(r#"{"data": {"status": "failed"}}"#)
            .create_async()
            .await;

        let err = client(&server, AgentType::Chatflow)
            .invoke(&Row::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Http { status: 400, .. }));

        let err = client(&server, AgentType::Workflow)
            .invoke(&Row::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::MissingAnswer {
                field: "data.outputs"
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_parameters() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/parameters")
            .match_header("authorization", "Bearer app-key")
            .with_status(200)
            .with_body(
                r#"{"user_input_form": [{"number": {"variable": "days", "label": "Days", "required": true}}]}"#,
            )
            .create_async()
            .await;

        let schema = client(&server, AgentType::Chatflow)
            .fetch_parameters()
            .await
            .unwrap();
        assert_eq!(schema.parameters.len(), 1);
        assert!(schema.parameters[0].required);
    }

    #[test]
    fn test_endpoint_debug_redacts_key() {
        let endpoint = AgentEndpoint::new("http://localhost/v1", "app-secret", AgentType::Workflow);
        assert!(!format!("{:?}", endpoint).contains("app-secret"));
        assert_eq!(endpoint.url("parameters"), "http://localhost/v1/parameters");
    }
}
