//! Provider adapters for judge models, keyed by [`ProviderFamily`].
//!
//! Every family exposes the same two operations: a connectivity probe (a minimal
//! chat round trip) and a scoring call that sends the judge prompt together with
//! the generated and reference texts. The registry is resolved once when the
//! dispatcher binds a candidate; nothing downstream matches on provider names.

use crate::config::{normalize_endpoint, ModelSettings, ProviderFamily};
use crate::judge::JudgeConfig;
use crate::openai::OpenAiCompatibleProvider;
use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{ChatMessage, ChatRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Fixed chat completions endpoint of Volcengine Ark.
pub const ARK_CHAT_COMPLETIONS_URL: &str =
    "https://ark.cn-beijing.volces.com/api/v3/chat/completions";

/// Reply budget of a connectivity probe; only the round trip matters.
const PROBE_MAX_TOKENS: u32 = 16;

/// Probe and scoring operations of one provider family.
#[async_trait]
pub trait JudgeAdapter: Send + Sync {
    /// Minimal round trip; `Ok` means the candidate is usable.
    async fn probe(&self, settings: &ModelSettings) -> ModelResult<()>;

    /// Ask the judge to grade `generated` against `reference`; returns the raw judge text.
    async fn score(
        &self,
        settings: &ModelSettings,
        generated: &str,
        reference: &str,
        prompt: &str,
    ) -> ModelResult<String>;
}

/// Endpoint, key and model a request should go to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTarget {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

/// Adapter for the families that all speak OpenAI-style chat completions and
/// only differ in how the target is resolved from the settings bag.
pub struct ChatCompletionsAdapter {
    family: ProviderFamily,
    config: JudgeConfig,
    ark_endpoint: String,
}

impl ChatCompletionsAdapter {
    pub fn new(family: ProviderFamily, config: JudgeConfig) -> Self {
        Self {
            family,
            config,
            ark_endpoint: ARK_CHAT_COMPLETIONS_URL.to_string(),
        }
    }

    /// Override the fixed Ark endpoint (private deployments, tests).
    pub fn with_ark_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ark_endpoint = endpoint.into();
        self
    }

    pub fn family(&self) -> ProviderFamily {
        self.family
    }

    pub fn resolve_target(&self, settings: &ModelSettings) -> ModelResult<ChatTarget> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.trim().is_empty())
        }

        match self.family {
            ProviderFamily::Ark => {
                let api_key = present(&settings.api_key);
                let model = present(&settings.model_name).or_else(|| present(&settings.endpoint_id));
                match (api_key, model) {
                    (Some(api_key), Some(model)) => Ok(ChatTarget {
                        endpoint: self.ark_endpoint.clone(),
                        api_key: api_key.to_string(),
                        model: model.to_string(),
                    }),
                    _ => Err(ModelError::InvalidConfig {
                        message: "ark settings need apiKey and a model id".to_string(),
                    }),
                }
            }
            ProviderFamily::OpenaiCompatible | ProviderFamily::Dashscope => {
                match (
                    present(&settings.endpoint_id),
                    present(&settings.api_key),
                    present(&settings.model_name),
                ) {
                    (Some(endpoint), Some(api_key), Some(model)) => Ok(ChatTarget {
                        endpoint: normalize_endpoint(endpoint),
                        api_key: api_key.to_string(),
                        model: model.to_string(),
                    }),
                    _ => Err(ModelError::InvalidConfig {
                        message: format!(
                            "{} settings need endpointId, apiKey and apiEndpointModelName",
                            self.family
                        ),
                    }),
                }
            }
        }
    }

    fn probe_system_prompt(&self) -> &'static str {
        match self.family {
            ProviderFamily::OpenaiCompatible => "You are an AI assistant.",
            ProviderFamily::Dashscope => "You are a helpful assistant.",
            ProviderFamily::Ark => "You are a Doubao assistant.",
        }
    }

    fn provider(&self, target: &ChatTarget) -> ModelResult<OpenAiCompatibleProvider> {
        OpenAiCompatibleProvider::new(
            target.endpoint.clone(),
            target.api_key.clone(),
            target.model.clone(),
            self.config.default_timeout,
        )
    }
}

#[async_trait]
impl JudgeAdapter for ChatCompletionsAdapter {
    async fn probe(&self, settings: &ModelSettings) -> ModelResult<()> {
        let target = self.resolve_target(settings)?;
        let provider = self.provider(&target)?;
        let request = ChatRequest::new(
            target.model.clone(),
            vec![
                ChatMessage::system(self.probe_system_prompt()),
                ChatMessage::user("Hello"),
            ],
        )
        .with_max_tokens(PROBE_MAX_TOKENS);
        provider.chat(request).await?;
        if self.config.verbose_logging {
            debug!(family = %self.family, model = %target.model, "Probe succeeded");
        }
        Ok(())
    }

    async fn score(
        &self,
        settings: &ModelSettings,
        generated: &str,
        reference: &str,
        prompt: &str,
    ) -> ModelResult<String> {
        let target = self.resolve_target(settings)?;
        let provider = self.provider(&target)?;
        let request = ChatRequest::new(
            target.model.clone(),
            vec![
                ChatMessage::system(prompt),
                ChatMessage::user(format!("Generated text: {}", generated)),
                ChatMessage::user(format!("Reference text: {}", reference)),
            ],
        )
        .with_temperature(0.0);
        let response = provider.chat(request).await?;
        let content = response
            .first_content()
            .ok_or_else(|| ModelError::EmptyResponse {
                provider: self.family.to_string(),
            })?;
        if self.config.verbose_logging {
            debug!(family = %self.family, model = %target.model, reply = %content, "Judge replied");
        }
        Ok(content.to_string())
    }
}

/// `ProviderFamily → adapter` table.
pub struct ProviderRegistry {
    adapters: HashMap<ProviderFamily, Arc<dyn JudgeAdapter>>,
}

impl ProviderRegistry {
    /// An empty registry; every family must be registered explicitly.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// A registry with the chat completions adapter installed for every family.
    pub fn with_defaults(config: JudgeConfig) -> Self {
        let mut registry = Self::new();
        for family in ProviderFamily::ALL {
            registry.register(
                family,
                Arc::new(ChatCompletionsAdapter::new(family, config.clone())),
            );
        }
        registry
    }

    pub fn register(&mut self, family: ProviderFamily, adapter: Arc<dyn JudgeAdapter>) {
        self.adapters.insert(family, adapter);
    }

    pub fn get(&self, family: ProviderFamily) -> Option<Arc<dyn JudgeAdapter>> {
        self.adapters.get(&family).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults(JudgeConfig::default())
    }
}
