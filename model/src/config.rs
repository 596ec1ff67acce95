use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider families a judge candidate can belong to.
///
/// Each family maps to exactly one adapter in the
/// [`ProviderRegistry`](crate::registry::ProviderRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderFamily {
    /// Any endpoint speaking the OpenAI chat completions protocol
    OpenaiCompatible,
    /// Alibaba Cloud Bailian / DashScope compatible mode
    Dashscope,
    /// Volcengine Ark (Doubao)
    Ark,
}

impl ProviderFamily {
    pub const ALL: [ProviderFamily; 3] = [
        ProviderFamily::OpenaiCompatible,
        ProviderFamily::Dashscope,
        ProviderFamily::Ark,
    ];

    /// Classify a free-text provider name (and optionally its endpoint) into a family.
    ///
    /// Used once per candidate for records that carry no explicit family tag.
    pub fn classify(provider_name: &str, endpoint: Option<&str>) -> Option<Self> {
        let name = provider_name.to_lowercase();
        if name.contains("aliyun") || name.contains("bailian") || name.contains("dashscope") {
            Some(ProviderFamily::Dashscope)
        } else if name.contains("openai") {
            Some(ProviderFamily::OpenaiCompatible)
        } else if name.contains("volcengine")
            || name.contains("doubao")
            || endpoint.is_some_and(|e| e.contains("ark.cn-beijing"))
        {
            Some(ProviderFamily::Ark)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenaiCompatible => "openai-compatible",
            ProviderFamily::Dashscope => "dashscope",
            ProviderFamily::Ark => "ark",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque connection settings of a judge candidate.
///
/// Field names follow the provider-model records this is usually read from.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    #[serde(rename = "endpointId", default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(
        rename = "apiEndpointModelName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub model_name: Option<String>,
}

impl ModelSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_id = Some(endpoint.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }
}

impl fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("endpoint_id", &self.endpoint_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model_name", &self.model_name)
            .finish()
    }
}

/// One candidate judge model configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Display name of the model, e.g. `deepseek-v3.1`
    pub name: String,
    /// Free-text provider name, e.g. `aliyun_bailian`
    #[serde(default)]
    pub provider_name: String,
    /// Explicit family tag; takes precedence over `provider_name` classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<ProviderFamily>,
    #[serde(default)]
    pub config: ModelSettings,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, family: ProviderFamily, config: ModelSettings) -> Self {
        Self {
            name: name.into(),
            provider_name: family.as_str().to_string(),
            family: Some(family),
            config,
        }
    }

    /// Build a candidate from a legacy record whose family is only implied by its provider name.
    pub fn from_provider_name(
        name: impl Into<String>,
        provider_name: impl Into<String>,
        config: ModelSettings,
    ) -> Self {
        Self {
            name: name.into(),
            provider_name: provider_name.into(),
            family: None,
            config,
        }
    }

    pub fn resolve_family(&self) -> Option<ProviderFamily> {
        self.family.or_else(|| {
            ProviderFamily::classify(&self.provider_name, self.config.endpoint_id.as_deref())
        })
    }
}

/// Prefix `https://` onto endpoints that carry no scheme.
pub fn normalize_endpoint(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw.trim_start_matches('/'))
    }
}
