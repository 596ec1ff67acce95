use crate::agent::{AgentEndpoint, AgentType};
use crate::engine::EngineSettings;
use model::judge::{JudgeConfig, DEFAULT_JUDGE_PROMPT};
use model::ModelConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Scheduling knobs of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunSettings {
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            request_timeout_secs: 60,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JudgeSettings {
    pub prompt: String,
    /// Fail the run when rows carry references but no candidate binds
    pub required: bool,
    pub timeout_secs: u64,
    /// Log probe results and raw judge replies at debug level
    pub verbose: bool,
    pub candidates: Vec<ModelConfig>,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_JUDGE_PROMPT.to_string(),
            required: false,
            timeout_secs: 30,
            verbose: false,
            candidates: Vec::new(),
        }
    }
}

/// One benchmark, as read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchConfig {
    pub agent: AgentEndpoint,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub judge: JudgeSettings,
}

impl BenchConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            agent: AgentEndpoint::new(base_url, api_key, agent_type),
            run: RunSettings::default(),
            judge: JudgeSettings::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: BenchConfig = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.run.concurrency = concurrency;
        self
    }

    pub fn with_judge_candidates(mut self, candidates: Vec<ModelConfig>) -> Self {
        self.judge.candidates = candidates;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let base_url = &self.agent.base_url;
        if base_url.is_empty() {
            return Err("Agent base URL cannot be empty".to_string());
        }

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err("Agent base URL must start with http:// or https://".to_string());
        }

        if self.agent.api_key.is_empty() {
            return Err("Agent API key cannot be empty".to_string());
        }

        if self.run.concurrency == 0 {
            return Err("Concurrency must be greater than 0".to_string());
        }

        if self.run.request_timeout_secs == 0 || self.judge.timeout_secs == 0 {
            return Err("Timeouts must be greater than 0".to_string());
        }

        if self.run.poll_interval_ms == 0 {
            return Err("Poll interval must be greater than 0".to_string());
        }

        if let Some(candidate) = self.judge.candidates.iter().find(|c| c.name.is_empty()) {
            return Err(format!(
                "Judge candidate for provider '{}' has no name",
                candidate.provider_name
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.run.request_timeout_secs)
    }

    pub fn judge_config(&self) -> JudgeConfig {
        let config =
            JudgeConfig::default().with_timeout(Duration::from_secs(self.judge.timeout_secs));
        if self.judge.verbose {
            config.with_verbose_logging()
        } else {
            config
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings::default()
            .with_judge_prompt(self.judge.prompt.clone())
            .with_judge_candidates(self.judge.candidates.clone())
            .with_judge_required(self.judge.required)
            .with_agent_timeout(self.request_timeout())
            .with_judge_timeout(Duration::from_secs(self.judge.timeout_secs))
            .with_poll_interval(Duration::from_millis(self.run.poll_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::ProviderFamily;
    use std::io::Write;

    const EXAMPLE: &str = r#"
[agent]
base_url = "https://agent.example.com/v1"
api_key = "app-123"
agent_type = "workflow"

[run]
concurrency = 8

[judge]
required = true
verbose = true
timeout_secs = 12

[[judge.candidates]]
name = "qwen-plus"
provider_name = "aliyun_bailian"
[judge.candidates.config]
endpointId = "dashscope.aliyuncs.com/compatible-mode/v1/chat/completions"
apiKey = "sk-1"
apiEndpointModelName = "qwen-plus"

[[judge.candidates]]
name = "doubao"
provider_name = "custom"
family = "ark"
[judge.candidates.config]
endpointId = "ep-1"
apiKey = "ark-1"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = BenchConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.agent.agent_type, AgentType::Workflow);
        assert_eq!(config.agent.user, "agent-bench");
        assert_eq!(config.run.concurrency, 8);
        assert_eq!(config.run.request_timeout_secs, 60);
        assert!(config.judge.required);
        assert_eq!(config.judge.prompt, DEFAULT_JUDGE_PROMPT);

        let candidates = &config.judge.candidates;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].resolve_family(), Some(ProviderFamily::Dashscope));
        assert_eq!(candidates[1].resolve_family(), Some(ProviderFamily::Ark));
        assert_eq!(candidates[1].config.model_name, None);

        let judge = config.judge_config();
        assert!(judge.verbose_logging);
        assert_eq!(judge.default_timeout, Duration::from_secs(12));

        let settings = config.engine_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert!(settings.judge_required);
    }

    #[test]
    fn test_judge_defaults_are_quiet() {
        let config = BenchConfig::new("http://localhost", "k", AgentType::Chatflow);
        let judge = config.judge_config();
        assert!(!judge.verbose_logging);
        assert_eq!(judge.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validation_errors() {
        let config = BenchConfig::new("agent.example.com", "k", AgentType::Chatflow);
        assert!(config.validate().unwrap_err().contains("http"));

        let config = BenchConfig::new("http://localhost", "k", AgentType::Chatflow).with_concurrency(0);
        assert!(config.validate().unwrap_err().contains("Concurrency"));

        let bad = EXAMPLE.replace("concurrency = 8", "concurrency = 0");
        assert!(matches!(
            BenchConfig::from_toml(&bad),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BenchConfig::from_toml("[agent]\nbase_url = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", EXAMPLE).unwrap();
        let config = BenchConfig::from_path(file.path()).unwrap();
        assert_eq!(config.agent.api_key, "app-123");

        assert!(matches!(
            BenchConfig::from_path("/nonexistent/bench.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
