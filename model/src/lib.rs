pub mod config;
pub mod judge;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod types;

pub use config::{normalize_endpoint, ModelConfig, ModelSettings, ProviderFamily};
pub use judge::{
    parse_score, JudgeBinding, JudgeConfig, JudgeDispatcher, JudgeScore, Scorer, ScorerHandle,
    DEFAULT_JUDGE_PROMPT, NO_REFERENCE_SCORE,
};
pub use openai::OpenAiCompatibleProvider;
pub use provider::{ModelError, ModelProvider, ModelResult};
pub use registry::{ChatCompletionsAdapter, JudgeAdapter, ProviderRegistry};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, MessageRole, Usage};

pub mod prelude {
    pub use crate::config::*;
    pub use crate::judge::*;
    pub use crate::provider::*;
    pub use crate::registry::*;
    pub use crate::types::*;
}
