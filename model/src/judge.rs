//! Judge model dispatch and score parsing
//!
//! A benchmark run may list several candidate judge models. The
//! [`JudgeDispatcher`] probes them in the order given and binds the first one
//! that answers a trivial chat request. The resulting [`ScorerHandle`] grades a
//! generated answer against a reference and turns the judge's free-form reply
//! into a [`JudgeScore`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use model::config::{ModelConfig, ModelSettings, ProviderFamily};
//! use model::judge::{JudgeDispatcher, Scorer, DEFAULT_JUDGE_PROMPT};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let candidates = vec![ModelConfig::new(
//!     "qwen-plus",
//!     ProviderFamily::Dashscope,
//!     ModelSettings::new()
//!         .with_endpoint("dashscope.aliyuncs.com/compatible-mode/v1/chat/completions")
//!         .with_api_key("sk-...")
//!         .with_model_name("qwen-plus"),
//! )];
//!
//! let dispatcher = JudgeDispatcher::default();
//! if let Some(scorer) = dispatcher.bind(&candidates).await {
//!     let score = scorer.score("Paris", "The capital is Paris", DEFAULT_JUDGE_PROMPT).await?;
//!     println!("score: {}", score.value());
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{ModelConfig, ProviderFamily};
use crate::provider::ModelResult;
use crate::registry::{JudgeAdapter, ProviderRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Score assigned to rows that carry no reference answer.
pub const NO_REFERENCE_SCORE: f64 = 100.0;

/// Built-in grading instructions used when a run does not supply its own prompt.
pub const DEFAULT_JUDGE_PROMPT: &str = "You are a strict grader. You will receive a generated \
text and a reference text. Judge how well the generated text matches the meaning, facts and \
completeness of the reference text. Answer with a JSON object of the form {\"score\": <integer \
between 0 and 100>} and nothing else.";

/// Settings shared by every judge adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Timeout for each probe or scoring request
    pub default_timeout: Duration,
    /// Enable detailed logging for judge operations
    pub verbose_logging: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            verbose_logging: false,
        }
    }
}

impl JudgeConfig {
    /// Enable verbose logging for debugging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    /// Set custom timeout for requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Outcome of parsing a judge reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JudgeScore {
    /// The reply contained a well-formed `{"score": n}` object
    Parsed(f64),
    /// The reply was malformed; the first integer in it was used
    Extracted(f64),
    /// Nothing numeric could be recovered
    Unparseable,
}

impl JudgeScore {
    pub fn value(&self) -> f64 {
        match self {
            JudgeScore::Parsed(v) | JudgeScore::Extracted(v) => *v,
            JudgeScore::Unparseable => 0.0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, JudgeScore::Parsed(_))
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn score_from_json(text: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("score")? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_integer(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Turn a raw judge reply into a score.
pub fn parse_score(raw: &str) -> JudgeScore {
    let body = strip_code_fence(raw);

    let object = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&body[start..=end]),
        _ => None,
    };
    if let Some(score) = score_from_json(body).or_else(|| object.and_then(score_from_json)) {
        return JudgeScore::Parsed(score);
    }

    first_integer(body)
        .map(JudgeScore::Extracted)
        .unwrap_or(JudgeScore::Unparseable)
}

/// Stable identifier of the judge a run was scored with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeBinding {
    pub candidate: String,
    pub family: ProviderFamily,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(
        &self,
        generated: &str,
        reference: &str,
        prompt: &str,
    ) -> ModelResult<JudgeScore>;

    fn binding(&self) -> JudgeBinding;
}

/// A candidate that passed its probe, together with its family's adapter.
#[derive(Clone)]
pub struct ScorerHandle {
    candidate: ModelConfig,
    family: ProviderFamily,
    adapter: Arc<dyn JudgeAdapter>,
}

impl ScorerHandle {
    pub fn new(candidate: ModelConfig, family: ProviderFamily, adapter: Arc<dyn JudgeAdapter>) -> Self {
        Self {
            candidate,
            family,
            adapter,
        }
    }

    pub fn candidate(&self) -> &ModelConfig {
        &self.candidate
    }

    pub fn family(&self) -> ProviderFamily {
        self.family
    }
}

impl std::fmt::Debug for ScorerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScorerHandle")
            .field("candidate", &self.candidate.name)
            .field("family", &self.family)
            .finish()
    }
}

#[async_trait]
impl Scorer for ScorerHandle {
    async fn score(
        &self,
        generated: &str,
        reference: &str,
        prompt: &str,
    ) -> ModelResult<JudgeScore> {
        let raw = self
            .adapter
            .score(&self.candidate.config, generated, reference, prompt)
            .await?;
        let score = parse_score(&raw);
        if score.is_degraded() {
            warn!(
                candidate = %self.candidate.name,
                raw = %raw,
                score = score.value(),
                "Judge reply was not a score object"
            );
        }
        Ok(score)
    }

    fn binding(&self) -> JudgeBinding {
        JudgeBinding {
            candidate: self.candidate.name.clone(),
            family: self.family,
        }
    }
}

/// First-success selection over an ordered candidate list.
pub struct JudgeDispatcher {
    registry: ProviderRegistry,
}

impl JudgeDispatcher {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Probe `candidates` in order and bind the first one that responds.
    ///
    /// Candidates whose family cannot be determined, or that have no adapter,
    /// are skipped. Returns `None` when nothing binds.
    pub async fn bind(&self, candidates: &[ModelConfig]) -> Option<ScorerHandle> {
        for candidate in candidates {
            let Some(family) = candidate.resolve_family() else {
                warn!(
                    candidate = %candidate.name,
                    provider = %candidate.provider_name,
                    "Skipping judge candidate with unknown provider family"
                );
                continue;
            };
            let Some(adapter) = self.registry.get(family) else {
                warn!(candidate = %candidate.name, family = %family, "No adapter registered");
                continue;
            };

            debug!(candidate = %candidate.name, family = %family, "Probing judge candidate");
            match adapter.probe(&candidate.config).await {
                Ok(()) => {
                    info!(candidate = %candidate.name, family = %family, "Bound judge model");
                    return Some(ScorerHandle::new(candidate.clone(), family, adapter));
                }
                Err(e) => {
                    warn!(candidate = %candidate.name, family = %family, error = %e, "Judge probe failed");
                }
            }
        }

        warn!(candidates = candidates.len(), "No judge candidate could be bound");
        None
    }
}

impl Default for JudgeDispatcher {
    fn default() -> Self {
        Self::new(ProviderRegistry::default())
    }
}
