//! Single-row invocation: one agent call, optional judging, metrics.

use crate::agent::{AgentError, AgentInvoker};
use crate::dataset::Row;
use crate::metrics::RowMetrics;
use crate::tokenizer::Tokenizer;
use model::judge::{Scorer, NO_REFERENCE_SCORE};
use model::ModelError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RowError {
    #[error("Agent call failed: {0}")]
    Agent(#[from] AgentError),

    #[error("Agent call timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },

    #[error("Judge call failed: {0}")]
    Judge(#[from] ModelError),

    #[error("Judge call timed out after {seconds:.1}s")]
    JudgeTimeout { seconds: f64 },

    #[error("Row task aborted: {message}")]
    Aborted { message: String },
}

#[derive(Debug)]
pub enum RowOutcome {
    Succeeded(RowMetrics),
    Failed { metrics: RowMetrics, error: RowError },
}

impl RowOutcome {
    pub fn metrics(&self) -> &RowMetrics {
        match self {
            RowOutcome::Succeeded(metrics) | RowOutcome::Failed { metrics, .. } => metrics,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RowOutcome::Succeeded(_))
    }

    pub fn error(&self) -> Option<&RowError> {
        match self {
            RowOutcome::Succeeded(_) => None,
            RowOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// Everything needed to run one row; shared by all in-flight rows of a batch.
pub struct RowExecutor {
    agent: Arc<dyn AgentInvoker>,
    scorer: Option<Arc<dyn Scorer>>,
    tokenizer: Arc<dyn Tokenizer>,
    judge_prompt: String,
    agent_timeout: Duration,
    judge_timeout: Duration,
}

impl RowExecutor {
    pub fn new(
        agent: Arc<dyn AgentInvoker>,
        tokenizer: Arc<dyn Tokenizer>,
        judge_prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            scorer: None,
            tokenizer,
            judge_prompt: judge_prompt.into(),
            agent_timeout: Duration::from_secs(60),
            judge_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_scorer(mut self, scorer: Option<Arc<dyn Scorer>>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout = timeout;
        self
    }

    /// Run one row. Never panics on row-level problems; they become `Failed`.
    ///
    /// `time_consumption` covers the agent call only.
    pub async fn execute(&self, index: usize, row: &Row) -> RowOutcome {
        debug!(row = index, "Row started");
        let started = Instant::now();
        let call = tokio::time::timeout(self.agent_timeout, self.agent.invoke(row)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let answer = match call {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return Self::fail(index, elapsed, e.into()),
            Err(_) => {
                return Self::fail(
                    index,
                    elapsed,
                    RowError::Timeout {
                        seconds: self.agent_timeout.as_secs_f64(),
                    },
                )
            }
        };

        let score = match self.score(index, row, &answer).await {
            Ok(score) => score,
            Err(e) => return Self::fail(index, elapsed, e),
        };

        let token_count = self.tokenizer.count(&answer);
        let metrics = RowMetrics::new(elapsed, token_count, score, answer);
        debug!(
            row = index,
            time = metrics.time_consumption,
            tokens = metrics.token_count,
            score = metrics.score,
            "Row finished"
        );
        RowOutcome::Succeeded(metrics)
    }

    async fn score(&self, index: usize, row: &Row, answer: &str) -> Result<f64, RowError> {
        let Some(reference) = row.reference_answer() else {
            return Ok(NO_REFERENCE_SCORE);
        };
        let Some(scorer) = &self.scorer else {
            debug!(row = index, "No judge bound, using the no-reference score");
            return Ok(NO_REFERENCE_SCORE);
        };

        let judged = tokio::time::timeout(
            self.judge_timeout,
            scorer.score(answer, &reference, &self.judge_prompt),
        )
        .await
        .map_err(|_| RowError::JudgeTimeout {
            seconds: self.judge_timeout.as_secs_f64(),
        })??;
        if judged.is_degraded() {
            warn!(row = index, score = judged.value(), "Judge score degraded");
        }
        Ok(judged.value())
    }

    fn fail(index: usize, elapsed: f64, error: RowError) -> RowOutcome {
        warn!(row = index, error = %error, "Row failed");
        RowOutcome::Failed {
            metrics: RowMetrics::failed(elapsed),
            error,
        }
    }
}
