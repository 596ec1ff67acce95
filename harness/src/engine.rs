//! Run lifecycle: validate, bind a judge, run the batch, persist the outcome.
//!
//! ```text
//! INIT ──► RUNNING ──► SUCCESS | EXPERIMENT
//!   │         ├──────► FAILED
//!   │         └──────► CANCELLED
//!   └──► FAILED (dataset, schema or judge problems before any row runs)
//! ```

use crate::agent::{AgentError, AgentInvoker};
use crate::dataset::{Dataset, DatasetError};
use crate::metrics::{aggregate, MetricsError};
use crate::row::RowExecutor;
use crate::runner::{BatchOutcome, BatchRunner, RunnerError};
use crate::store::{RunRecord, RunStatus, RunStore, StatusUpdate, StoreCancellation, StoreError};
use crate::tokenizer::Tokenizer;
use model::judge::{JudgeDispatcher, Scorer, ScorerHandle, DEFAULT_JUDGE_PROMPT};
use model::ModelConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Rows taken by a preview run.
pub const EXPERIMENT_ROWS: usize = 3;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dataset contains no rows")]
    EmptyDataset,

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("Agent parameter probe failed: {0}")]
    SchemaProbe(#[source] AgentError),

    #[error("Dataset does not match the agent parameters: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("No judge model could be bound from {candidates} candidate(s)")]
    JudgeUnavailable { candidates: usize },

    #[error("No row succeeded: {0}")]
    Aggregation(#[from] MetricsError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Full,
    /// First [`EXPERIMENT_ROWS`] rows only; finishes in `EXPERIMENT`
    Experiment,
}

impl RunMode {
    fn terminal_status(&self) -> RunStatus {
        match self {
            RunMode::Full => RunStatus::Success,
            RunMode::Experiment => RunStatus::Experiment,
        }
    }
}

/// What a start request led to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// Another start owns this run; nothing was executed
    AlreadyRunning,
    /// The run finished earlier; its stored record is returned as is
    AlreadyCompleted { record: RunRecord },
    /// The run is in a state that cannot be started
    Rejected { status: RunStatus, reason: String },
    Completed { record: RunRecord },
    Cancelled {
        committed: usize,
        discarded: usize,
        not_started: usize,
    },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub judge_prompt: String,
    pub judge_candidates: Vec<ModelConfig>,
    /// Fail the run when rows carry references but no judge binds
    pub judge_required: bool,
    pub agent_timeout: Duration,
    pub judge_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            judge_prompt: DEFAULT_JUDGE_PROMPT.to_string(),
            judge_candidates: Vec::new(),
            judge_required: false,
            agent_timeout: Duration::from_secs(60),
            judge_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl EngineSettings {
    pub fn with_judge_candidates(mut self, candidates: Vec<ModelConfig>) -> Self {
        self.judge_candidates = candidates;
        self
    }

    pub fn with_judge_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.judge_prompt = prompt.into();
        self
    }

    pub fn with_judge_required(mut self, required: bool) -> Self {
        self.judge_required = required;
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

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

struct PreparedBatch {
    dataset: Dataset,
    scorer: Option<ScorerHandle>,
}

pub struct BatchEngine {
    store: Arc<dyn RunStore>,
    agent: Arc<dyn AgentInvoker>,
    dispatcher: Arc<JudgeDispatcher>,
    tokenizer: Arc<dyn Tokenizer>,
    settings: EngineSettings,
}

impl BatchEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        agent: Arc<dyn AgentInvoker>,
        dispatcher: Arc<JudgeDispatcher>,
        tokenizer: Arc<dyn Tokenizer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            agent,
            dispatcher,
            tokenizer,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Execute `run_id` over `dataset`.
    ///
    /// Batch-level failures are persisted and reported as
    /// [`StartOutcome::Failed`]; `Err` is returned only when the store itself
    /// cannot be read or written.
    #[instrument(skip_all, fields(run_id = %run_id, mode = ?mode, rows = dataset.len()))]
    pub async fn start(
        &self,
        run_id: Uuid,
        dataset: Dataset,
        mode: RunMode,
    ) -> EngineResult<StartOutcome> {
        let run = self.store.get_run(run_id).await?;
        if let Some(outcome) = Self::existing_outcome(&run) {
            info!(status = %run.status, "Start request on a run that is not INIT");
            return Ok(outcome);
        }

        let prepared = match self.prepare(dataset, mode).await {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(run_id, RunStatus::Init, e).await,
        };

        let binding = prepared.scorer.as_ref().map(|s| s.binding());
        let running = StatusUpdate::running(binding).expecting(RunStatus::Init);
        match self.store.set_status(run_id, running).await {
            Ok(_) => info!(rows = prepared.dataset.len(), "Run is RUNNING"),
            Err(StoreError::InvalidTransition { from, .. }) => {
                let run = self.store.get_run(run_id).await?;
                warn!(status = %from, "Lost the race to start the run");
                return Ok(Self::existing_outcome(&run).unwrap_or(StartOutcome::AlreadyRunning));
            }
            Err(e) => return Err(e.into()),
        }

        self.execute(run_id, run.concurrency, prepared, mode).await
    }

    /// Load the dataset at `path` and [`start`](Self::start) the run over it.
    ///
    /// A dataset that cannot be read or parsed fails the run before `RUNNING`.
    pub async fn start_from_path(
        &self,
        run_id: Uuid,
        path: &Path,
        mode: RunMode,
    ) -> EngineResult<StartOutcome> {
        match Dataset::from_path(path) {
            Ok(dataset) => self.start(run_id, dataset, mode).await,
            Err(e) => {
                let run = self.store.get_run(run_id).await?;
                if let Some(outcome) = Self::existing_outcome(&run) {
                    return Ok(outcome);
                }
                self.fail(run_id, RunStatus::Init, e.into()).await
            }
        }
    }

    fn existing_outcome(run: &RunRecord) -> Option<StartOutcome> {
        match run.status {
            RunStatus::Init => None,
            RunStatus::Running => Some(StartOutcome::AlreadyRunning),
            RunStatus::Success | RunStatus::Experiment => Some(StartOutcome::AlreadyCompleted {
                record: run.clone(),
            }),
            RunStatus::Cancelled => Some(StartOutcome::Rejected {
                status: RunStatus::Cancelled,
                reason: "run was cancelled".to_string(),
            }),
            RunStatus::Failed => Some(StartOutcome::Rejected {
                status: RunStatus::Failed,
                reason: run
                    .error
                    .clone()
                    .unwrap_or_else(|| "run failed".to_string()),
            }),
        }
    }

    async fn prepare(&self, dataset: Dataset, mode: RunMode) -> EngineResult<PreparedBatch> {
        if dataset.is_empty() {
            return Err(EngineError::EmptyDataset);
        }
        let mut dataset = match mode {
            RunMode::Full => dataset,
            RunMode::Experiment => dataset.preview(EXPERIMENT_ROWS),
        };

        let schema = self
            .agent
            .fetch_parameters()
            .await
            .map_err(EngineError::SchemaProbe)?;
        let mut errors = Vec::new();
        for (index, row) in dataset.rows_mut().iter_mut().enumerate() {
            schema.align_row(row);
            errors.extend(
                schema
                    .validate_row(row)
                    .into_iter()
                    .map(|e| format!("row {}: {}", index, e)),
            );
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation { errors });
        }

        let needs_judge = dataset
            .rows()
            .iter()
            .any(|row| row.reference_answer().is_some());
        let scorer = if needs_judge {
            self.dispatcher.bind(&self.settings.judge_candidates).await
        } else {
            None
        };
        if needs_judge && scorer.is_none() {
            if self.settings.judge_required {
                return Err(EngineError::JudgeUnavailable {
                    candidates: self.settings.judge_candidates.len(),
                });
            }
            warn!("No judge bound; every row gets the no-reference score");
        }

        Ok(PreparedBatch { dataset, scorer })
    }

    async fn execute(
        &self,
        run_id: Uuid,
        concurrency: usize,
        prepared: PreparedBatch,
        mode: RunMode,
    ) -> EngineResult<StartOutcome> {
        let scorer = prepared.scorer.map(|s| Arc::new(s) as Arc<dyn Scorer>);
        let executor = RowExecutor::new(
            self.agent.clone(),
            self.tokenizer.clone(),
            self.settings.judge_prompt.clone(),
        )
        .with_scorer(scorer)
        .with_agent_timeout(self.settings.agent_timeout)
        .with_judge_timeout(self.settings.judge_timeout);
        let cancellation = Arc::new(StoreCancellation::new(self.store.clone(), run_id));

        let outcome = match BatchRunner::new(
            Arc::new(executor),
            self.store.clone(),
            cancellation,
            run_id,
            concurrency,
        ) {
            Ok(runner) => {
                runner
                    .with_poll_interval(self.settings.poll_interval)
                    .run(prepared.dataset.into_rows())
                    .await
            }
            Err(e) => Err(e),
        };

        let report = match outcome {
            Ok(BatchOutcome::Completed(report)) => report,
            Ok(BatchOutcome::Cancelled {
                committed,
                discarded,
                not_started,
            }) => {
                self.store
                    .set_status(run_id, StatusUpdate::cancelled())
                    .await?;
                info!(committed, discarded, not_started, "Run is CANCELLED");
                return Ok(StartOutcome::Cancelled {
                    committed,
                    discarded,
                    not_started,
                });
            }
            Err(e) => return self.fail(run_id, RunStatus::Running, e.into()).await,
        };

        let summary = match aggregate(&report.succeeded) {
            Ok(summary) => summary,
            Err(e) => return self.fail(run_id, RunStatus::Running, e.into()).await,
        };

        let status = mode.terminal_status();
        let update = StatusUpdate::completed(status, summary).expecting(RunStatus::Running);
        match self.store.set_status(run_id, update).await {
            Ok(record) => {
                info!(
                    status = %status,
                    success = record.success_count,
                    failure = record.failure_count,
                    "Run finished"
                );
                Ok(StartOutcome::Completed { record })
            }
            Err(StoreError::InvalidTransition {
                from: RunStatus::Cancelled,
                ..
            }) => {
                warn!("Run was cancelled after its last row completed");
                Ok(StartOutcome::Cancelled {
                    committed: report.committed(),
                    discarded: 0,
                    not_started: 0,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        cause: EngineError,
    ) -> EngineResult<StartOutcome> {
        let message = cause.to_string();
        error!(error = %message, "Run failed");
        let update = StatusUpdate::failed(message.clone()).expecting(expected);
        match self.store.set_status(run_id, update).await {
            Ok(_) => Ok(StartOutcome::Failed { error: message }),
            Err(StoreError::InvalidTransition { from, .. }) => {
                let run = self.store.get_run(run_id).await?;
                warn!(status = %from, "Run changed state before the failure was recorded");
                Ok(Self::existing_outcome(&run).unwrap_or(StartOutcome::Failed { error: message }))
            }
            Err(e) => Err(e.into()),
        }
    }
}
