//! Run persistence and the cancellation poller.
//!
//! [`RunStore`] is the narrow interface the engine writes status, counters and
//! per-row records through. Every method is its own transaction; the engine
//! never reads a counter, changes it in memory and writes it back.
//! `set_status` rejects illegal state transitions, which makes `INIT → RUNNING`
//! a compare-and-set: of two concurrent starts only one gets through.

use crate::metrics::RunSummary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::judge::JudgeBinding;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run not found: {run_id}")]
    NotFound { run_id: Uuid },

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Concurrency must be at least 1, got {value}")]
    InvalidConcurrency { value: usize },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Init,
    Running,
    Success,
    Failed,
    Cancelled,
    /// Terminal state of a preview run over the first rows only
    Experiment,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Experiment
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Init, Running | Failed | Cancelled)
                | (Running, Success | Experiment | Failed | Cancelled)
                | (Cancelled, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Init => "INIT",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Experiment => "EXPERIMENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub concurrency: usize,
    pub success_count: u64,
    pub failure_count: u64,
    pub result: Option<RunSummary>,
    pub error: Option<String>,
    /// Seconds; set together with a successful terminal status
    pub duration: Option<f64>,
    pub judge: Option<JudgeBinding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(concurrency: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Init,
            concurrency,
            success_count: 0,
            failure_count: 0,
            result: None,
            error: None,
            duration: None,
            judge: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A status write, with the payload that belongs to it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub result: Option<RunSummary>,
    pub error: Option<String>,
    pub duration: Option<f64>,
    pub judge: Option<JudgeBinding>,
    /// Apply only when the stored status equals this one
    pub expected: Option<RunStatus>,
}

impl StatusUpdate {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            duration: None,
            judge: None,
            expected: None,
        }
    }

    pub fn expecting(mut self, current: RunStatus) -> Self {
        self.expected = Some(current);
        self
    }

    pub fn running(judge: Option<JudgeBinding>) -> Self {
        Self {
            judge,
            ..Self::new(RunStatus::Running)
        }
    }

    pub fn completed(status: RunStatus, summary: RunSummary) -> Self {
        Self {
            duration: Some(summary.total_time_consumption),
            result: Some(summary),
            ..Self::new(status)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(RunStatus::Failed)
        }
    }

    pub fn cancelled() -> Self {
        Self::new(RunStatus::Cancelled)
    }
}

/// One committed row of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub run_id: Uuid,
    pub row_index: usize,
    pub query: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub time_consumption: f64,
    pub token_count: usize,
    pub throughput: f64,
    pub score: f64,
    pub generated_answer: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, concurrency: usize) -> StoreResult<RunRecord>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<RunRecord>;

    async fn get_status(&self, run_id: Uuid) -> StoreResult<RunStatus>;

    /// Apply `update` if the transition from the stored status is legal.
    async fn set_status(&self, run_id: Uuid, update: StatusUpdate) -> StoreResult<RunRecord>;

    /// Atomically add one to the success counter; returns the new value.
    async fn increment_success(&self, run_id: Uuid) -> StoreResult<u64>;

    /// Atomically add one to the failure counter; returns the new value.
    async fn increment_failure(&self, run_id: Uuid) -> StoreResult<u64>;

    async fn record_row(&self, record: RowRecord) -> StoreResult<()>;

    async fn list_rows(&self, run_id: Uuid) -> StoreResult<Vec<RowRecord>>;
}

/// Process-local store. Each operation takes the lock once and releases it
/// before returning.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<Uuid, RunRecord>>,
    rows: Mutex<Vec<RowRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> StoreResult<MutexGuard<'_, HashMap<Uuid, RunRecord>>> {
        self.runs.lock().map_err(|e| StoreError::Unavailable {
            message: e.to_string(),
        })
    }

    fn rows(&self) -> StoreResult<MutexGuard<'_, Vec<RowRecord>>> {
        self.rows.lock().map_err(|e| StoreError::Unavailable {
            message: e.to_string(),
        })
    }

    fn update<T>(&self, run_id: Uuid, f: impl FnOnce(&mut RunRecord) -> StoreResult<T>) -> StoreResult<T> {
        let mut runs = self.runs()?;
        let record = runs.get_mut(&run_id).ok_or(StoreError::NotFound { run_id })?;
        let value = f(record)?;
        record.updated_at = Utc::now();
        Ok(value)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, concurrency: usize) -> StoreResult<RunRecord> {
        if concurrency == 0 {
            return Err(StoreError::InvalidConcurrency { value: concurrency });
        }
        let record = RunRecord::new(concurrency);
        self.runs()?.insert(record.run_id, record.clone());
        debug!(run_id = %record.run_id, concurrency, "Created run");
        Ok(record)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<RunRecord> {
        self.runs()?
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::NotFound { run_id })
    }

    async fn get_status(&self, run_id: Uuid) -> StoreResult<RunStatus> {
        self.runs()?
            .get(&run_id)
            .map(|r| r.status)
            .ok_or(StoreError::NotFound { run_id })
    }

    async fn set_status(&self, run_id: Uuid, update: StatusUpdate) -> StoreResult<RunRecord> {
        self.update(run_id, |record| {
            let expected_ok = update.expected.is_none_or(|expected| expected == record.status);
            if !expected_ok || !record.status.can_transition_to(update.status) {
                return Err(StoreError::InvalidTransition {
                    from: record.status,
                    to: update.status,
                });
            }
            record.status = update.status;
            if update.result.is_some() {
                record.result = update.result;
            }
            if update.error.is_some() {
                record.error = update.error;
            }
            if update.duration.is_some() {
                record.duration = update.duration;
            }
            if update.judge.is_some() {
                record.judge = update.judge;
            }
            Ok(record.clone())
        })
    }

    async fn increment_success(&self, run_id: Uuid) -> StoreResult<u64> {
        self.update(run_id, |record| {
            record.success_count += 1;
            Ok(record.success_count)
        })
    }

    async fn increment_failure(&self, run_id: Uuid) -> StoreResult<u64> {
        self.update(run_id, |record| {
            record.failure_count += 1;
            Ok(record.failure_count)
        })
    }

    async fn record_row(&self, record: RowRecord) -> StoreResult<()> {
        if !self.runs()?.contains_key(&record.run_id) {
            return Err(StoreError::NotFound {
                run_id: record.run_id,
            });
        }
        self.rows()?.push(record);
        Ok(())
    }

    async fn list_rows(&self, run_id: Uuid) -> StoreResult<Vec<RowRecord>> {
        let mut rows: Vec<RowRecord> = self
            .rows()?
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.row_index);
        Ok(rows)
    }
}

/// Reports whether the owning run has been cancelled.
#[async_trait]
pub trait CancellationCheck: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Point read of the run status on every call; holds no state of its own.
#[derive(Clone)]
pub struct StoreCancellation {
    store: Arc<dyn RunStore>,
    run_id: Uuid,
}

impl StoreCancellation {
    pub fn new(store: Arc<dyn RunStore>, run_id: Uuid) -> Self {
        Self { store, run_id }
    }
}

#[async_trait]
impl CancellationCheck for StoreCancellation {
    async fn is_cancelled(&self) -> bool {
        match self.store.get_status(self.run_id).await {
            Ok(status) => status == RunStatus::Cancelled,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Cancellation poll failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use RunStatus::*;
        assert!(Init.can_transition_to(Running));
        assert!(Init.can_transition_to(Failed));
        assert!(Running.can_transition_to(Experiment));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Cancelled.can_transition_to(Cancelled));

        assert!(!Running.can_transition_to(Running));
        assert!(!Init.can_transition_to(Success));
        assert!(!Cancelled.can_transition_to(Success));
        assert!(!Success.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Experiment).unwrap(),
            "\"EXPERIMENT\""
        );
        assert_eq!(RunStatus::Cancelled.to_string(), "CANCELLED");
    }

    #[tokio::test]
    async fn test_start_is_compare_and_set() {
        let store = InMemoryRunStore::new();
        let run = store.create_run(2).await.unwrap();

        store
            .set_status(run.run_id, StatusUpdate::running(None))
            .await
            .unwrap();
        let err = store
            .set_status(run.run_id, StatusUpdate::running(None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: RunStatus::Running,
                to: RunStatus::Running
            }
        ));

        let err = store
            .set_status(
                run.run_id,
                StatusUpdate::failed("bad rows").expecting(RunStatus::Init),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(
            store.get_status(run.run_id).await.unwrap(),
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_completed_update_stores_result_and_duration() {
        let store = InMemoryRunStore::new();
        let run = store.create_run(1).await.unwrap();
        store
            .set_status(run.run_id, StatusUpdate::running(None))
            .await
            .unwrap();

        let summary = RunSummary {
            avg_time_consumption: 1.5,
            avg_token_count: 4.0,
            avg_throughput: 2.0,
            avg_score: 100.0,
            total_time_consumption: 3.0,
        };
        let record = store
            .set_status(
                run.run_id,
                StatusUpdate::completed(RunStatus::Success, summary.clone()),
            )
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.result, Some(summary));
        assert_eq!(record.duration, Some(3.0));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryRunStore::new());
        let run_id = store.create_run(8).await.unwrap().run_id;

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 5 == 0 {
                    store.increment_failure(run_id).await.unwrap();
                } else {
                    store.increment_success(run_id).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get_run(run_id).await.unwrap();
        assert_eq!(record.success_count, 40);
        assert_eq!(record.failure_count, 10);
    }

    #[tokio::test]
    async fn test_store_errors() {
        let store = InMemoryRunStore::new();
        assert!(matches!(
            store.create_run(0).await,
            Err(StoreError::InvalidConcurrency { value: 0 })
        ));
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.get_status(missing).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_poller() {
        let store = Arc::new(InMemoryRunStore::new());
        let run = store.create_run(1).await.unwrap();
        let poller = StoreCancellation::new(store.clone(), run.run_id);
        assert!(!poller.is_cancelled().await);

        store
            .set_status(run.run_id, StatusUpdate::cancelled())
            .await
            .unwrap();
        assert!(poller.is_cancelled().await);

        let orphan = StoreCancellation::new(store, Uuid::new_v4());
        assert!(!orphan.is_cancelled().await);
    }
}
