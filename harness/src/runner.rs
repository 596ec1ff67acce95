//! Concurrency-bounded row scheduling with cooperative cancellation.
//!
//! At most `max_concurrency` rows are in flight. The coordinator (the task
//! calling [`BatchRunner::run`]) is the only place that commits results, so
//! counters and row records are written at most once per row. Cancellation is
//! polled before each dispatch, after each completion and on a fixed tick while
//! every slot is busy. Once it is observed no new row starts, in-flight rows
//! run to completion and their results are discarded.

use crate::dataset::Row;
use crate::metrics::RowMetrics;
use crate::row::{RowError, RowExecutor, RowOutcome};
use crate::store::{CancellationCheck, RowRecord, RunStore, StoreError};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to commit row {row}: {source}")]
    Commit {
        row: usize,
        #[source]
        source: StoreError,
    },

    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Tally of a batch that ran every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Metrics of successful rows, in completion order
    pub succeeded: Vec<RowMetrics>,
    pub failed: usize,
}

impl BatchReport {
    pub fn committed(&self) -> usize {
        self.succeeded.len() + self.failed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed(BatchReport),
    Cancelled {
        /// Rows committed before cancellation was observed
        committed: usize,
        /// In-flight rows whose results were dropped
        discarded: usize,
        not_started: usize,
    },
}

pub struct BatchRunner {
    executor: Arc<RowExecutor>,
    store: Arc<dyn RunStore>,
    cancellation: Arc<dyn CancellationCheck>,
    run_id: Uuid,
    max_concurrency: usize,
    poll_interval: Duration,
}

impl BatchRunner {
    pub fn new(
        executor: Arc<RowExecutor>,
        store: Arc<dyn RunStore>,
        cancellation: Arc<dyn CancellationCheck>,
        run_id: Uuid,
        max_concurrency: usize,
    ) -> RunnerResult<Self> {
        if max_concurrency == 0 {
            return Err(RunnerError::InvalidConcurrency);
        }
        Ok(Self {
            executor,
            store,
            cancellation,
            run_id,
            max_concurrency,
            poll_interval: Duration::from_millis(500),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub async fn run(&self, rows: Vec<Row>) -> RunnerResult<BatchOutcome> {
        let total = rows.len();
        let mut pending = rows.into_iter().enumerate();
        let mut in_flight: JoinSet<RowOutcome> = JoinSet::new();
        let mut task_rows: HashMap<tokio::task::Id, (usize, Row)> = HashMap::new();
        let mut committed: HashSet<usize> = HashSet::new();
        let mut report = BatchReport::default();
        let mut dispatched = 0usize;
        let mut discarded = 0usize;
        let mut cancelled = false;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        debug!(run_id = %self.run_id, rows = total, max_concurrency = self.max_concurrency, "Batch started");

        loop {
            while !cancelled && in_flight.len() < self.max_concurrency && dispatched < total {
                if self.cancellation.is_cancelled().await {
                    warn!(run_id = %self.run_id, dispatched, "Cancellation observed before dispatch");
                    cancelled = true;
                    break;
                }
                let Some((index, row)) = pending.next() else {
                    break;
                };
                let executor = self.executor.clone();
                let task_row = row.clone();
                let handle = in_flight.spawn(async move { executor.execute(index, &task_row).await });
                task_rows.insert(handle.id(), (index, row));
                dispatched += 1;
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next_with_id() => {
                    let Some(joined) = joined else {
                        continue;
                    };
                    let (id, outcome) = match joined {
                        Ok((id, outcome)) => (id, outcome),
                        Err(e) => (
                            e.id(),
                            RowOutcome::Failed {
                                metrics: RowMetrics::failed(0.0),
                                error: RowError::Aborted {
                                    message: e.to_string(),
                                },
                            },
                        ),
                    };
                    let Some((index, row)) = task_rows.remove(&id) else {
                        warn!(run_id = %self.run_id, "Completed task has no row");
                        continue;
                    };

                    if !cancelled && self.cancellation.is_cancelled().await {
                        warn!(run_id = %self.run_id, row = index, "Cancellation observed, draining in-flight rows");
                        cancelled = true;
                    }
                    if cancelled {
                        debug!(run_id = %self.run_id, row = index, "Discarding row finished after cancellation");
                        discarded += 1;
                        continue;
                    }
                    if !committed.insert(index) {
                        warn!(run_id = %self.run_id, row = index, "Row already committed");
                        continue;
                    }
                    if let Err(e) = self.commit(index, &row, outcome, &mut report).await {
                        in_flight.shutdown().await;
                        return Err(e);
                    }
                }
                _ = ticker.tick(), if !cancelled => {
                    if self.cancellation.is_cancelled().await {
                        warn!(run_id = %self.run_id, in_flight = in_flight.len(), "Cancellation observed while waiting");
                        cancelled = true;
                    }
                }
            }
        }

        if cancelled {
            let outcome = BatchOutcome::Cancelled {
                committed: report.committed(),
                discarded,
                not_started: total - dispatched,
            };
            info!(run_id = %self.run_id, ?outcome, "Batch cancelled");
            return Ok(outcome);
        }

        info!(
            run_id = %self.run_id,
            succeeded = report.succeeded.len(),
            failed = report.failed,
            "Batch completed"
        );
        Ok(BatchOutcome::Completed(report))
    }

    async fn commit(
        &self,
        index: usize,
        row: &Row,
        outcome: RowOutcome,
        report: &mut BatchReport,
    ) -> RunnerResult<()> {
        let commit_err = |source| RunnerError::Commit { row: index, source };
        let metrics = outcome.metrics().clone();
        let error = outcome.error().map(ToString::to_string);

        self.store
            .record_row(RowRecord {
                run_id: self.run_id,
                row_index: index,
                query: row.query(),
                parameters: row.inputs(),
                time_consumption: metrics.time_consumption,
                token_count: metrics.token_count,
                throughput: metrics.throughput,
                score: metrics.score,
                generated_answer: metrics.generated_answer.clone(),
                error,
                created_at: Utc::now(),
            })
            .await
            .map_err(commit_err)?;

        if outcome.is_success() {
            self.store
                .increment_success(self.run_id)
                .await
                .map_err(commit_err)?;
            report.succeeded.push(metrics);
        } else {
            self.store
                .increment_failure(self.run_id)
                .await
                .map_err(commit_err)?;
            report.failed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, AgentInvoker, AgentResult};
    use crate::schema::ParameterSchema;
    use crate::store::{InMemoryRunStore, StatusUpdate};
    use crate::tokenizer::RegexTokenizer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps one second per call; fails rows whose `fail` field is set.
    struct FakeAgent {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentInvoker for FakeAgent {
        async fn invoke(&self, row: &Row) -> AgentResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if row.get("fail").is_some() {
                return Err(AgentError::MissingAnswer { field: "answer" });
            }
            Ok("ok".to_string())
        }

        async fn fetch_parameters(&self) -> AgentResult<ParameterSchema> {
            Ok(ParameterSchema::default())
        }
    }

    /// Reports cancelled once `after` polls have been made.
    struct CancelAfter {
        polls: AtomicUsize,
        after: usize,
    }

    #[async_trait]
    impl CancellationCheck for CancelAfter {
        async fn is_cancelled(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= self.after
        }
    }

    async fn setup(
        agent: Arc<FakeAgent>,
        cancellation: Arc<dyn CancellationCheck>,
        concurrency: usize,
    ) -> (BatchRunner, Arc<InMemoryRunStore>, Uuid) {
        let store = Arc::new(InMemoryRunStore::new());
        let run = store.create_run(concurrency).await.unwrap();
        store
            .set_status(run.run_id, StatusUpdate::running(None))
            .await
            .unwrap();
        let executor = Arc::new(RowExecutor::new(
            agent,
            Arc::new(RegexTokenizer::new().unwrap()),
            "grade",
        ));
        let runner = BatchRunner::new(executor, store.clone(), cancellation, run.run_id, concurrency)
            .unwrap()
            .with_poll_interval(Duration::from_millis(100));
        (runner, store, run.run_id)
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::new().with_field("query", format!("q{}", i)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_concurrency_cap_and_commits_every_row() {
        let agent = FakeAgent::new();
        let never = Arc::new(CancelAfter {
            polls: AtomicUsize::new(0),
            after: usize::MAX,
        });
        let (runner, store, run_id) = setup(agent.clone(), never, 3).await;

        let mut input = rows(10);
        input[4] = Row::new().with_field("fail", "yes");
        let outcome = runner.run(input).await.unwrap();

        let BatchOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report.succeeded.len(), 9);
        assert_eq!(report.failed, 1);
        assert_eq!(agent.peak.load(Ordering::SeqCst), 3);

        let record = store.get_run(run_id).await.unwrap();
        assert_eq!(record.success_count + record.failure_count, 10);
        let stored = store.list_rows(run_id).await.unwrap();
        assert_eq!(stored.len(), 10);
        assert!(stored[4].error.is_some());
        assert_eq!(stored[0].query, "q0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_dispatch_and_discards_in_flight() {
        let agent = FakeAgent::new();
        // First poll (before row 0) passes, every later poll reports cancelled.
        let cancel = Arc::new(CancelAfter {
            polls: AtomicUsize::new(0),
            after: 1,
        });
        let (runner, store, run_id) = setup(agent.clone(), cancel, 1).await;

        let outcome = runner.run(rows(10)).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Cancelled {
                committed: 0,
                discarded: 1,
                not_started: 9,
            }
        );
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        let record = store.get_run(run_id).await.unwrap();
        assert_eq!(record.success_count + record.failure_count, 0);
        assert!(store.list_rows(run_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_cancellation_observed_on_tick() {
        let agent = FakeAgent::new();
        let store = Arc::new(InMemoryRunStore::new());
        let run = store.create_run(2).await.unwrap();
        store
            .set_status(run.run_id, StatusUpdate::running(None))
            .await
            .unwrap();
        let cancellation = Arc::new(crate::store::StoreCancellation::new(store.clone(), run.run_id));
        let executor = Arc::new(RowExecutor::new(
            agent.clone(),
            Arc::new(RegexTokenizer::new().unwrap()),
            "grade",
        ));
        let runner = BatchRunner::new(executor, store.clone(), cancellation, run.run_id, 2)
            .unwrap()
            .with_poll_interval(Duration::from_millis(100));

        let canceller = {
            let store = store.clone();
            let run_id = run.run_id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                store
                    .set_status(run_id, StatusUpdate::cancelled())
                    .await
                    .unwrap();
            })
        };

        let outcome = runner.run(rows(6)).await.unwrap();
        canceller.await.unwrap();

        // Rows 0 and 1 finish at t=1s and are committed, rows 2 and 3 start
        // and are discarded after the flag flips at t=1.5s.
        assert_eq!(
            outcome,
            BatchOutcome::Cancelled {
                committed: 2,
                discarded: 2,
                not_started: 2,
            }
        );
        let record = store.get_run(run.run_id).await.unwrap();
        assert_eq!(record.success_count, 2);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let executor = Arc::new(RowExecutor::new(
            FakeAgent::new(),
            Arc::new(RegexTokenizer::new().unwrap()),
            "grade",
        ));
        let never = Arc::new(CancelAfter {
            polls: AtomicUsize::new(0),
            after: usize::MAX,
        });
        let result = BatchRunner::new(
            executor,
            Arc::new(InMemoryRunStore::new()),
            never,
            Uuid::new_v4(),
            0,
        );
        assert!(matches!(result, Err(RunnerError::InvalidConcurrency)));
    }
}
