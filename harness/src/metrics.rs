use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MetricsError {
    #[error("Cannot aggregate an empty result set")]
    EmptyResults,
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Tokens per second, defined as zero for non-positive or non-finite durations.
pub fn throughput(token_count: usize, time_consumption: f64) -> f64 {
    if !time_consumption.is_finite() || time_consumption <= 0.0 {
        return 0.0;
    }
    token_count as f64 / time_consumption
}

/// Measurements of one agent call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMetrics {
    /// Seconds spent in the agent call
    pub time_consumption: f64,
    pub token_count: usize,
    /// Tokens per second
    pub throughput: f64,
    pub score: f64,
    pub generated_answer: String,
}

impl RowMetrics {
    pub fn new(time_consumption: f64, token_count: usize, score: f64, generated_answer: String) -> Self {
        Self {
            time_consumption,
            token_count,
            throughput: throughput(token_count, time_consumption),
            score,
            generated_answer,
        }
    }

    /// Metrics of a failed call: only the elapsed time is kept.
    pub fn failed(time_consumption: f64) -> Self {
        Self {
            time_consumption,
            token_count: 0,
            throughput: 0.0,
            score: 0.0,
            generated_answer: String::new(),
        }
    }
}

/// Run-level statistics over the successful rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub avg_time_consumption: f64,
    pub avg_token_count: f64,
    pub avg_throughput: f64,
    pub avg_score: f64,
    pub total_time_consumption: f64,
}

/// Means of every metric plus the summed time. Fails on empty input.
pub fn aggregate(results: &[RowMetrics]) -> MetricsResult<RunSummary> {
    if results.is_empty() {
        return Err(MetricsError::EmptyResults);
    }
    let n = results.len() as f64;
    let sum = |f: fn(&RowMetrics) -> f64| results.iter().map(f).sum::<f64>();

    let total_time_consumption = sum(|m| m.time_consumption);
    Ok(RunSummary {
        avg_time_consumption: total_time_consumption / n,
        avg_token_count: sum(|m| m.token_count as f64) / n,
        avg_throughput: sum(|m| m.throughput) / n,
        avg_score: sum(|m| m.score) / n,
        total_time_consumption,
    })
}
