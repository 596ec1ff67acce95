pub mod agent;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod metrics;
pub mod row;
pub mod runner;
pub mod schema;
pub mod store;
pub mod tokenizer;

pub use agent::{AgentEndpoint, AgentError, AgentInvoker, AgentResult, AgentType, HttpAgentClient};
pub use config::{BenchConfig, ConfigError, ConfigResult, JudgeSettings, RunSettings};
pub use dataset::{Dataset, DatasetError, DatasetResult, FieldValue, Row};
pub use engine::{
    BatchEngine, EngineError, EngineResult, EngineSettings, RunMode, StartOutcome, EXPERIMENT_ROWS,
};
pub use metrics::{aggregate, throughput, MetricsError, RowMetrics, RunSummary};
pub use row::{RowError, RowExecutor, RowOutcome};
pub use runner::{BatchOutcome, BatchReport, BatchRunner, RunnerError};
pub use schema::{InputParameter, ParamKind, ParameterSchema, SchemaError};
pub use store::{
    CancellationCheck, InMemoryRunStore, RowRecord, RunRecord, RunStatus, RunStore,
    StatusUpdate, StoreCancellation, StoreError, StoreResult,
};
pub use tokenizer::{RegexTokenizer, Tokenizer};
