use clap::{Parser, Subcommand};
use harness::{
    AgentInvoker, BatchEngine, BenchConfig, HttpAgentClient, InMemoryRunStore,
    RegexTokenizer, RunMode, RunStore, StatusUpdate,
};
use model::{JudgeDispatcher, ProviderRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-bench")]
#[command(about = "Replay a dataset against an agent and score its answers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark over a dataset
    Run {
        /// Benchmark configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Dataset file (.json or .jsonl)
        #[arg(short, long)]
        dataset: PathBuf,
        /// Only run the first rows as a preview
        #[arg(long)]
        experiment: bool,
        /// Override the configured concurrency
        #[arg(long)]
        concurrency: Option<usize>,
        /// Also print every stored row result
        #[arg(long)]
        rows: bool,
    },
    /// Show the input parameters the agent declares
    Schema {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Probe the configured judge candidates and report which one binds
    Judge {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            dataset,
            experiment,
            concurrency,
            rows,
        } => {
            let mode = if experiment {
                RunMode::Experiment
            } else {
                RunMode::Full
            };
            run_benchmark(&config, &dataset, mode, concurrency, rows).await?;
        }
        Commands::Schema { config } => {
            show_schema(&config).await?;
        }
        Commands::Judge { config } => {
            probe_judge(&config).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path, concurrency: Option<usize>) -> Result<BenchConfig, Box<dyn std::error::Error>> {
    let mut config = BenchConfig::from_path(path)?;
    if let Some(concurrency) = concurrency {
        config = config.with_concurrency(concurrency);
        config.validate()?;
    }
    Ok(config)
}

async fn run_benchmark(
    config_path: &Path,
    dataset_path: &Path,
    mode: RunMode,
    concurrency: Option<usize>,
    print_rows: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, concurrency)?;

    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let agent = HttpAgentClient::new(config.agent.clone(), config.request_timeout())?;
    let dispatcher = JudgeDispatcher::new(ProviderRegistry::with_defaults(config.judge_config()));
    let engine = BatchEngine::new(
        store.clone(),
        Arc::new(agent),
        Arc::new(dispatcher),
        Arc::new(RegexTokenizer::new()?),
        config.engine_settings(),
    );

    let run = store.create_run(config.run.concurrency).await?;
    let run_id = run.run_id;
    println!(
        "Run {} ({}, concurrency {})",
        run_id,
        dataset_path.display(),
        run.concurrency
    );

    let cancel_store = store.clone();
    let cancel_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(%run_id, "Interrupted, cancelling run");
            if let Err(e) = cancel_store.set_status(run_id, StatusUpdate::cancelled()).await {
                error!(error = %e, "Could not cancel run");
            }
        }
    });

    let outcome = engine.start_from_path(run_id, dataset_path, mode).await;
    cancel_task.abort();
    let outcome = outcome?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if print_rows {
        for row in store.list_rows(run_id).await? {
            println!("{}", serde_json::to_string(&row)?);
        }
    }

    Ok(())
}

async fn show_schema(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, None)?;
    let agent = HttpAgentClient::new(config.agent.clone(), config.request_timeout())?;

    println!("Fetching parameters from {}...", config.agent.base_url);
    let schema = agent.fetch_parameters().await?;

    if schema.parameters.is_empty() {
        println!("  The agent declares no input parameters.");
    } else {
        for param in &schema.parameters {
            println!(
                "  - {} ({}{}){}",
                param.variable,
                param.kind,
                if param.required { ", required" } else { "" },
                param
                    .max_length
                    .map(|m| format!(" max_length={}", m))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

async fn probe_judge(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path, None)?;
    let candidates = &config.judge.candidates;
    println!("Probing {} judge candidate(s)...", candidates.len());

    let dispatcher = JudgeDispatcher::new(ProviderRegistry::with_defaults(config.judge_config()));
    match dispatcher.bind(candidates).await {
        Some(handle) => {
            println!(
                "✓ Bound judge {} ({})",
                handle.candidate().name,
                handle.family()
            );
            info!(candidate = %handle.candidate().name, "Judge probe successful");
        }
        None => {
            println!("✗ No judge candidate responded.");
            error!("Judge probe failed for every candidate");
            return Err("no judge candidate could be bound".into());
        }
    }

    Ok(())
}
