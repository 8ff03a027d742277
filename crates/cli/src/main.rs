//! `taskflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a workflow JSON file and print its batch layering.
//! - `run`      — execute a workflow JSON file and print the result.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use engine::{
    EngineConfig, HandlerRegistry, Observer, TracingObserver, WorkflowDefinition, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "taskflow", about = "DAG workflow execution engine", version)]
struct Cli {
    /// Log level or filter directive (e.g. `debug`, `engine=trace`).
    /// Falls back to `RUST_LOG`, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run a workflow definition JSON file to completion.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,

        /// Maximum number of task bodies running at once.
        #[arg(long, env = "TASKFLOW_MAX_WORKERS")]
        max_workers: Option<usize>,

        /// Number of pooled resource handles.
        #[arg(long, env = "TASKFLOW_POOL_SIZE")]
        pool_size: Option<usize>,

        /// Base delay before the first retry, doubled per attempt.
        #[arg(long, env = "TASKFLOW_RETRY_BASE_DELAY_MS")]
        retry_base_delay_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Validate { path } => {
            let def = load_definition(&path)?;

            match def.build(&HandlerRegistry::builtin()).and_then(|dag| dag.layers()) {
                Ok(layers) => {
                    println!("Workflow '{}' is valid. Batches:", def.id);
                    for (i, batch) in layers.iter().enumerate() {
                        println!("  {}: {}", i + 1, batch.join(", "));
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Command::Run {
            path,
            max_workers,
            pool_size,
            retry_base_delay_ms,
        } => {
            let mut config = EngineConfig::default();
            if let Some(n) = max_workers {
                config = config.with_max_workers(n);
            }
            if let Some(n) = pool_size {
                config = config.with_pool_size(n);
            }
            if let Some(ms) = retry_base_delay_ms {
                config = config.with_retry_base_delay(Duration::from_millis(ms));
            }

            let def = load_definition(&path)?;
            let dag = def
                .build(&HandlerRegistry::builtin())
                .with_context(|| format!("invalid workflow '{}'", def.id))?;

            info!(
                workflow_id = %def.id,
                tasks = dag.len(),
                max_workers = config.max_workers,
                pool_size = config.pool_size,
                "starting run"
            );

            let engine = WorkflowEngine::with_config(&config);
            let observer: Arc<dyn Observer> = Arc::new(TracingObserver);
            engine.attach(&observer);

            let result = engine.run(dag).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if result.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                error!(
                    failed = result.failed.len(),
                    unresolved = result.unresolved.len(),
                    "workflow finished with failures"
                );
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    WorkflowDefinition::from_json(&content)
        .with_context(|| format!("invalid workflow JSON in {}", path.display()))
}
