use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conveyor_core::storage::{PipelineStore, RedbIndexStore, RunStore};
use conveyor_core::workflow::{validate, DagVersionService, ExecutorRegistry, WorkflowEngine};
use conveyor_core::{DagId, PipelineId, PipelineRun, SystemClock, WorkflowService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod definition;

use config::{CliConfig, LogFormat, LoggingConfig};
use definition::PipelineDefinition;

#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(about = "Conveyor - DAG-based CI/CD pipeline runner", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conveyor.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a pipeline definition for structural errors
    Validate { file: PathBuf },

    /// Store a definition as the active DAG and run it to completion
    Run {
        file: PathBuf,

        /// Add the DAG as a new version of this pipeline instead of creating one
        #[arg(long)]
        pipeline: Option<PipelineId>,

        /// Branch to build; defaults to the pipeline's branch
        #[arg(long, default_value = "")]
        branch: String,

        #[arg(long, env = "USER", default_value = "cli")]
        user: String,
    },

    /// List the DAG versions of a pipeline, newest first
    Versions { pipeline: PipelineId },

    /// Make a DAG version the active one for its pipeline
    Activate { dag: DagId },

    /// List the runs of a pipeline, most recent first
    Runs { pipeline: PipelineId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = CliConfig::load(&args.config, args.data_dir)?;
    init_tracing(&config.logging);

    tracing::debug!("Data directory: {}", config.data_dir.display());

    match args.command {
        Command::Validate { file } => {
            let def = PipelineDefinition::load(&file)?;
            validate(&def.dag.nodes).with_context(|| format!("{} is not a valid DAG", file.display()))?;
            println!("{}: {} nodes, ok", file.display(), def.dag.nodes.len());
        }
        Command::Run {
            file,
            pipeline,
            branch,
            user,
        } => {
            let def = PipelineDefinition::load(&file)?;
            let run = run_definition(&config, &def, pipeline, &branch, &user).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if run.status != conveyor_core::RunStatus::Success {
                bail!("run {} finished with status {}", run.id, run.status);
            }
        }
        Command::Versions { pipeline } => {
            let store = open_store(&config)?;
            let versions = DagVersionService::new(store, Arc::new(SystemClock));
            for dag in versions.history(&pipeline)? {
                println!(
                    "v{:<4} {} {}  {}  {} nodes  {}",
                    dag.version,
                    if dag.is_active { "*" } else { " " },
                    dag.id,
                    dag.name,
                    dag.nodes.len(),
                    dag.created_at.to_rfc3339()
                );
            }
        }
        Command::Activate { dag } => {
            let store = open_store(&config)?;
            let versions = DagVersionService::new(store, Arc::new(SystemClock));
            versions.activate(&dag)?;
            let active = versions.get(&dag)?;
            println!("pipeline {} now runs v{}", active.pipeline_id, active.version);
        }
        Command::Runs { pipeline } => {
            let store = open_store(&config)?;
            for run in store.list_runs(&pipeline)? {
                println!(
                    "{}  {:<8} v{:<4} {:<12} {:>6}s  {}",
                    run.id, run.status, run.dag_version, run.branch, run.duration_secs, run.triggered_by
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter.as_str().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn open_store(config: &CliConfig) -> Result<Arc<RedbIndexStore>> {
    Ok(Arc::new(
        RedbIndexStore::new(config.index_path()).context("Failed to create index store")?,
    ))
}

/// Register the definition's DAG as active, trigger a run and follow it
/// until it finishes. Ctrl-C cancels the run.
async fn run_definition(
    config: &CliConfig,
    def: &PipelineDefinition,
    pipeline_id: Option<PipelineId>,
    branch: &str,
    user: &str,
) -> Result<PipelineRun> {
    let store = open_store(config)?;
    let clock = Arc::new(SystemClock);

    let pipeline = match pipeline_id {
        Some(id) => store
            .get_pipeline(&id)?
            .with_context(|| format!("pipeline {id} not found"))?,
        None => {
            let pipeline = def.to_pipeline();
            store.put_pipeline(&pipeline)?;
            tracing::info!(pipeline_id = %pipeline.id, name = %pipeline.name, "Created pipeline");
            pipeline
        }
    };

    let versions = DagVersionService::new(store.clone(), clock.clone());
    let dag = versions.create(def.to_dag(pipeline.id).active())?;

    let engine = Arc::new(WorkflowEngine::new(
        ExecutorRegistry::with_reference_executors(),
        clock.clone(),
    ));
    let service = WorkflowService::new(engine, store, clock, config.workflow.policy()?);

    let run = service.trigger_workflow(&pipeline.id, user, branch).await?;
    tracing::info!(
        run_id = %run.id,
        pipeline_id = %pipeline.id,
        dag_version = dag.version,
        "Run started"
    );

    let mut poll = tokio::time::interval(Duration::from_millis(250));
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = poll.tick() => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for ctrl-c")?;
                tracing::warn!(run_id = %run.id, "Interrupted, canceling run");
                service.cancel_workflow(&run.id)?;
                interrupted = true;
            }
        }

        let current = service.get_run(&run.id)?;
        if current.status.is_terminal() && !service.is_running(&run.id) {
            return Ok(current);
        }
    }
}
