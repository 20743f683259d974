//! # sqlbatch-server
//!
//! Runs queued SQL jobs against tenant databases.
//!
//! ## Overview
//!
//! - `run` (default): start the worker, drain on SIGINT/SIGTERM
//! - `submit`: queue a job for a user
//! - `status` / `cancel`: inspect or stop a job
//! - `recover`: requeue jobs orphaned by a worker that died mid-run

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlbatch_core::batch::JobId;
use sqlbatch_server::infra::{
    app_context::AppContext,
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    shutdown::install_shutdown_handler,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "sqlbatch-server")]
#[command(about = "Batch worker that runs queued SQL jobs against tenant databases")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "SQLBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the worker and drain on SIGINT/SIGTERM
    Run,
    /// Queue a job and print its id
    Submit {
        #[arg(long)]
        user: String,
        #[arg(long)]
        query: String,
        /// Database host; looked up from the user's metadata when omitted
        #[arg(long)]
        host: Option<String>,
    },
    /// Print a job record as JSON
    Status { job_id: JobId },
    /// Cancel a pending or running job
    Cancel { job_id: JobId },
    /// Requeue jobs left running by a worker that is gone
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;
    let context = AppContext::connect(config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_worker(context).await,
        Command::Submit { user, query, host } => {
            let job = context
                .submitter()
                .submit(&user, &query, host.as_deref())
                .await
                .with_context(|| format!("failed to submit job for {user}"))?;
            println!("{}", job.job_id);
            Ok(())
        }
        Command::Status { job_id } => {
            let job = context
                .jobs()
                .get(&job_id)
                .await
                .with_context(|| format!("failed to load job {job_id}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Cancel { job_id } => {
            let job = context
                .jobs()
                .cancel(&job_id)
                .await
                .with_context(|| format!("failed to cancel job {job_id}"))?;
            println!("{} {}", job.job_id, job.status);
            Ok(())
        }
        Command::Recover => {
            let report = context
                .jobs()
                .recover_orphaned_jobs(context.queue())
                .await
                .context("orphan recovery failed")?;
            info!(
                requeued = report.requeued.len(),
                cleared = report.cleared.len(),
                "orphan recovery complete"
            );
            for job_id in &report.requeued {
                println!("requeued {job_id}");
            }
            Ok(())
        }
    }
}

async fn run_worker(context: AppContext) -> anyhow::Result<()> {
    let shutdown = install_shutdown_handler()?;
    let batch = context.batch()?;

    batch.start().await.context("failed to start batch worker")?;
    info!(name = %batch.name(), "worker running");

    shutdown.cancelled().await;

    let report = batch.drain().await;
    for (user, job_id, reason) in &report.failures {
        warn!(user = %user, job_id = %job_id, reason = %reason, "job could not be drained");
    }
    if !report.is_clean() {
        anyhow::bail!(
            "drain left {} job(s) unresolved; run `sqlbatch-server recover`",
            report.failures.len()
        );
    }
    info!(
        requeued = report.requeued.len(),
        skipped = report.skipped.len(),
        "worker stopped"
    );
    Ok(())
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Arc<Config>> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,batch::scheduler=info,batch::jobs=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    info!(
        batch.name = %config.batch.name,
        batch.capacity_strategy = ?config.batch.capacity.strategy,
        batch.schedule_interval_ms = config.batch.schedule_interval_ms,
        batch.query_timeout_ms = ?config.batch.query_timeout_ms,
        batch.max_queued_jobs = config.batch.max_queued_jobs,
        database.batch_port = config.database.batch_port,
        "batch configuration in effect"
    );

    Ok(Arc::new(config))
}
