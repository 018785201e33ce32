/*!
 * fts-submit CLI
 *
 * `once` runs a single invocation for an external scheduler, `run` polls
 * until interrupted and `audit` lists jobs whose bookkeeping is incomplete.
 */

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use fts_submit::{
    config::AgentConfig,
    error::{SubmitError, EXIT_FATAL, EXIT_SUCCESS},
    logging, CommandCredentialProvider, CommandTransferBackend, CredentialGuard,
    CredentialSettings, ExecutionReport, SubmissionLimits, SubmitAgent,
};
use transfer_db::SqliteStore;

#[derive(Parser)]
#[command(name = "fts-submit")]
#[command(version, about = "Submit queued channel files as bulk transfer jobs", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Work-queue database (overrides database_path)
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Verbose output (debug level)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file instead of stdout
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one invocation and exit
    Once,
    /// Run an invocation every polling interval until Ctrl-C
    Run,
    /// List jobs whose recorded file count disagrees with their links
    Audit {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<SubmitError>()
                .map(SubmitError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init_logging(&config)?;

    let db_path = config.database_path.to_string_lossy().into_owned();
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("cannot open work-queue database {}", db_path))?;

    match cli.command {
        Commands::Once => {
            let agent = build_agent(store, &config);
            summarize(&agent.execute().await);
        }
        Commands::Run => {
            let agent = build_agent(store, &config);
            let interval = Duration::from_secs(config.polling_interval_secs);
            info!(interval_secs = config.polling_interval_secs, "Submission agent started");

            loop {
                summarize(&agent.execute().await);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        Commands::Audit { json } => audit(&store, json).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if cli.verbose {
        config.verbose = true;
    }
    if cli.log_file.is_some() {
        config.log_file = cli.log_file.clone();
    }

    // Audit only reads the database
    if !matches!(cli.command, Commands::Audit { .. }) {
        config.validate()?;
    }
    Ok(config)
}

fn build_agent(
    store: SqliteStore,
    config: &AgentConfig,
) -> SubmitAgent<SqliteStore, CommandTransferBackend, CommandCredentialProvider> {
    let guard = CredentialGuard::new(
        CommandCredentialProvider::new(config.credential.clone()),
        CredentialSettings::from_config(config),
    );
    SubmitAgent::new(
        store,
        CommandTransferBackend::new(config.backend.clone()),
        guard,
        SubmissionLimits::from_config(config),
    )
}

fn summarize(report: &ExecutionReport) {
    match report {
        ExecutionReport::CredentialUnavailable { reason } => {
            warn!(reason = %reason, "Invocation skipped, no credential");
        }
        ExecutionReport::Completed { started_at, cycles } => {
            info!(
                started_at = %started_at,
                cycles = cycles.len(),
                submitted = report.submitted().count(),
                failed = report.failures(),
                "Invocation finished"
            );
        }
    }
}

async fn audit(store: &SqliteStore, json: bool) -> anyhow::Result<()> {
    let jobs = store.find_inconsistent_jobs().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No inconsistent jobs");
        return Ok(());
    }

    println!("{:>8}  {:<38}  {:>8}  {:>8}  {:>8}", "JOB", "GUID", "CHANNEL", "RECORDED", "LINKED");
    for job in &jobs {
        let recorded = job
            .recorded_files
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>8}  {:<38}  {:>8}  {:>8}  {:>8}",
            job.job_id, job.guid, job.channel_id, recorded, job.linked_files
        );
    }
    Ok(())
}
