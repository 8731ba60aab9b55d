//! # jobchain: scheduled batch job chains
//!
//! Usage:
//!   jobchain serve                        # Fire the chain on the configured cron
//!   jobchain run                          # One execution now, exit 1 on failure
//!   jobchain run --at 2024-05-06T12:00:00Z
//!   jobchain status --date 2024-05-06     # Records of one day
//!   jobchain status --job job0001         # Recent history of one job
//!   jobchain validate                     # Check the config and exit
//!   jobchain init                         # Write a starter config
//!   jobchain --config ./jobchain.toml init

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use jobchain_core::config::StoreConfig;
use jobchain_core::{Invocation, InvocationRecord, JobDefinition, JobchainConfig, TaskSpec};
use jobchain_scheduler::{
    CronSchedule, JobOutcome, Orchestrator, OrchestratorReport, SchedulerTrigger, StatusStore,
    notifier_from_config, runner_from_config, store_from_config,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "jobchain",
    version,
    about = "⛓️ jobchain: scheduled, once-per-day batch job chains"
)]
struct Cli {
    /// Config file (default: ~/.jobchain/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Serve,
    /// Execute the job chain once and exit
    Run {
        /// Invocation timestamp (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// Show recorded job outcomes
    Status {
        /// Invocation date (YYYY-MM-DD); defaults to today (UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Show the history of one job instead of one day
        #[arg(long)]
        job: Option<String>,
        /// Entries of history to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Check the configuration and exit
    Validate,
    /// Write a starter config to --config or the default path
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "jobchain=debug,jobchain_scheduler=debug,jobchain_core=debug"
    } else {
        "jobchain=info,jobchain_scheduler=info,jobchain_core=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<JobchainConfig> {
    let config = match &cli.config {
        Some(path) => JobchainConfig::load_from(path)?,
        None => JobchainConfig::load()?,
    };
    Ok(config)
}

fn open_store(config: &StoreConfig) -> Result<Arc<dyn StatusStore>> {
    let expanded = StoreConfig {
        path: shellexpand::tilde(&config.path).to_string(),
        ..config.clone()
    };
    store_from_config(&expanded).context("opening status store")
}

fn build_orchestrator(config: &JobchainConfig) -> Result<Orchestrator> {
    config.validate()?;
    let store = open_store(&config.store)?;
    let runner = runner_from_config(&config.runner);
    let notifier = notifier_from_config(&config.notify)?;
    tracing::info!(
        "📦 {} jobs, store={}, runner={}, notify={}",
        config.jobs.len(),
        store.name(),
        runner.name(),
        notifier.name()
    );
    Ok(Orchestrator::from_config(config, store, runner, notifier)?)
}

fn print_report(report: &OrchestratorReport) {
    println!("⛓️  Execution for {} (invoked {})", report.invocation.date(), report.invocation);
    for run in &report.jobs {
        let icon = match run.outcome {
            JobOutcome::Skipped => "⏭️ ",
            JobOutcome::Succeeded => "✅",
            JobOutcome::Failed(_) => "❌",
        };
        println!("   {icon} {:<16} {} ({:.1}s)", run.job_id, run.outcome, run.elapsed.as_secs_f64());
    }
    for id in &report.not_run {
        println!("   ⏸️  {id:<16} NOT RUN");
    }
    match &report.outcome {
        jobchain_scheduler::OrchestratorOutcome::Succeeded => println!("🏁 Succeeded"),
        jobchain_scheduler::OrchestratorOutcome::Failed(failure) => println!("💥 Failed: {failure}"),
    }
}

fn print_records(records: &[InvocationRecord]) {
    if records.is_empty() {
        println!("(no records)");
        return;
    }
    for r in records {
        if r.message.is_empty() {
            println!("{}  {:<16} {}", r.invocation_date, r.job_id, r.status);
        } else {
            println!("{}  {:<16} {}  {}", r.invocation_date, r.job_id, r.status, r.message);
        }
    }
}

fn starter_config() -> JobchainConfig {
    let mut task = TaskSpec::image("registry.example.com/batch:latest");
    task.command = vec!["./run-batch".into()];
    JobchainConfig {
        jobs: vec![
            JobDefinition::new("job0001", task.clone()),
            JobDefinition::new("job0002", task),
        ],
        ..JobchainConfig::default()
    }
}

fn write_starter_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    starter_config().save_to(path)?;
    Ok(())
}

async fn serve(config: JobchainConfig) -> Result<ExitCode> {
    let schedule = CronSchedule::parse(&config.scheduler.cron)?;
    if !config.scheduler.enabled {
        tracing::warn!("⚠️ scheduler.enabled = false; nothing to serve");
        return Ok(ExitCode::SUCCESS);
    }
    let orchestrator = Arc::new(build_orchestrator(&config)?);
    let trigger = SchedulerTrigger::new(orchestrator, schedule);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("🛑 Shutdown requested");
    };
    trigger.run(shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli);

    match &cli.command {
        Command::Serve => serve(load_config(&cli)?).await,

        Command::Run { at } => {
            let config = load_config(&cli)?;
            let invocation = match at {
                Some(raw) => Invocation::parse(raw)?,
                None => Invocation::now(),
            };
            let report = build_orchestrator(&config)?.run(invocation).await;
            print_report(&report);
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Status { date, job, limit } => {
            let config = load_config(&cli)?;
            let store = open_store(&config.store)?;
            let records = match job {
                Some(job_id) => store.history(job_id, *limit).await?,
                None => {
                    let date = date.unwrap_or_else(|| Utc::now().date_naive());
                    store.list_by_date(date).await?
                }
            };
            print_records(&records);
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate => {
            let config = load_config(&cli)?;
            config.validate()?;
            let schedule = CronSchedule::parse(&config.scheduler.cron)?;
            println!("✅ Config OK: {} jobs, cron '{}' (UTC)", config.jobs.len(), schedule);
            if let Some(next) = schedule.next_after(Utc::now()) {
                println!("   Next fire: {next}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(JobchainConfig::default_path);
            write_starter_config(&path, *force)?;
            println!("📝 Wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
