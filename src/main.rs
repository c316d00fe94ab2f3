use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dbsp_lite::config::{MasterConfig, WorkerConfig, DEFAULT_LISTEN_ADDR};
use dbsp_lite::job::dry_run::DryRunJobRunner;
use dbsp_lite::job::serializer::JsonSerializer;
use dbsp_lite::master::Master;
use dbsp_lite::shutdown::install_shutdown_handler;
use dbsp_lite::worker::Worker;
use dbsp_lite::DbspError;

#[derive(Parser, Debug)]
#[command(name = "dbsp-lite")]
#[command(version)]
#[command(about = "Distributed bulk-synchronous graph job coordination")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a master that spreads jobs across connected workers
    Master(MasterArgs),

    /// Run a worker that executes jobs assigned by a master
    Worker(WorkerArgs),
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Address to accept worker connections on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Number of workers each job is partitioned across
    #[arg(long, default_value = "1")]
    min_workers: usize,

    /// Give up on a job if not enough workers are idle within this many
    /// milliseconds (waits forever when unset)
    #[arg(long)]
    acquire_timeout_ms: Option<u64>,

    /// Number of jobs to run before exiting (runs until interrupted when unset)
    #[arg(long)]
    jobs: Option<u64>,

    /// Pause between consecutive jobs, in milliseconds
    #[arg(long, default_value = "1000")]
    job_interval_ms: u64,

    /// Job report format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Master address (host:port)
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    master: String,

    /// Timeout for connecting to the master, in milliseconds
    #[arg(long, default_value = "10000")]
    dial_timeout_ms: u64,

    /// Number of jobs to take part in before exiting (runs until interrupted
    /// when unset)
    #[arg(long)]
    jobs: Option<u64>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JobReport {
    job: u64,
    status: &'static str,
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_report(report: &JobReport, format: &OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error: unable to encode job report: {}", e),
        },
        OutputFormat::Table => {
            println!(
                "Job {:<6} {:<10} {:>8} ms  {}",
                report.job,
                report.status,
                report.duration_ms,
                report.error.as_deref().unwrap_or("")
            );
        }
    }
}

// =============================================================================
// Master
// =============================================================================

async fn run_master(
    args: MasterArgs,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let runner = Arc::new(DryRunJobRunner::new());
    let mut config = MasterConfig::new(args.listen, runner.clone(), Arc::new(JsonSerializer))
        .with_min_workers(args.min_workers);
    if let Some(ms) = args.acquire_timeout_ms {
        config = config.with_worker_acquire_timeout(Duration::from_millis(ms));
    }

    let master = Master::new(config)?;
    master.start(&shutdown).await?;

    let mut job = 0;
    while args.jobs.map_or(true, |limit| job < limit) && !shutdown.is_cancelled() {
        job += 1;
        let started = Instant::now();
        let result = master.run_job(&shutdown).await;
        let report = JobReport {
            job,
            status: match &result {
                Ok(()) => "completed",
                Err(DbspError::ReservationFailed { .. }) => "no-workers",
                Err(e) if e.is_job_aborted() => "aborted",
                Err(_) => "failed",
            },
            duration_ms: started.elapsed().as_millis(),
            error: result.err().map(|e| e.to_string()),
        };
        print_report(&report, &args.output);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(args.job_interval_ms)) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    tracing::info!(
        completed = runner.completed_jobs(),
        aborted = runner.aborted_jobs(),
        "Master shutting down"
    );
    master.close().await?;
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(
    args: WorkerArgs,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::new(Arc::new(DryRunJobRunner::new()), Arc::new(JsonSerializer))
        .with_dial_timeout(Duration::from_millis(args.dial_timeout_ms));
    let worker = Worker::new(config)?;
    worker.dial(&args.master).await?;

    let mut jobs = 0;
    while args.jobs.map_or(true, |limit| jobs < limit) && !shutdown.is_cancelled() {
        match worker.run_job(&shutdown).await {
            Ok(()) => jobs += 1,
            Err(DbspError::Cancelled) => break,
            Err(e) if e.is_job_aborted() => {
                jobs += 1;
                tracing::warn!(error = %e, "Job aborted");
            }
            Err(e) => {
                // Connection level failure; back off before redialing.
                tracing::error!(error = %e, "Unable to run job");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    worker.close().await?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = install_shutdown_handler()?;

    match args.command {
        Commands::Master(master_args) => run_master(master_args, shutdown).await,
        Commands::Worker(worker_args) => run_worker(worker_args, shutdown).await,
    }
}
