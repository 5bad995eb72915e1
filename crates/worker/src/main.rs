//! Job queue worker: the periodic trigger for a [`Scheduler`].
//!
//! ```text
//! forgejobs-worker                         run until Ctrl-C (or one tick with FORGEJOBS_ONESHOT=true)
//! forgejobs-worker stats                   print queue counts as JSON
//! forgejobs-worker enqueue-log <message>   dispatch a `log_message` job
//! forgejobs-worker retry <id>              requeue a failed job
//! ```
//!
//! Without `DATABASE_URL`, `run` uses an in-memory store and the other
//! commands refuse to start.

mod builtin;

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use forgejobs_infra::config::WorkerConfig;
use forgejobs_infra::jobs::{
    InMemoryJobStore, JobStore, PostgresJobStore, Scheduler, SchedulerWorker, run_tick,
};
use forgejobs_infra::JobId;

use builtin::LogMessage;

enum Command {
    Run,
    Stats,
    EnqueueLog(String),
    Retry(JobId),
}

impl Command {
    /// Whether the command only makes sense against a durable store.
    fn needs_database(&self) -> bool {
        !matches!(self, Command::Run)
    }

    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let Some(command) = args.next() else {
            return Ok(Command::Run);
        };
        match command.as_str() {
            "run" => Ok(Command::Run),
            "stats" => Ok(Command::Stats),
            "enqueue-log" => {
                let message = args.collect::<Vec<_>>().join(" ");
                if message.is_empty() {
                    bail!("usage: forgejobs-worker enqueue-log <message>");
                }
                Ok(Command::EnqueueLog(message))
            }
            "retry" => {
                let id = args.next().context("usage: forgejobs-worker retry <id>")?;
                Ok(Command::Retry(id.parse().with_context(|| format!("invalid job id {id:?}"))?))
            }
            other => bail!("unknown command {other:?}; expected run, stats, enqueue-log or retry"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    forgejobs_observability::init();

    let command = Command::parse(std::env::args().skip(1))?;
    let config = WorkerConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("forgejobs-io")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresJobStore::connect(url, config.db_max_connections, runtime.handle().clone())
                .context("failed to connect to DATABASE_URL")?;
            store.migrate()?;
            execute(command, Scheduler::new(store, builtin::registry()), &config, &runtime)
        }
        None if command.needs_database() => {
            bail!("DATABASE_URL must be set for this command; an in-memory queue does not outlive the process")
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, queued jobs are lost on exit");
            execute(command, Scheduler::new(InMemoryJobStore::new(), builtin::registry()), &config, &runtime)
        }
    }
}

fn execute<S>(
    command: Command,
    scheduler: Scheduler<S>,
    config: &WorkerConfig,
    runtime: &tokio::runtime::Runtime,
) -> anyhow::Result<()>
where
    S: JobStore + 'static,
{
    match command {
        Command::Run if config.oneshot => {
            let report = run_tick(&scheduler, config, true)?;
            info!(
                worker = %config.name,
                recovered = report.recovered,
                processed = report.processed,
                cleaned = report.cleaned.unwrap_or(0),
                "oneshot tick finished"
            );
        }
        Command::Run => {
            let handle = SchedulerWorker::spawn(Arc::new(scheduler), config.clone())
                .context("failed to spawn scheduler worker")?;

            runtime
                .block_on(tokio::signal::ctrl_c())
                .context("failed to listen for shutdown signal")?;
            info!(worker = %config.name, "shutdown signal received");

            let stats = handle.stats();
            handle.shutdown();
            info!(
                worker = %config.name,
                ticks = stats.ticks,
                processed = stats.processed,
                recovered = stats.recovered,
                cleaned = stats.cleaned,
                "worker stopped"
            );
        }
        Command::Stats => {
            let stats = scheduler.queue_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::EnqueueLog(message) => {
            let id = scheduler.dispatch(&LogMessage { message }, 0)?;
            println!("{id}");
        }
        Command::Retry(id) => {
            let record = scheduler.retry_failed(id)?;
            info!(job_id = %record.id, job_type = %record.job_type, "job requeued");
        }
    }
    Ok(())
}
