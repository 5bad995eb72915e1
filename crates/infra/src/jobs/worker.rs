//! Periodic trigger driving a [`Scheduler`] from a background thread.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use forgejobs_core::Clock;

use super::scheduler::Scheduler;
use super::store::{JobStore, JobStoreError};
use crate::config::WorkerConfig;

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub processed: u64,
    pub recovered: u64,
    pub cleaned: u64,
    pub last_error: Option<String>,
    pub uptime_secs: u64,
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: u64,
    pub processed: usize,
    /// `None` when cleanup was not due this tick
    pub cleaned: Option<u64>,
}

/// Run one trigger cycle: recover stuck records, process a batch, and
/// optionally apply retention.
pub fn run_tick<S, C>(
    scheduler: &Scheduler<S, C>,
    config: &WorkerConfig,
    cleanup: bool,
) -> Result<TickReport, JobStoreError>
where
    S: JobStore,
    C: Clock,
{
    let recovered = scheduler.reset_stuck()?;
    let processed = scheduler.process_queue(config.batch_size)?;
    let cleaned = if cleanup {
        Some(scheduler.cleanup(config.retention_days)?)
    } else {
        None
    };

    Ok(TickReport {
        recovered,
        processed,
        cleaned,
    })
}

/// Background thread calling [`run_tick`] every `poll_interval`.
///
/// Store errors end the tick, are logged, and are retried on the next one.
/// A full batch skips the wait so a backlog drains without idling.
#[derive(Debug)]
pub struct SchedulerWorker;

impl SchedulerWorker {
    pub fn spawn<S, C>(scheduler: Arc<Scheduler<S, C>>, config: WorkerConfig) -> std::io::Result<WorkerHandle>
    where
        S: JobStore + 'static,
        C: Clock + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(&scheduler, &config, shutdown_rx, &stats_clone))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S, C>(
    scheduler: &Scheduler<S, C>,
    config: &WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) where
    S: JobStore,
    C: Clock,
{
    info!(
        worker = %config.name,
        batch_size = config.batch_size,
        poll_interval_secs = config.poll_interval.as_secs(),
        "scheduler worker started"
    );
    let start_time = Instant::now();
    let mut last_cleanup: Option<Instant> = None;

    loop {
        let cleanup_due = last_cleanup.is_none_or(|at| at.elapsed() >= config.cleanup_interval);
        let result = run_tick(scheduler, config, cleanup_due);

        let mut wait = config.poll_interval;
        {
            let mut s = stats.lock().unwrap();
            s.ticks += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(report) => {
                    s.processed += report.processed as u64;
                    s.recovered += report.recovered;
                    if let Some(cleaned) = report.cleaned {
                        s.cleaned += cleaned;
                    }
                }
                Err(e) => {
                    s.failed_ticks += 1;
                    s.last_error = Some(e.to_string());
                }
            }
        }

        match result {
            Ok(report) => {
                if report.cleaned.is_some() {
                    last_cleanup = Some(Instant::now());
                }
                if report.processed >= config.batch_size {
                    wait = Duration::ZERO;
                }
                debug!(worker = %config.name, ?report, "tick finished");
            }
            Err(e) => {
                error!(worker = %config.name, error = %e, "tick failed; retrying next interval");
            }
        }

        match shutdown_rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "scheduler worker stopped");
}
