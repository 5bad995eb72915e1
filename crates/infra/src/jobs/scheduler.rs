//! Scheduler: enqueues jobs and drives their execution through the state machine.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use forgejobs_core::{Clock, JobError, JobId, SystemClock};

use super::job::{Job, validate_payload};
use super::registry::JobRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{ClaimToken, FailureOutcome, JobRecord, JobStatus, NewJobRecord, QueueStats, add_secs};

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job {id} is {status}, expected failed")]
    InvalidState { id: JobId, status: JobStatus },
}

/// Converts jobs into persisted records and executes ready records.
///
/// The scheduler owns every record state transition. It has no timer of its
/// own: a host calls [`Scheduler::process_queue`] and [`Scheduler::reset_stuck`]
/// periodically (see `SchedulerWorker`, or an external cron).
///
/// Job-level failures never escape `process_queue`; they are absorbed into
/// record state. Store failures are returned to the caller untouched.
///
/// Several threads (or processes sharing a store) may call `process_queue`
/// concurrently: each record is claimed atomically before it runs, so a
/// record has at most one active execution at any instant. An execution's
/// result is only saved while its claim still holds; once `reset_stuck` has
/// recovered the record, a late finisher's result is discarded.
pub struct Scheduler<S, C = SystemClock> {
    store: S,
    registry: Arc<JobRegistry>,
    clock: C,
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(store: S, registry: impl Into<Arc<JobRegistry>>) -> Self {
        Self::with_clock(store, registry, SystemClock)
    }
}

impl<S: JobStore, C: Clock> Scheduler<S, C> {
    pub fn with_clock(store: S, registry: impl Into<Arc<JobRegistry>>, clock: C) -> Self {
        Self {
            store,
            registry: registry.into(),
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Enqueue a job to become eligible `delay_seconds` from now.
    ///
    /// Nothing runs synchronously; the job's policy is frozen into the record.
    pub fn dispatch(&self, job: &dyn Job, delay_seconds: u64) -> Result<JobId, SchedulerError> {
        let payload = job.payload()?;
        validate_payload(&payload)?;

        let now = self.clock.now();
        let record = NewJobRecord {
            job_type: job.job_type().to_string(),
            payload,
            policy: job.retry_policy(),
            scheduled_at: add_secs(now, delay_seconds),
            created_at: now,
        };
        let scheduled_at = record.scheduled_at;

        let id = self.store.insert(record)?;
        debug!(
            job_id = %id,
            job_type = job.job_type(),
            %scheduled_at,
            "job dispatched"
        );
        Ok(id)
    }

    /// Run up to `limit` ready jobs sequentially, oldest-ready first.
    ///
    /// Returns how many records this call claimed and processed. Records
    /// claimed by another worker in the meantime are skipped.
    pub fn process_queue(&self, limit: usize) -> Result<usize, JobStoreError> {
        let candidates = self.store.find_ready(limit, self.clock.now())?;
        if candidates.is_empty() {
            debug!("no ready jobs");
            return Ok(0);
        }

        let mut processed = 0;
        for candidate in candidates {
            if self.process_record(candidate.id)? {
                processed += 1;
            }
        }

        info!(processed, limit, "processed job batch");
        Ok(processed)
    }

    /// Claim one record and run it to its next state.
    fn process_record(&self, id: JobId) -> Result<bool, JobStoreError> {
        // The claim persists `running` before any user code executes, so a
        // crash from here on leaves a record `reset_stuck` can recover.
        let Some(mut record) = self.store.claim(id, self.clock.now())? else {
            debug!(job_id = %id, "job already claimed by another worker");
            return Ok(false);
        };
        let Some(claim) = record.claim_token() else {
            return Err(JobStoreError::Corrupt(format!(
                "claimed job {id} came back as {}",
                record.status
            )));
        };

        debug!(
            job_id = %record.id,
            job_type = %record.job_type,
            attempt = record.attempts,
            max_attempts = record.policy.max_attempts,
            "job claimed"
        );

        let job = match self.registry.build(&record.job_type, &record.payload) {
            Ok(job) => job,
            Err(err) => {
                self.fail_unrunnable(&mut record, claim, err)?;
                return Ok(true);
            }
        };

        let started = Instant::now();
        let result = run_guarded(|| job.handle());
        let elapsed = started.elapsed();

        if elapsed.as_secs() > record.policy.timeout_seconds {
            warn!(
                job_id = %record.id,
                job_type = %record.job_type,
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = record.policy.timeout_seconds,
                "job ran past its timeout"
            );
        }

        let now = self.clock.now();
        match result {
            Ok(()) => {
                record.mark_completed(now);
                if !self.save_claimed(&record, claim)? {
                    return Ok(true);
                }
                debug!(
                    job_id = %record.id,
                    job_type = %record.job_type,
                    attempt = record.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job completed"
                );
            }
            Err(message) => match record.mark_attempt_failed(message.clone(), now) {
                FailureOutcome::Rescheduled { next_attempt_at } => {
                    if !self.save_claimed(&record, claim)? {
                        return Ok(true);
                    }
                    warn!(
                        job_id = %record.id,
                        job_type = %record.job_type,
                        attempt = record.attempts,
                        max_attempts = record.policy.max_attempts,
                        next_retry_at = %next_attempt_at,
                        error = %message,
                        "job failed, retry scheduled"
                    );
                }
                FailureOutcome::Failed => {
                    if !self.save_claimed(&record, claim)? {
                        return Ok(true);
                    }
                    error!(
                        job_id = %record.id,
                        job_type = %record.job_type,
                        attempts = record.attempts,
                        error = %message,
                        "job failed permanently"
                    );
                    // Terminal state is already persisted; the hook cannot change it
                    if let Err(hook_error) = run_guarded(|| job.on_failed(&message)) {
                        error!(
                            job_id = %record.id,
                            job_type = %record.job_type,
                            error = %hook_error,
                            "on_failed hook failed"
                        );
                    }
                }
            },
        }

        Ok(true)
    }

    /// Write the outcome of an execution unless its claim was lost meanwhile.
    fn save_claimed(&self, record: &JobRecord, claim: ClaimToken) -> Result<bool, JobStoreError> {
        let saved = self.store.update_claimed(record, claim)?;
        if !saved {
            warn!(
                job_id = %record.id,
                job_type = %record.job_type,
                attempt = claim.attempts,
                started_at = %claim.started_at,
                outcome = %record.status,
                "job claim lost before its result was saved; discarding result"
            );
        }
        Ok(saved)
    }

    /// The record cannot be turned back into a job: fail it without retrying.
    fn fail_unrunnable(
        &self,
        record: &mut JobRecord,
        claim: ClaimToken,
        err: JobError,
    ) -> Result<(), JobStoreError> {
        if matches!(err, JobError::UnknownJobType(_)) {
            // A missing registration is not the job's fault
            record.release_attempt();
        }
        record.mark_failed(err.to_string(), self.clock.now());
        if !self.save_claimed(record, claim)? {
            return Ok(());
        }

        error!(
            job_id = %record.id,
            job_type = %record.job_type,
            error = %err,
            "job cannot be executed; marked failed without retry"
        );
        Ok(())
    }

    /// Recover records stuck in `running` past their timeout.
    pub fn reset_stuck(&self) -> Result<u64, JobStoreError> {
        let recovered = self.store.reset_stuck(self.clock.now())?;
        if recovered > 0 {
            info!(recovered, "recovered stuck jobs");
        }
        Ok(recovered)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, JobStoreError> {
        self.store.stats()
    }

    /// Delete terminal records completed more than `days_to_keep` days ago.
    pub fn cleanup(&self, days_to_keep: u32) -> Result<u64, JobStoreError> {
        let removed = self
            .store
            .delete_terminal_older_than(days_to_keep, self.clock.now())?;
        info!(removed, days_to_keep, "cleaned up finished jobs");
        Ok(removed)
    }

    pub fn find(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.store.find_by_id(id)
    }

    /// Put a `failed` record back in the queue with a fresh set of attempts.
    pub fn retry_failed(&self, id: JobId) -> Result<JobRecord, SchedulerError> {
        let mut record = self
            .store
            .find_by_id(id)?
            .ok_or(JobStoreError::NotFound(id))?;

        if record.status != JobStatus::Failed {
            return Err(SchedulerError::InvalidState {
                id,
                status: record.status,
            });
        }

        record.requeue(self.clock.now());
        self.store.update(&record)?;
        info!(job_id = %id, job_type = %record.job_type, "failed job requeued");
        Ok(record)
    }
}

impl<S, C> std::fmt::Debug for Scheduler<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Run user code, turning both errors and panics into a message.
fn run_guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(panic_message(&*panic)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("job panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("job panicked: {msg}")
    } else {
        "job panicked".to_string()
    }
}
