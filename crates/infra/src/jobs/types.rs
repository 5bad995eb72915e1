//! Job records, lifecycle state and retry policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use forgejobs_core::{JobError, JobId};

use super::job::Payload;

/// Upper bound for a computed backoff delay (one day), unless the base delay
/// itself is larger.
pub const MAX_BACKOFF_SECONDS: u64 = 86_400;

/// Lifecycle state of a job record.
///
/// `pending → running → {completed | pending (retry) | failed}`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, eligible once `scheduled_at <= now`
    Pending,
    /// Claimed by a worker and executing
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted its attempts, or could not be executed at all
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobError::invalid_payload(format!("unknown job status: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(JobError::invalid_payload(format!("unknown backoff strategy: {other}"))),
        }
    }
}

/// Retry/timeout policy frozen into a record at enqueue time.
///
/// Later changes to a job type's defaults never affect records already queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (always >= 1)
    pub max_attempts: u32,
    /// Base delay before a failed attempt becomes eligible again
    pub retry_delay_seconds: u64,
    /// Advisory execution limit consulted by stuck-job recovery (always >= 1)
    pub timeout_seconds: u64,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_seconds: 60,
            timeout_seconds: 300,
            backoff: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Build a policy, clamping values into their valid ranges.
    pub fn new(max_attempts: u32, retry_delay_seconds: u64, timeout_seconds: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay_seconds,
            timeout_seconds: timeout_seconds.max(1),
            backoff: BackoffStrategy::Fixed,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay in seconds before the next attempt after `attempt` (1-indexed) failed.
    ///
    /// Never shorter than `retry_delay_seconds`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.retry_delay_seconds;
        let attempt = attempt.max(1);

        let secs = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 2_u64.checked_pow(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };

        secs.min(MAX_BACKOFF_SECONDS.max(base))
    }

    /// Check if another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A record not yet persisted (no id assigned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobRecord {
    pub job_type: String,
    pub payload: Payload,
    pub policy: RetryPolicy,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewJobRecord {
    /// Attach the store-assigned id; the record enters `pending`.
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            policy: self.policy,
            last_error: None,
            scheduled_at: self.scheduled_at,
            started_at: None,
            completed_at: None,
            created_at: self.created_at,
        }
    }
}

/// The persisted state of one queued job invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Registry key used to rebuild the job
    pub job_type: String,
    /// Serialized job data, opaque to the store
    pub payload: Payload,
    pub status: JobStatus,
    /// Attempts started so far
    pub attempts: u32,
    pub policy: RetryPolicy,
    pub last_error: Option<String>,
    /// Earliest time the record may run; never moves backwards
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Identifies one execution of a record: the values set by its claim.
///
/// `reset_stuck` and a later claim both change these, so a worker whose token
/// no longer matches has lost the record to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimToken {
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
}

/// What happened to a record after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `pending`, eligible again at the given time
    Rescheduled { next_attempt_at: DateTime<Utc> },
    /// Attempts exhausted; record is terminal
    Failed,
}

impl JobRecord {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// A running record whose advisory timeout has elapsed.
    pub fn is_stuck(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started_at)) => {
                add_secs(started_at, self.policy.timeout_seconds) < now
            }
            _ => false,
        }
    }

    /// The current claim, if the record is running.
    pub fn claim_token(&self) -> Option<ClaimToken> {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started_at)) => Some(ClaimToken {
                started_at,
                attempts: self.attempts,
            }),
            _ => None,
        }
    }

    pub fn holds_claim(&self, claim: ClaimToken) -> bool {
        self.claim_token() == Some(claim)
    }

    /// Claim: `pending → running`, counting the attempt as soon as it starts.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.completed_at = None;
    }

    /// `running → completed`.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Apply the reschedule-or-fail decision after `handle()` failed.
    pub fn mark_attempt_failed(&mut self, error: String, now: DateTime<Utc>) -> FailureOutcome {
        self.last_error = Some(error);

        if self.policy.should_retry(self.attempts) {
            let next = add_secs(now, self.policy.delay_for_attempt(self.attempts));
            self.scheduled_at = self.scheduled_at.max(next);
            self.status = JobStatus::Pending;
            self.started_at = None;
            FailureOutcome::Rescheduled {
                next_attempt_at: self.scheduled_at,
            }
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            FailureOutcome::Failed
        }
    }

    /// Move straight to `failed`, regardless of remaining attempts.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error);
        self.completed_at = Some(now);
    }

    /// Give back the attempt counted by the claim.
    pub fn release_attempt(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }

    /// Recover a stuck record, counting the timeout as a consumed attempt.
    ///
    /// Returns to `pending` while attempts remain; otherwise the record fails.
    pub fn recover_stuck(&mut self, now: DateTime<Utc>) -> JobStatus {
        self.attempts = (self.attempts + 1).min(self.policy.max_attempts);
        self.last_error = Some(timeout_error(self.policy.timeout_seconds));
        self.started_at = None;

        if self.policy.should_retry(self.attempts) {
            self.status = JobStatus::Pending;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        }
        self.status
    }

    /// Requeue a failed record for a fresh set of attempts.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.started_at = None;
        self.completed_at = None;
        self.scheduled_at = self.scheduled_at.max(now);
    }
}

/// Error recorded when a record is recovered after exceeding its timeout.
pub fn timeout_error(timeout_seconds: u64) -> String {
    format!("timed out: exceeded {timeout_seconds}s while running")
}

/// `at + secs`, saturating at the latest representable instant.
pub(crate) fn add_secs(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Record counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}
