//! Persistent job queue with retry, backoff, and stuck-job recovery.
//!
//! ## Design
//!
//! - A [`Job`] is rebuilt from `(job_type, payload)` through an explicit [`JobRegistry`]
//! - Each dispatch persists a [`JobRecord`] with its retry policy frozen in
//! - The [`Scheduler`] owns every state transition; the [`JobStore`] only persists
//! - Records are claimed atomically, so concurrent pollers never run one record twice
//! - All time comparisons go through an injectable `Clock`
//!
//! ## Components
//!
//! - `Job`: user-defined unit of work plus its retry policy
//! - `JobRegistry`: `job_type → factory` mapping populated at startup
//! - `JobStore`: persistence (`InMemoryJobStore`, `PostgresJobStore`)
//! - `Scheduler`: dispatch, queue processing, recovery, stats, retention
//! - `SchedulerWorker`: background thread acting as the periodic trigger

pub mod job;
pub mod postgres;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use job::{Job, Payload, from_payload, to_payload, validate_payload};
pub use postgres::PostgresJobStore;
pub use registry::{JobFactory, JobRegistry};
pub use scheduler::{Scheduler, SchedulerError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, ClaimToken, FailureOutcome, JobRecord, JobStatus, MAX_BACKOFF_SECONDS, NewJobRecord,
    QueueStats, RetryPolicy, timeout_error,
};
pub use worker::{SchedulerWorker, TickReport, WorkerHandle, WorkerStats, run_tick};
