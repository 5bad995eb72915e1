//! Infrastructure layer: job storage, scheduling, and worker configuration.

pub mod config;
pub mod jobs;

pub use forgejobs_core::{Clock, JobError, JobId, JobResult, ManualClock, SystemClock};
