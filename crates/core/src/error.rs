//! Job-level error model.

use thiserror::Error;

/// Result type for job construction and (de)serialization.
pub type JobResult<T> = Result<T, JobError>;

/// Errors raised while building, serializing or resolving a job.
///
/// These are deterministic: retrying the same input produces the same error.
/// Failures *inside* a job's `handle()` are not represented here; they are
/// arbitrary user errors absorbed by the scheduler's state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// No factory is registered for the stored job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// A payload is not a flat key/value map, or does not match the job's shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The job could not be converted to its payload representation.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl JobError {
    pub fn unknown_job_type(job_type: impl Into<String>) -> Self {
        Self::UnknownJobType(job_type.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
