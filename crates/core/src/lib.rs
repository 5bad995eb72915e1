//! `forgejobs-core` — primitives shared by the job queue.
//!
//! This crate contains **pure** building blocks (no storage or runtime concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, JobResult};
pub use id::JobId;
