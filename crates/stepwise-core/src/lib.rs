//! Core domain types and traits for the Stepwise pipeline runner.
//!
//! This crate contains:
//! - Job identifiers, payloads, options and lifecycle state
//! - The command executor contract
//! - The log sink and progress reporter contracts

pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod log;
pub mod progress;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{
    ClaimedJob, JobOptions, JobPayload, JobSnapshot, JobState, Progress, Secret, Stage,
};
pub use log::{LogSink, MemoryLogSink};
pub use progress::ProgressReporter;
