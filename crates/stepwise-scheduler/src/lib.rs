//! Job scheduling for the Stepwise pipeline runner.
//!
//! `PipelineRunner` executes one attempt of a job: optional repository fetch,
//! then each step in order, with progress and log lines along the way.
//! `Worker` claims jobs from the queue and drives them through the runner.

pub mod runner;
pub mod worker;

pub use runner::{FALLBACK_STEPS, JobFailure, PipelineRunner, step_percentages};
pub use worker::{JobOutcome, Worker, WorkerConfig};
