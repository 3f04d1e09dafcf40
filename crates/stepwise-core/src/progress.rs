//! Progress reporting contract.

use async_trait::async_trait;

use crate::{JobId, Progress, Result};

/// Records the latest progress of a job.
///
/// Only the last value is kept. Implementations do not check that percent
/// grows; the worker only ever reports non-decreasing values within an attempt.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn update(&self, job_id: JobId, progress: Progress) -> Result<()>;
}
