//! Pipeline runner - executes one attempt of a job.

use chrono::{SecondsFormat, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::executor::{CommandExecutor, CommandFailure, CommandSpec};
use stepwise_core::{ClaimedJob, LogSink, Progress, ProgressReporter, Stage};
use stepwise_executor::{FetchError, FetchRequest, RepositoryFetcher, Workspaces};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Steps run when a job does not define any.
pub const FALLBACK_STEPS: [&str; 3] = ["echo \"stepwise diagnostic pipeline\"", "uname -a", "pwd"];

const CLONE_PERCENT: u8 = 5;
const FIRST_STEP_PERCENT: u8 = 10;
const STEP_SPAN: usize = 85;
const LAST_STEP_CAP: u8 = 95;

/// Why an attempt did not succeed.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Clone(FetchError),

    #[error(transparent)]
    Step(CommandFailure),

    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Failed to write job log: {0}")]
    Log(#[source] stepwise_core::Error),

    #[error("Failed to report progress: {0}")]
    Progress(#[source] stepwise_core::Error),

    #[error("Job timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The lease could not be renewed because the claim is no longer ours.
    #[error("Job was taken over by another worker")]
    ClaimLost,
}

/// Percent reported as each of `count` steps starts.
///
/// Starts at 10 and grows by `max(1, 85 / count)` per step, capped at 95.
pub fn step_percentages(count: usize) -> Vec<u8> {
    let increment = u8::try_from((STEP_SPAN / count.max(1)).max(1)).unwrap_or(u8::MAX);
    let mut percent = FIRST_STEP_PERCENT;
    let mut percentages = Vec::with_capacity(count);
    for _ in 0..count {
        percentages.push(percent);
        percent = percent.saturating_add(increment).min(LAST_STEP_CAP);
    }
    percentages
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Runs job attempts against a workspace root.
pub struct PipelineRunner {
    executor: Arc<dyn CommandExecutor>,
    fetcher: RepositoryFetcher,
    progress: Arc<dyn ProgressReporter>,
    workspaces: Workspaces,
}

impl PipelineRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        progress: Arc<dyn ProgressReporter>,
        workspaces: Workspaces,
        git_host: Url,
    ) -> Self {
        Self {
            fetcher: RepositoryFetcher::new(git_host, executor.clone()),
            executor,
            progress,
            workspaces,
        }
    }

    /// Execute one attempt of `job`, writing its transcript to `log`.
    ///
    /// Every transition appends its log line before the matching progress
    /// update. The first failing command aborts the attempt.
    pub async fn run(&self, job: &ClaimedJob, log: &dyn LogSink) -> Result<(), JobFailure> {
        let workspace = self
            .workspaces
            .prepare(job.id, job.attempt)
            .await
            .map_err(JobFailure::Workspace)?;

        append(log, &format!("Job {} started at {}\n", job.id, timestamp())).await?;
        info!(job_id = %job.id, attempt = job.attempt, "Job started");

        let payload = &job.payload;
        if let Some(repository) = payload.repository.as_deref().filter(|r| !r.trim().is_empty()) {
            self.report(job, Stage::Clone, CLONE_PERCENT).await?;
            let request = FetchRequest {
                repository,
                branch: payload.effective_branch(),
                credential: payload.credential.as_ref(),
            };
            self.fetcher
                .fetch(&request, &workspace, log)
                .await
                .map_err(JobFailure::Clone)?;
        }

        let steps: Vec<&str> = if payload.steps.is_empty() {
            FALLBACK_STEPS.to_vec()
        } else {
            payload.steps.iter().map(String::as_str).collect()
        };

        for (index, (command, percent)) in steps
            .iter()
            .zip(step_percentages(steps.len()))
            .enumerate()
        {
            append(log, &format!("\n$ {}\n", command)).await?;
            self.report(job, Stage::Run, percent).await?;
            debug!(job_id = %job.id, step = index + 1, total = steps.len(), "Running step");
            self.run_step(job, command, &workspace, log).await?;
        }

        append(log, &format!("\nSUCCESS at {}\n", timestamp())).await?;
        self.report(job, Stage::Done, 100).await?;
        info!(job_id = %job.id, "Job succeeded");
        Ok(())
    }

    async fn run_step(
        &self,
        job: &ClaimedJob,
        command: &str,
        workspace: &Path,
        log: &dyn LogSink,
    ) -> Result<(), JobFailure> {
        let spec = CommandSpec::new(command, workspace).with_env(job.payload.env.clone());
        self.executor
            .run(&spec, log)
            .await
            .map_err(JobFailure::Step)
    }

    async fn report(&self, job: &ClaimedJob, stage: Stage, percent: u8) -> Result<(), JobFailure> {
        self.progress
            .update(job.id, Progress::new(stage, percent))
            .await
            .map_err(JobFailure::Progress)
    }
}

async fn append(log: &dyn LogSink, text: &str) -> Result<(), JobFailure> {
    log.append_text(text).await.map_err(JobFailure::Log)
}
