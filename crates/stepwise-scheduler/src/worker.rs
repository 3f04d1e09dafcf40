//! Worker that processes jobs from the queue.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use stepwise_config::default_worker_id;
use stepwise_core::{ClaimedJob, JobId, LogSink};
use stepwise_db::{DbError, DbResult, FailOutcome, JobQueue, STALLED_REASON};
use stepwise_executor::JobLogs;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runner::{JobFailure, PipelineRunner};

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded on claimed jobs.
    pub worker_id: String,
    /// Number of jobs run at the same time.
    pub concurrency: usize,
    /// Sleep between claims while the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after a queue error before claiming again.
    pub error_backoff: Duration,
    /// How long a claim stays valid without a heartbeat.
    pub lease: Duration,
    /// How often a running job's lease is renewed. Must be well below `lease`.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// How a processed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { reason: String },
    Failed { reason: String },
}

/// A worker that claims and executes jobs.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    runner: Arc<PipelineRunner>,
    logs: JobLogs,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        runner: Arc<PipelineRunner>,
        logs: JobLogs,
    ) -> Self {
        Self {
            config,
            queue,
            runner,
            logs,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation stops slots from claiming new jobs; attempts already in
    /// flight run to completion first.
    pub async fn run(&self, shutdown: CancellationToken) -> DbResult<()> {
        let concurrency = self.config.concurrency.max(1);
        info!(worker_id = %self.config.worker_id, concurrency, "Starting worker");

        self.recover_stalled().await?;

        join_all((0..concurrency).map(|slot| self.run_slot(slot, shutdown.clone()))).await;

        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Claim and process one job. Returns `None` when the queue is empty.
    pub async fn run_once(&self) -> DbResult<Option<(JobId, JobOutcome)>> {
        match self.queue.claim(&self.config.worker_id, self.config.lease).await? {
            Some(job) => {
                let id = job.id;
                let outcome = self.process(job).await;
                Ok(Some((id, outcome)))
            }
            None => Ok(None),
        }
    }

    /// Fail active jobs whose lease ran out, whichever worker claimed them.
    pub async fn recover_stalled(&self) -> DbResult<()> {
        let recovered = self.queue.recover_stalled().await?;
        for (job_id, outcome) in recovered {
            warn!(job_id = %job_id, worker_id = %self.config.worker_id, ?outcome, "Recovered stalled job");
            if outcome == FailOutcome::Failed {
                let log = self.logs.open(job_id);
                append_failure(&log, job_id, STALLED_REASON).await;
            }
        }
        Ok(())
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        let worker_id = &self.config.worker_id;

        while !shutdown.is_cancelled() {
            let pause = match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    if let Err(e) = self.recover_stalled().await {
                        warn!(worker_id = %worker_id, slot, error = %e, "Failed to recover stalled jobs");
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, slot, error = %e, "Failed to claim job");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }
    }

    async fn process(&self, job: ClaimedJob) -> JobOutcome {
        info!(
            job_id = %job.id,
            worker_id = %self.config.worker_id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            "Claimed job"
        );

        let log = self.logs.open(job.id);
        let attempt = async {
            let run = self.runner.run(&job, &log);
            match job.timeout {
                Some(limit) => timeout(limit, run)
                    .await
                    .unwrap_or_else(|_| Err(JobFailure::Timeout(limit))),
                None => run.await,
            }
        };

        // Losing the claim drops the attempt, which kills the running step.
        let result = tokio::select! {
            result = attempt => result,
            lost = self.keep_alive(&job) => Err(lost),
        };

        match result {
            Ok(()) => match self.queue.complete(job.id, job.token).await {
                Ok(()) => JobOutcome::Completed,
                Err(e) => {
                    let reason = format!("Could not mark job complete: {}", e);
                    error!(job_id = %job.id, error = %e, "Failed to mark job complete");
                    append_failure(&log, job.id, &reason).await;
                    JobOutcome::Failed { reason }
                }
            },
            Err(failure @ JobFailure::ClaimLost) => {
                // The worker that recovered the job already recorded the failure.
                let reason = failure.to_string();
                warn!(job_id = %job.id, "Job claim lost, abandoning attempt");
                JobOutcome::Failed { reason }
            }
            Err(failure) => {
                let reason = failure.to_string();
                warn!(job_id = %job.id, reason = %reason, "Job attempt failed");
                append_failure(&log, job.id, &reason).await;

                match self.queue.fail(job.id, job.token, &reason).await {
                    Ok(FailOutcome::Retrying { .. }) => JobOutcome::Retrying { reason },
                    Ok(FailOutcome::Failed) => JobOutcome::Failed { reason },
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                        JobOutcome::Failed { reason }
                    }
                }
            }
        }
    }

    /// Renew the job's lease until the claim turns out to be lost.
    async fn keep_alive(&self, job: &ClaimedJob) -> JobFailure {
        loop {
            sleep(self.config.heartbeat_interval).await;
            match self
                .queue
                .heartbeat(job.id, job.token, self.config.lease)
                .await
            {
                Ok(()) => debug!(job_id = %job.id, "Lease renewed"),
                Err(DbError::NotFound(_)) => return JobFailure::ClaimLost,
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to renew lease"),
            }
        }
    }
}

/// Best effort: the failure is still reported to the queue if this write fails.
async fn append_failure(log: &dyn LogSink, job_id: JobId, reason: &str) {
    if let Err(e) = log.append_text(&format!("\nFAILED: {}\n", reason)).await {
        warn!(job_id = %job_id, error = %e, "Failed to write failure to job log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use stepwise_core::{JobOptions, JobPayload, JobSnapshot, JobState, Progress, Stage};
    use stepwise_db::SqliteJobQueue;
    use stepwise_executor::{NO_LOGS_YET, ShellExecutor, Workspaces};
    use tempfile::TempDir;
    use url::Url;
    use uuid::Uuid;

    struct Harness {
        dir: TempDir,
        queue: Arc<SqliteJobQueue>,
        logs: JobLogs,
        runner: Arc<PipelineRunner>,
        worker: Worker,
    }

    async fn open_runner(dir: &Path) -> (Arc<SqliteJobQueue>, JobLogs, Arc<PipelineRunner>) {
        let queue = Arc::new(SqliteJobQueue::open(&dir.join("queue.db")).await.unwrap());
        let jobs_root = dir.join("jobs");
        let logs = JobLogs::new(&jobs_root);
        let runner = Arc::new(PipelineRunner::new(
            Arc::new(ShellExecutor::default()),
            queue.clone(),
            Workspaces::new(&jobs_root),
            Url::parse("https://github.com").unwrap(),
        ));
        (queue, logs, runner)
    }

    async fn harness(config: WorkerConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (queue, logs, runner) = open_runner(dir.path()).await;
        let worker = Worker::new(config, queue.clone(), runner.clone(), logs.clone());
        Harness {
            dir,
            queue,
            logs,
            runner,
            worker,
        }
    }

    impl Harness {
        /// Another worker with its own connection pool on the same database file.
        async fn worker_on_same_queue(&self, config: WorkerConfig) -> Worker {
            let (queue, logs, runner) = open_runner(self.dir.path()).await;
            Worker::new(config, queue, runner, logs)
        }
    }

    fn steps(commands: &[&str]) -> JobPayload {
        commands
            .iter()
            .fold(JobPayload::new(), |payload, c| payload.with_step(*c))
    }

    fn workspace_of(root: &Path, id: JobId) -> std::path::PathBuf {
        root.join(id.to_string()).join("workspace").join("1")
    }

    #[tokio::test]
    async fn test_successful_job() {
        let h = harness(WorkerConfig::default()).await;
        let id = h
            .queue
            .enqueue(steps(&["echo hello"]), JobOptions::default())
            .await
            .unwrap();

        let (ran, outcome) = h.worker.run_once().await.unwrap().unwrap();
        assert_eq!(ran, id);
        assert_eq!(outcome, JobOutcome::Completed);

        let job = h.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, Some(Progress::new(Stage::Done, 100)));

        let log = h.logs.read(id).await.unwrap();
        assert!(log.starts_with(&format!("Job {} started at ", id)));
        assert!(log.contains("\n$ echo hello\nhello\n"));
        assert!(log.contains("\nSUCCESS at "));
    }

    #[tokio::test]
    async fn test_failing_step_fails_job() {
        let h = harness(WorkerConfig::default()).await;
        let id = h
            .queue
            .enqueue(steps(&["echo a", "exit 2", "echo never"]), JobOptions::default())
            .await
            .unwrap();

        let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                reason: "Command failed (exit code 2): exit 2".to_string()
            }
        );

        let job = h.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.progress, Some(Progress::new(Stage::Run, 38)));

        let log = h.logs.read(id).await.unwrap();
        assert!(log.contains("\n$ exit 2\n"));
        assert!(!log.contains("never"));
        assert!(log.ends_with("\nFAILED: Command failed (exit code 2): exit 2\n"));
        assert!(!log.contains("SUCCESS"));
    }

    #[tokio::test]
    async fn test_failed_attempt_is_retried() {
        let h = harness(WorkerConfig::default()).await;
        let options = JobOptions {
            max_attempts: 2,
            ..JobOptions::default()
        };
        let id = h.queue.enqueue(steps(&["false"]), options).await.unwrap();

        let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Retrying { .. }));
        assert_eq!(h.queue.get_state(id).await.unwrap(), Some(JobState::Waiting));

        let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));

        let log = h.logs.read(id).await.unwrap();
        assert_eq!(log.matches("started at").count(), 2);
        assert_eq!(log.matches("FAILED:").count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_kills_step_and_fails_job() {
        let h = harness(WorkerConfig::default()).await;
        let options = JobOptions {
            timeout: Some(Duration::from_secs(1)),
            ..JobOptions::default()
        };
        let id = h
            .queue
            .enqueue(steps(&["sleep 3 && touch late.txt"]), options)
            .await
            .unwrap();

        let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                reason: "Job timed out after 1s".to_string()
            }
        );

        let log = h.logs.read(id).await.unwrap();
        assert!(log.ends_with("\nFAILED: Job timed out after 1s\n"));

        sleep(Duration::from_millis(2500)).await;
        let root = h.logs.path(id);
        let jobs_root = root.parent().unwrap().parent().unwrap();
        assert!(!workspace_of(jobs_root, id).join("late.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let h = harness(WorkerConfig::default()).await;
        assert!(h.worker.run_once().await.unwrap().is_none());
        assert_eq!(h.logs.read(JobId::new()).await.unwrap(), NO_LOGS_YET);
    }

    #[tokio::test]
    async fn test_recover_stalled_marks_expired_job_failed() {
        let h = harness(WorkerConfig::default()).await;
        let id = h
            .queue
            .enqueue(steps(&["echo a"]), JobOptions::default())
            .await
            .unwrap();
        h.queue
            .claim("gone", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        h.worker.recover_stalled().await.unwrap();

        let job = h.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));
        assert!(h.logs.read(id).await.unwrap().contains("FAILED: Job stalled"));
    }

    #[tokio::test]
    async fn test_second_worker_leaves_running_job_alone() {
        let h = harness(WorkerConfig::default()).await;
        let other = h.worker_on_same_queue(WorkerConfig::default()).await;
        let id = h
            .queue
            .enqueue(steps(&["sleep 1"]), JobOptions::default())
            .await
            .unwrap();

        let late_start = async {
            sleep(Duration::from_millis(300)).await;
            other.recover_stalled().await.unwrap();
        };
        let (ran, _) = tokio::join!(h.worker.run_once(), late_start);

        assert_eq!(ran.unwrap().unwrap(), (id, JobOutcome::Completed));
        let job = h.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, Some(Progress::new(Stage::Done, 100)));
    }

    #[tokio::test]
    async fn test_heartbeat_outlives_short_lease() {
        let config = WorkerConfig {
            lease: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let h = harness(config.clone()).await;
        let other = h.worker_on_same_queue(config).await;
        let id = h
            .queue
            .enqueue(steps(&["sleep 1"]), JobOptions::default())
            .await
            .unwrap();

        let sweeper = async {
            for _ in 0..8 {
                sleep(Duration::from_millis(100)).await;
                other.recover_stalled().await.unwrap();
            }
        };
        let (ran, _) = tokio::join!(h.worker.run_once(), sweeper);

        assert_eq!(ran.unwrap().unwrap().1, JobOutcome::Completed);
        assert_eq!(h.queue.get_state(id).await.unwrap(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_lost_claim_abandons_attempt() {
        let config = WorkerConfig {
            lease: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(500),
            ..WorkerConfig::default()
        };
        let h = harness(config.clone()).await;
        let other = h.worker_on_same_queue(config).await;
        let id = h
            .queue
            .enqueue(steps(&["sleep 2 && touch late.txt"]), JobOptions::default())
            .await
            .unwrap();

        let takeover = async {
            sleep(Duration::from_millis(300)).await;
            other.recover_stalled().await.unwrap();
        };
        let (ran, _) = tokio::join!(h.worker.run_once(), takeover);

        assert_eq!(
            ran.unwrap().unwrap().1,
            JobOutcome::Failed {
                reason: "Job was taken over by another worker".to_string()
            }
        );
        let job = h.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_ne!(job.progress, Some(Progress::new(Stage::Done, 100)));

        let log = h.logs.read(id).await.unwrap();
        assert!(log.contains("FAILED: Job stalled"));
        assert!(!log.contains("SUCCESS"));

        sleep(Duration::from_millis(2000)).await;
        let jobs_root = h.dir.path().join("jobs");
        assert!(!workspace_of(&jobs_root, id).join("late.txt").exists());
    }

    /// Delegates to SQLite but refuses every completion.
    struct RefusesCompletion(Arc<SqliteJobQueue>);

    #[async_trait]
    impl JobQueue for RefusesCompletion {
        async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> DbResult<JobId> {
            self.0.enqueue(payload, options).await
        }

        async fn get_job(&self, id: JobId) -> DbResult<Option<JobSnapshot>> {
            self.0.get_job(id).await
        }

        async fn claim(&self, worker_id: &str, lease: Duration) -> DbResult<Option<ClaimedJob>> {
            self.0.claim(worker_id, lease).await
        }

        async fn heartbeat(&self, id: JobId, token: Uuid, lease: Duration) -> DbResult<()> {
            self.0.heartbeat(id, token, lease).await
        }

        async fn complete(&self, id: JobId, _token: Uuid) -> DbResult<()> {
            Err(DbError::NotFound(format!("claim on job {}", id)))
        }

        async fn fail(&self, id: JobId, token: Uuid, reason: &str) -> DbResult<FailOutcome> {
            self.0.fail(id, token, reason).await
        }

        async fn recover_stalled(&self) -> DbResult<Vec<(JobId, FailOutcome)>> {
            self.0.recover_stalled().await
        }

        async fn list(&self, state: Option<JobState>, limit: u32) -> DbResult<Vec<JobSnapshot>> {
            self.0.list(state, limit).await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_completion_is_a_failure() {
        let h = harness(WorkerConfig::default()).await;
        let worker = Worker::new(
            WorkerConfig::default(),
            Arc::new(RefusesCompletion(h.queue.clone())),
            h.runner.clone(),
            h.logs.clone(),
        );
        let id = h
            .queue
            .enqueue(steps(&["echo hi"]), JobOptions::default())
            .await
            .unwrap();

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        let JobOutcome::Failed { reason } = outcome else {
            panic!("expected a failed outcome, got {:?}", outcome);
        };
        assert!(reason.starts_with("Could not mark job complete: "));

        assert_ne!(h.queue.get_state(id).await.unwrap(), Some(JobState::Completed));
        let log = h.logs.read(id).await.unwrap();
        assert!(log.ends_with(&format!("\nFAILED: {}\n", reason)));
    }

    #[tokio::test]
    async fn test_run_processes_queue_until_cancelled() {
        let config = WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..WorkerConfig::default()
        };
        let h = harness(config).await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let command = format!("echo job-{i}");
            ids.push(
                h.queue
                    .enqueue(steps(&[command.as_str()]), JobOptions::default())
                    .await
                    .unwrap(),
            );
        }

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let queue = h.queue.clone();
        let watched = ids.clone();
        let watcher = async move {
            loop {
                let mut done = 0;
                for id in &watched {
                    if queue.get_state(*id).await.unwrap() == Some(JobState::Completed) {
                        done += 1;
                    }
                }
                if done == watched.len() {
                    stopper.cancel();
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        };

        let (result, _) = tokio::join!(h.worker.run(shutdown), watcher);
        result.unwrap();

        for id in ids {
            assert_eq!(h.queue.get_state(id).await.unwrap(), Some(JobState::Completed));
        }
    }
}
