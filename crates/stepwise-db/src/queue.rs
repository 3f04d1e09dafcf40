//! Job queue backed by SQLite.
//!
//! The queue is the system of record for job payloads and lifecycle state.
//! Every transition is a single SQL statement, so a job is handed to exactly
//! one claimant even when several workers share the database file.
//!
//! A claim carries a random token and a lease. The claimant renews the lease
//! with [`JobQueue::heartbeat`] while it works, and only the current token
//! may complete or fail the job. A job whose lease ran out is stalled and may
//! be recovered by any worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use stepwise_core::{
    ClaimedJob, JobId, JobOptions, JobPayload, JobSnapshot, JobState, Progress,
    ProgressReporter, Stage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DbError, DbResult, create_pool, run_migrations};

/// Failure reason recorded when a job is recovered after its lease ran out.
pub const STALLED_REASON: &str = "Job stalled: worker lease expired before the job finished";

/// A job row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRecord {
    #[allow(dead_code)]
    seq: i64,
    id: String,
    payload: String,
    state: String,
    progress_stage: Option<String>,
    progress_percent: Option<i64>,
    attempts_made: i64,
    max_attempts: i64,
    timeout_ms: Option<i64>,
    keep_completed: Option<i64>,
    keep_failed: Option<i64>,
    #[allow(dead_code)]
    claimed_by: Option<String>,
    failed_reason: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    claim_token: Option<String>,
    #[allow(dead_code)]
    lease_expires_ms: Option<i64>,
}

impl JobRecord {
    fn job_id(&self) -> DbResult<JobId> {
        self.id
            .parse()
            .map_err(|e| DbError::InvalidRecord(format!("job id {:?}: {}", self.id, e)))
    }

    fn job_state(&self) -> DbResult<JobState> {
        self.state
            .parse()
            .map_err(|e| DbError::InvalidRecord(format!("job {}: {}", self.id, e)))
    }

    fn progress(&self) -> DbResult<Option<Progress>> {
        match (&self.progress_stage, self.progress_percent) {
            (Some(stage), Some(percent)) => {
                let stage: Stage = stage
                    .parse()
                    .map_err(|e| DbError::InvalidRecord(format!("job {}: {}", self.id, e)))?;
                let percent = u8::try_from(percent.clamp(0, 100)).unwrap_or(100);
                Ok(Some(Progress::new(stage, percent)))
            }
            _ => Ok(None),
        }
    }

    fn token(&self) -> DbResult<Uuid> {
        let raw = self
            .claim_token
            .as_deref()
            .ok_or_else(|| DbError::InvalidRecord(format!("job {}: no claim token", self.id)))?;
        Uuid::parse_str(raw)
            .map_err(|e| DbError::InvalidRecord(format!("job {} claim token: {}", self.id, e)))
    }

    fn attempts(value: i64) -> u32 {
        u32::try_from(value.max(0)).unwrap_or(u32::MAX)
    }

    fn into_snapshot(self) -> DbResult<JobSnapshot> {
        let payload: JobPayload = serde_json::from_str(&self.payload)?;
        Ok(JobSnapshot {
            id: self.job_id()?,
            state: self.job_state()?,
            progress: self.progress()?,
            attempts_made: Self::attempts(self.attempts_made),
            max_attempts: Self::attempts(self.max_attempts),
            payload: payload.redacted(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            failed_reason: self.failed_reason,
        })
    }

    fn into_claimed(self) -> DbResult<ClaimedJob> {
        let payload: JobPayload = serde_json::from_str(&self.payload)?;
        Ok(ClaimedJob {
            id: self.job_id()?,
            token: self.token()?,
            payload,
            attempt: Self::attempts(self.attempts_made),
            max_attempts: Self::attempts(self.max_attempts),
            timeout: self
                .timeout_ms
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis),
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Unix milliseconds at which a lease taken now runs out.
fn lease_deadline(lease: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
}

/// What `fail` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempts remain; the job is waiting again.
    Retrying { attempts_made: u32, max_attempts: u32 },
    /// No attempts remain; the job is permanently failed.
    Failed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store a new waiting job and return its id.
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> DbResult<JobId>;

    /// Look up a job. An id that was never enqueued (or was pruned) yields `None`.
    async fn get_job(&self, id: JobId) -> DbResult<Option<JobSnapshot>>;

    /// Current state of a job, if it exists.
    async fn get_state(&self, id: JobId) -> DbResult<Option<JobState>> {
        Ok(self.get_job(id).await?.map(|job| job.state))
    }

    /// Latest progress of a job, if it exists and has reported any.
    async fn get_progress(&self, id: JobId) -> DbResult<Option<Progress>> {
        Ok(self.get_job(id).await?.and_then(|job| job.progress))
    }

    /// Move the oldest waiting job to active and hand it to `worker_id`
    /// under a fresh claim token, leased for `lease`.
    async fn claim(&self, worker_id: &str, lease: Duration) -> DbResult<Option<ClaimedJob>>;

    /// Extend the lease of a claim. Fails with `NotFound` once the claim is
    /// no longer current, e.g. after the job was recovered by another worker.
    async fn heartbeat(&self, id: JobId, token: Uuid, lease: Duration) -> DbResult<()>;

    /// Mark an active job as completed.
    async fn complete(&self, id: JobId, token: Uuid) -> DbResult<()>;

    /// Record a failed attempt of an active job.
    async fn fail(&self, id: JobId, token: Uuid, reason: &str) -> DbResult<FailOutcome>;

    /// Treat active jobs whose lease ran out as failed attempts.
    async fn recover_stalled(&self) -> DbResult<Vec<(JobId, FailOutcome)>>;

    /// Most recent jobs first, optionally filtered by state.
    async fn list(&self, state: Option<JobState>, limit: u32) -> DbResult<Vec<JobSnapshot>>;
}

/// SQLite implementation of JobQueue.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the queue database at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> DbResult<Self> {
        let pool = create_pool(path).await?;
        run_migrations(&pool).await?;
        debug!(path = %path.display(), "Job queue opened");
        Ok(Self::new(pool))
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Keep only the newest `keep` jobs in a terminal `state`.
    async fn prune(&self, state: JobState, keep: Option<i64>) -> DbResult<()> {
        let Some(keep) = keep else {
            return Ok(());
        };

        let removed = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state = ?1 AND seq NOT IN (
                SELECT seq FROM jobs
                WHERE state = ?1
                ORDER BY finished_at DESC, seq DESC
                LIMIT ?2
            )
            "#,
        )
        .bind(state.as_str())
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed > 0 {
            debug!(state = %state, removed, "Pruned old jobs");
        }
        Ok(())
    }

    /// Record a failed attempt of an active job. `token` restricts the update
    /// to the current claim; `expired_before` restricts it to leases that ran
    /// out before that instant. Returns `None` when no row matched.
    async fn fail_active(
        &self,
        id: JobId,
        token: Option<Uuid>,
        expired_before: Option<i64>,
        reason: &str,
    ) -> DbResult<Option<FailOutcome>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempts_made < max_attempts THEN 'waiting' ELSE 'failed' END,
                finished_at = CASE WHEN attempts_made < max_attempts THEN NULL ELSE ?2 END,
                claimed_by = CASE WHEN attempts_made < max_attempts THEN NULL ELSE claimed_by END,
                progress_stage = CASE WHEN attempts_made < max_attempts THEN NULL ELSE progress_stage END,
                progress_percent = CASE WHEN attempts_made < max_attempts THEN NULL ELSE progress_percent END,
                failed_reason = ?3,
                claim_token = NULL,
                lease_expires_ms = NULL
            WHERE id = ?1 AND state = 'active'
              AND (?4 IS NULL OR claim_token = ?4)
              AND (?5 IS NULL OR lease_expires_ms IS NULL OR lease_expires_ms < ?5)
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now())
        .bind(reason)
        .bind(token.map(|t| t.to_string()))
        .bind(expired_before)
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };

        match record.job_state()? {
            JobState::Waiting => {
                let outcome = FailOutcome::Retrying {
                    attempts_made: JobRecord::attempts(record.attempts_made),
                    max_attempts: JobRecord::attempts(record.max_attempts),
                };
                info!(job_id = %id, ?outcome, "Job attempt failed, requeued");
                Ok(Some(outcome))
            }
            _ => {
                self.prune(JobState::Failed, record.keep_failed).await?;
                Ok(Some(FailOutcome::Failed))
            }
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> DbResult<JobId> {
        let id = JobId::new();
        let payload = serde_json::to_string(&payload)?;
        let timeout_ms = options
            .timeout
            .map(|t| i64::try_from(t.as_millis()).unwrap_or(i64::MAX));

        sqlx::query(
            r#"
            INSERT INTO jobs (id, payload, state, max_attempts, timeout_ms, keep_completed, keep_failed, created_at)
            VALUES (?1, ?2, 'waiting', ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(payload)
        .bind(i64::from(options.max_attempts.max(1)))
        .bind(timeout_ms)
        .bind(options.keep_completed.map(i64::from))
        .bind(options.keep_failed.map(i64::from))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> DbResult<Option<JobSnapshot>> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        record.map(JobRecord::into_snapshot).transpose()
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> DbResult<Option<ClaimedJob>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts_made = attempts_made + 1,
                claimed_by = ?1,
                started_at = ?2,
                finished_at = NULL,
                progress_stage = NULL,
                progress_percent = NULL,
                claim_token = ?3,
                lease_expires_ms = ?4
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE state = 'waiting'
                ORDER BY seq ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .bind(Uuid::new_v4().to_string())
        .bind(lease_deadline(lease))
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => {
                let job = record.into_claimed()?;
                debug!(job_id = %job.id, worker_id, attempt = job.attempt, "Job claimed");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, id: JobId, token: Uuid, lease: Duration) -> DbResult<()> {
        let renewed = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_ms = ?3
            WHERE id = ?1 AND state = 'active' AND claim_token = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(token.to_string())
        .bind(lease_deadline(lease))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if renewed == 0 {
            return Err(DbError::NotFound(format!("claim on job {}", id)));
        }
        Ok(())
    }

    async fn complete(&self, id: JobId, token: Uuid) -> DbResult<()> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET state = 'completed',
                finished_at = ?2,
                failed_reason = NULL,
                claim_token = NULL,
                lease_expires_ms = NULL
            WHERE id = ?1 AND state = 'active' AND claim_token = ?3
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now())
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("claim on job {}", id)))?;

        self.prune(JobState::Completed, record.keep_completed).await?;
        Ok(())
    }

    async fn fail(&self, id: JobId, token: Uuid, reason: &str) -> DbResult<FailOutcome> {
        self.fail_active(id, Some(token), None, reason)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("claim on job {}", id)))
    }

    async fn recover_stalled(&self) -> DbResult<Vec<(JobId, FailOutcome)>> {
        let now = now_ms();
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE state = 'active' AND (lease_expires_ms IS NULL OR lease_expires_ms < ?1)
            ORDER BY seq ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::with_capacity(ids.len());
        for raw in ids {
            let id: JobId = raw
                .parse()
                .map_err(|e| DbError::InvalidRecord(format!("job id {:?}: {}", raw, e)))?;
            // The lease is checked again in the update, so a heartbeat that
            // landed after the select keeps the job with its claimant.
            match self.fail_active(id, None, Some(now), STALLED_REASON).await? {
                Some(outcome) => {
                    warn!(job_id = %id, ?outcome, "Recovered job with an expired lease");
                    recovered.push((id, outcome));
                }
                None => debug!(job_id = %id, "Lease renewed before recovery"),
            }
        }
        Ok(recovered)
    }

    async fn list(&self, state: Option<JobState>, limit: u32) -> DbResult<Vec<JobSnapshot>> {
        let records = if let Some(state) = state {
            sqlx::query_as::<_, JobRecord>(
                "SELECT * FROM jobs WHERE state = ?1 ORDER BY seq DESC LIMIT ?2",
            )
            .bind(state.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY seq DESC LIMIT ?1")
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
        };

        records.into_iter().map(JobRecord::into_snapshot).collect()
    }
}

#[async_trait]
impl ProgressReporter for SqliteJobQueue {
    /// Only active jobs take progress, so a job that was recovered or
    /// finished never shows a later stage than its final one.
    async fn update(&self, job_id: JobId, progress: Progress) -> stepwise_core::Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET progress_stage = ?2, progress_percent = ?3
            WHERE id = ?1 AND state = 'active'
            "#,
        )
        .bind(job_id.to_string())
        .bind(progress.stage.as_str())
        .bind(i64::from(progress.percent))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::NotFound(format!("active job {}", job_id)).into());
        }
        Ok(())
    }
}
