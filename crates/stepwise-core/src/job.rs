//! Job payloads, options and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::{Error, JobId};

/// Branch fetched when a payload does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// A secret value that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw secret. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// What a submitter asks the runner to do. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Repository on the source host, as `owner/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Branch to fetch.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Shell commands, run in order.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Variables layered over the runner's own environment for every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Access credential for the repository fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Secret>,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl Default for JobPayload {
    fn default() -> Self {
        Self {
            repository: None,
            branch: default_branch(),
            steps: Vec::new(),
            env: BTreeMap::new(),
            credential: None,
        }
    }
}

impl JobPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_step(mut self, command: impl Into<String>) -> Self {
        self.steps.push(command.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_credential(mut self, credential: Secret) -> Self {
        self.credential = Some(credential);
        self
    }

    /// The branch to fetch, falling back to `main` when left blank.
    pub fn effective_branch(&self) -> &str {
        let branch = self.branch.trim();
        if branch.is_empty() {
            DEFAULT_BRANCH
        } else {
            branch
        }
    }

    /// A copy safe to hand to status readers.
    pub fn redacted(&self) -> Self {
        Self {
            credential: None,
            ..self.clone()
        }
    }
}

/// Queue-level options attached to a job at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts before the job is permanently failed. 1 means no retry.
    pub max_attempts: u32,
    /// Overall execution limit for one attempt.
    pub timeout: Option<Duration>,
    /// How many completed jobs to keep in the queue. `None` keeps all.
    pub keep_completed: Option<u32>,
    /// How many failed jobs to keep in the queue. `None` keeps all.
    pub keep_failed: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            timeout: None,
            keep_completed: None,
            keep_failed: None,
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::InvalidInput(format!("unknown job state: {}", other))),
        }
    }
}

/// Coarse phase of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Clone,
    Run,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clone => "clone",
            Stage::Run => "run",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clone" => Ok(Stage::Clone),
            "run" => Ok(Stage::Run),
            "done" => Ok(Stage::Done),
            other => Err(Error::InvalidInput(format!("unknown stage: {}", other))),
        }
    }
}

/// Latest reported progress of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    /// 0 to 100.
    pub percent: u8,
}

impl Progress {
    pub fn new(stage: Stage, percent: u8) -> Self {
        Self {
            stage,
            percent: percent.min(100),
        }
    }
}

/// A job handed to a worker slot by `claim`.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    /// Names this claim. Heartbeats, completion and failure must present it.
    pub token: Uuid,
    pub payload: JobPayload,
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout: Option<Duration>,
}

/// Point-in-time view of a job for status readers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub progress: Option<Progress>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Payload with the credential stripped.
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}
