//! CLI command implementations.

pub mod jobs;
pub mod worker;

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use stepwise_config::{SystemConfig, load_system_config, parse_pipeline};
use stepwise_core::JobId;
use stepwise_db::SqliteJobQueue;
use stepwise_executor::JobLogs;

/// Exit code for lookups of unknown jobs.
pub const EXIT_NOT_FOUND: i32 = 2;

/// Resolved configuration shared by the commands.
pub struct Context {
    pub config: SystemConfig,
}

impl Context {
    /// Load the configuration file and apply command-line overrides.
    pub fn load(
        path: Option<&Path>,
        database: Option<PathBuf>,
        jobs_root: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = load_system_config(path).context("Failed to load configuration")?;
        if let Some(database) = database {
            config.database = database;
        }
        if let Some(jobs_root) = jobs_root {
            config.jobs_root = jobs_root;
        }
        Ok(Self { config })
    }

    pub async fn open_queue(&self) -> Result<SqliteJobQueue> {
        SqliteJobQueue::open(&self.config.database)
            .await
            .with_context(|| {
                format!(
                    "Failed to open queue database {}",
                    self.config.database.display()
                )
            })
    }

    pub fn logs(&self) -> JobLogs {
        JobLogs::new(&self.config.jobs_root)
    }
}

pub fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.trim()
        .parse::<JobId>()
        .with_context(|| format!("Invalid job ID: {}", raw))
}

/// Report an unknown job and exit.
pub fn job_not_found(id: JobId) -> ! {
    eprintln!("job not found: {}", id);
    std::process::exit(EXIT_NOT_FOUND);
}

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match parse_pipeline(&content) {
        Ok(definition) => {
            let payload = &definition.payload;
            println!("Pipeline is valid");
            if let Some(repository) = &payload.repository {
                println!("  repository: {} (branch {})", repository, payload.effective_branch());
            }
            if let Some(var) = &definition.credential_env {
                println!("  credential: from ${}", var);
            }
            println!("  steps:      {}", payload.steps.len());
            println!("  env vars:   {}", payload.env.len());
            Ok(())
        }
        Err(e) => {
            println!("Pipeline error: {}", e);
            std::process::exit(1);
        }
    }
}
