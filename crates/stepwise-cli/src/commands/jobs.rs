//! Job commands.

use anyhow::{Context as _, Result, bail};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use stepwise_config::parse_pipeline;
use stepwise_core::{JobPayload, JobSnapshot, JobState, Secret};
use stepwise_db::JobQueue;

use super::{Context, job_not_found, parse_job_id};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Pipeline definition file; flags below override its values
    #[arg(long)]
    file: Option<PathBuf>,

    /// Repository to fetch, as owner/name
    #[arg(long)]
    repo: Option<String>,

    /// Branch to fetch
    #[arg(long)]
    branch: Option<String>,

    /// Step command; repeat for several steps, run in order
    #[arg(long = "step", value_name = "COMMAND")]
    steps: Vec<String>,

    /// Environment variable for every step, as KEY=VALUE; repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Environment variable to read the repository credential from
    #[arg(long, value_name = "VAR")]
    credential_env: Option<String>,

    /// Total attempts before the job is marked failed
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Time limit for one attempt, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Completed jobs to keep in the queue
    #[arg(long)]
    keep_completed: Option<u32>,

    /// Failed jobs to keep in the queue
    #[arg(long)]
    keep_failed: Option<u32>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

pub async fn submit(ctx: &Context, args: SubmitArgs) -> Result<()> {
    let (mut payload, mut credential_env) = match &args.file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let definition = parse_pipeline(&content)
                .with_context(|| format!("Invalid pipeline file {}", path.display()))?;
            (definition.payload, definition.credential_env)
        }
        None => (JobPayload::new(), None),
    };

    if let Some(repo) = args.repo {
        payload.repository = Some(repo);
    }
    if let Some(branch) = args.branch {
        payload.branch = branch;
    }
    if !args.steps.is_empty() {
        payload.steps = args.steps;
    }
    payload.env.extend(args.env);
    if args.credential_env.is_some() {
        credential_env = args.credential_env;
    }

    if let Some(var) = credential_env {
        let value = std::env::var(&var)
            .with_context(|| format!("Credential variable {} is not set", var))?;
        payload.credential = Some(Secret::new(value));
    }

    let mut options = ctx.config.defaults.to_options();
    if let Some(max_attempts) = args.max_attempts {
        if max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        options.max_attempts = max_attempts;
    }
    if let Some(secs) = args.timeout {
        if secs == 0 {
            bail!("--timeout must be greater than 0");
        }
        options.timeout = Some(Duration::from_secs(secs));
    }
    if args.keep_completed.is_some() {
        options.keep_completed = args.keep_completed;
    }
    if args.keep_failed.is_some() {
        options.keep_failed = args.keep_failed;
    }

    let queue = ctx.open_queue().await?;
    let id = queue.enqueue(payload, options).await?;
    println!("{}", id);
    Ok(())
}

fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn print_job(job: &JobSnapshot) {
    let progress = job
        .progress
        .map(|p| format!("{} {}%", p.stage, p.percent));

    println!("id:        {}", job.id);
    println!("state:     {}", job.state);
    println!("progress:  {}", or_dash(progress));
    println!("attempts:  {}/{}", job.attempts_made, job.max_attempts);
    if let Some(repository) = &job.payload.repository {
        println!("repo:      {} ({})", repository, job.payload.effective_branch());
    }
    println!("steps:     {}", job.payload.steps.len());
    println!("created:   {}", job.created_at.to_rfc3339());
    println!("started:   {}", or_dash(job.started_at.map(|t| t.to_rfc3339())));
    println!("finished:  {}", or_dash(job.finished_at.map(|t| t.to_rfc3339())));
    if let Some(reason) = &job.failed_reason {
        println!("reason:    {}", reason);
    }
}

pub async fn status(ctx: &Context, raw_id: &str, json: bool) -> Result<()> {
    let id = parse_job_id(raw_id)?;
    let queue = ctx.open_queue().await?;

    let Some(job) = queue.get_job(id).await? else {
        job_not_found(id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

/// Log text already ends in its own newline, so nothing is added.
fn write_verbatim(out: &mut impl Write, content: &[u8]) -> std::io::Result<()> {
    out.write_all(content)?;
    out.flush()
}

pub async fn logs(ctx: &Context, raw_id: &str, follow: bool) -> Result<()> {
    let id = parse_job_id(raw_id)?;
    let logs = ctx.logs();

    if !follow {
        let content = logs.read(id).await?;
        write_verbatim(&mut std::io::stdout().lock(), content.as_bytes())?;
        return Ok(());
    }

    let queue = ctx.open_queue().await?;
    let path = logs.path(id);
    let mut printed = 0usize;

    loop {
        // State first: a terminal state means the log is already complete.
        let state = queue.get_state(id).await?;

        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        if content.len() > printed {
            write_verbatim(&mut std::io::stdout().lock(), &content[printed..])?;
            printed = content.len();
        }

        match state {
            Some(state) if !state.is_terminal() => tokio::time::sleep(FOLLOW_INTERVAL).await,
            Some(_) => break,
            None if printed == 0 => job_not_found(id),
            None => break,
        }
    }

    Ok(())
}

pub async fn list(ctx: &Context, state: Option<&str>, limit: u32) -> Result<()> {
    let state = state.map(str::parse::<JobState>).transpose()?;
    let queue = ctx.open_queue().await?;
    let jobs = queue.list(state, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:<10}  {:<8}  {:<25}  REPOSITORY",
        "ID", "STATE", "PROGRESS", "ATTEMPTS", "CREATED"
    );
    for job in jobs {
        let progress = job
            .progress
            .map(|p| format!("{} {}%", p.stage, p.percent));
        println!(
            "{:<36}  {:<9}  {:<10}  {:<8}  {:<25}  {}",
            job.id.to_string(),
            job.state.as_str(),
            or_dash(progress),
            format!("{}/{}", job.attempts_made, job.max_attempts),
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            job.payload.repository.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("MODE=release").unwrap(),
            ("MODE".to_string(), "release".to_string())
        );
        assert_eq!(
            parse_key_value("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert_eq!(
            parse_key_value("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_log_output_is_verbatim() {
        let mut out = Vec::new();
        write_verbatim(&mut out, b"Job started\n$ make\nSUCCESS at now\n").unwrap();
        assert_eq!(out, b"Job started\n$ make\nSUCCESS at now\n");

        let mut out = Vec::new();
        write_verbatim(&mut out, b"No logs yet.").unwrap();
        assert_eq!(out, b"No logs yet.");
    }

    #[test]
    fn test_or_dash() {
        assert_eq!(or_dash(None::<String>), "-");
        assert_eq!(or_dash(Some(3)), "3");
    }
}
