//! Repository fetching.
//!
//! Checks out a single branch of a hosted repository into a job workspace with
//! a shallow fetch. Credentials reach git through a credential helper defined
//! in the fetch process environment, so they never appear in the remote URL,
//! the command text, `.git/config` or the job log.

use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use stepwise_core::executor::{CommandExecutor, CommandFailure, CommandSpec};
use stepwise_core::{LogSink, Secret};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Environment variable the credential helper reads the secret from.
pub const CREDENTIAL_ENV: &str = "STEPWISE_GIT_CREDENTIAL";

/// Username sent alongside a token credential.
const TOKEN_USERNAME: &str = "x-access-token";

static REPOSITORY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+/[A-Za-z0-9._-]+$").unwrap());

static BRANCH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/+-]+$").unwrap());

/// Errors from fetching a repository.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid repository identifier: {0:?}")]
    InvalidRepository(String),

    #[error("Invalid branch name: {0:?}")]
    InvalidBranch(String),

    #[error(transparent)]
    Command(#[from] CommandFailure),

    #[error("Failed to write clone log: {0}")]
    Log(#[from] stepwise_core::Error),
}

/// What to fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// `owner/name` on the source host.
    pub repository: &'a str,
    pub branch: &'a str,
    pub credential: Option<&'a Secret>,
}

/// Fetches repositories from one source host.
pub struct RepositoryFetcher {
    host: Url,
    executor: Arc<dyn CommandExecutor>,
}

impl RepositoryFetcher {
    pub fn new(host: Url, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { host, executor }
    }

    /// Remote URL of a repository. Never carries credentials.
    pub fn remote_url(&self, repository: &str) -> String {
        format!(
            "{}/{}.git",
            self.host.as_str().trim_end_matches('/'),
            repository
        )
    }

    /// Build the checkout command for a validated request.
    pub fn fetch_spec(
        &self,
        request: &FetchRequest<'_>,
        workspace: &Path,
    ) -> Result<CommandSpec, FetchError> {
        validate_repository(request.repository)?;
        validate_branch(request.branch)?;

        let command = format!(
            "git init -q . && git remote add origin {url} && git fetch --depth=1 origin {branch} && git checkout -q -b {branch} FETCH_HEAD",
            url = self.remote_url(request.repository),
            branch = request.branch,
        );

        let mut spec = CommandSpec::new(command, workspace).with_var("GIT_TERMINAL_PROMPT", "0");

        if let Some(credential) = request.credential {
            let helper = format!(
                "!f() {{ test \"$1\" = get && echo username={TOKEN_USERNAME} && echo \"password=${CREDENTIAL_ENV}\"; }}; f"
            );
            spec = spec
                .with_var("GIT_CONFIG_COUNT", "1")
                .with_var("GIT_CONFIG_KEY_0", "credential.helper")
                .with_var("GIT_CONFIG_VALUE_0", helper)
                .with_var(CREDENTIAL_ENV, credential.expose());
        }

        Ok(spec)
    }

    /// Check out `request` into `workspace`, logging progress lines around the fetch.
    pub async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        workspace: &Path,
        log: &dyn LogSink,
    ) -> Result<(), FetchError> {
        // Logged before validation, so rejected input still appears.
        log.append_text(&format!(
            "Cloning {} (branch {})...\n",
            request.repository, request.branch
        ))
        .await?;

        let spec = self.fetch_spec(request, workspace)?;
        info!(
            repository = %request.repository,
            branch = %request.branch,
            authenticated = request.credential.is_some(),
            "Fetching repository"
        );

        self.executor.run(&spec, log).await?;

        log.append_text("Clone completed.\n").await?;
        debug!(repository = %request.repository, "Repository fetched");
        Ok(())
    }
}

fn validate_repository(repository: &str) -> Result<(), FetchError> {
    let valid = REPOSITORY_REGEX.is_match(repository)
        && repository
            .split('/')
            .all(|segment| segment != "." && segment != ".." && !segment.starts_with('-'));

    if valid {
        Ok(())
    } else {
        Err(FetchError::InvalidRepository(repository.to_string()))
    }
}

fn validate_branch(branch: &str) -> Result<(), FetchError> {
    let valid = BRANCH_REGEX.is_match(branch)
        && !branch.starts_with('-')
        && !branch.starts_with('/')
        && !branch.ends_with('/')
        && !branch.ends_with('.')
        && !branch.ends_with(".lock")
        && !branch.contains("..")
        && !branch.contains("//");

    if valid {
        Ok(())
    } else {
        Err(FetchError::InvalidBranch(branch.to_string()))
    }
}
