//! Runner configuration parsing.
//!
//! ```kdl
//! database "/var/lib/stepwise/queue.db"
//! jobs-root "/var/lib/stepwise/jobs"
//! worker-id "builder-1"
//! concurrency 1
//! poll-interval-ms 1000
//! lease-secs 30
//! shell "/bin/sh"
//! git-host "https://github.com"
//! defaults {
//!     max-attempts 1
//!     timeout-secs 3600
//!     keep-completed 100
//!     keep-failed 500
//! }
//! ```

use crate::nodes::{require_integer, require_string};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stepwise_core::JobOptions;
use tracing::{debug, warn};
use url::Url;

/// File looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "stepwise.kdl";

/// Runner-wide configuration.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// SQLite database file backing the queue.
    pub database: PathBuf,
    /// Directory holding one log and workspace per job.
    pub jobs_root: PathBuf,
    /// Identity recorded on claimed jobs. Defaults to `<hostname>-<pid>`.
    pub worker_id: String,
    /// Number of jobs one worker runs at the same time.
    pub concurrency: usize,
    /// Sleep between claims while the queue is empty.
    pub poll_interval: Duration,
    /// How long a claim stays valid without a heartbeat. A job whose lease
    /// runs out is treated as stalled by any worker sharing the queue.
    pub lease: Duration,
    /// Interpreter that steps run under, invoked as `<shell> -c <step>`.
    pub shell: String,
    /// Base URL repositories are fetched from.
    pub git_host: Url,
    /// Options applied to submissions that do not set their own.
    pub defaults: JobDefaults,
}

/// Default queue options for new jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub timeout: Option<Duration>,
    pub keep_completed: Option<u32>,
    pub keep_failed: Option<u32>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        let options = JobOptions::default();
        Self {
            max_attempts: options.max_attempts,
            timeout: options.timeout,
            keep_completed: options.keep_completed,
            keep_failed: options.keep_failed,
        }
    }
}

impl JobDefaults {
    pub fn to_options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".stepwise/queue.db"),
            jobs_root: PathBuf::from(".stepwise/jobs"),
            worker_id: default_worker_id(),
            concurrency: 1,
            poll_interval: Duration::from_millis(1000),
            lease: Duration::from_secs(30),
            shell: "/bin/sh".to_string(),
            git_host: default_git_host(),
            defaults: JobDefaults::default(),
        }
    }
}

/// Worker identity unique to this host and process.
pub fn default_worker_id() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

fn default_git_host() -> Url {
    Url::parse("https://github.com").expect("static URL is valid")
}

impl SystemConfig {
    /// Check values that parse fine but cannot work.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll-interval-ms", "must be greater than 0"));
        }
        if self.lease.is_zero() {
            return Err(invalid("lease-secs", "must be greater than 0"));
        }
        if self.worker_id.trim().is_empty() {
            return Err(invalid("worker-id", "cannot be empty"));
        }
        if self.shell.trim().is_empty() {
            return Err(invalid("shell", "cannot be empty"));
        }
        if !matches!(self.git_host.scheme(), "http" | "https") {
            return Err(invalid("git-host", "must start with http:// or https://"));
        }
        if self.defaults.max_attempts == 0 {
            return Err(invalid("max-attempts", "must be at least 1"));
        }
        if self.defaults.timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("timeout-secs", "must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Parse system configuration from KDL text. Missing settings keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => config.database = PathBuf::from(require_string(node)?),
            "jobs-root" => config.jobs_root = PathBuf::from(require_string(node)?),
            "worker-id" => config.worker_id = require_string(node)?,
            "concurrency" => config.concurrency = require_integer(node)?,
            "poll-interval-ms" => {
                config.poll_interval = Duration::from_millis(require_integer(node)?)
            }
            "lease-secs" => config.lease = Duration::from_secs(require_integer(node)?),
            "shell" => config.shell = require_string(node)?,
            "git-host" => {
                let raw = require_string(node)?;
                config.git_host = Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                    field: "git-host".to_string(),
                    message: e.to_string(),
                })?;
            }
            "defaults" => config.defaults = parse_defaults(node)?,
            other => warn!(node = %other, "Ignoring unknown configuration node"),
        }
    }

    config.validate()?;
    Ok(config)
}

fn parse_defaults(node: &KdlNode) -> ConfigResult<JobDefaults> {
    let mut defaults = JobDefaults::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "max-attempts" => defaults.max_attempts = require_integer(child)?,
                "timeout-secs" => {
                    defaults.timeout = Some(Duration::from_secs(require_integer(child)?))
                }
                "keep-completed" => defaults.keep_completed = Some(require_integer(child)?),
                "keep-failed" => defaults.keep_failed = Some(require_integer(child)?),
                other => warn!(node = %other, "Ignoring unknown defaults entry"),
            }
        }
    }

    Ok(defaults)
}

/// Load configuration from `path`, or from `stepwise.kdl` in the working
/// directory when it exists, or fall back to defaults.
pub fn load_system_config(path: Option<&Path>) -> ConfigResult<SystemConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !candidate.exists() {
                debug!("No configuration file found, using defaults");
                return Ok(SystemConfig::default());
            }
            candidate
        }
    };

    debug!(path = %path.display(), "Loading configuration");
    let content = std::fs::read_to_string(&path)?;
    parse_system_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.defaults.max_attempts, 1);
        assert_eq!(config.git_host.as_str(), "https://github.com/");
        assert_eq!(config.lease, Duration::from_secs(30));
    }

    #[test]
    fn test_default_worker_id_names_this_process() {
        let id = default_worker_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
        assert_ne!(id, format!("-{}", std::process::id()));
        assert_eq!(SystemConfig::default().worker_id, id);
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            database "/var/lib/stepwise/queue.db"
            jobs-root "/var/lib/stepwise/jobs"
            worker-id "builder-1"
            concurrency 2
            poll-interval-ms 250
            lease-secs 45
            shell "/bin/bash"
            git-host "https://git.example.com"
            defaults {
                max-attempts 3
                timeout-secs 600
                keep-completed 10
                keep-failed 20
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.database, PathBuf::from("/var/lib/stepwise/queue.db"));
        assert_eq!(config.jobs_root, PathBuf::from("/var/lib/stepwise/jobs"));
        assert_eq!(config.worker_id, "builder-1");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease, Duration::from_secs(45));
        assert_eq!(config.shell, "/bin/bash");
        assert_eq!(config.git_host.host_str(), Some("git.example.com"));

        let options = config.defaults.to_options();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.timeout, Some(Duration::from_secs(600)));
        assert_eq!(options.keep_completed, Some(10));
        assert_eq!(options.keep_failed, Some(20));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = parse_system_config(r#"concurrency 4"#).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.defaults, JobDefaults::default());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let result = parse_system_config("concurrency 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_zero_lease() {
        let result = parse_system_config("lease-secs 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_negative_numbers() {
        let result = parse_system_config("poll-interval-ms -5");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_non_http_git_host() {
        let result = parse_system_config(r#"git-host "ssh://git.example.com""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_wrong_argument_type() {
        let result = parse_system_config(r#"concurrency "two""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stepwise.kdl");
        std::fs::write(&path, "worker-id \"from-file\"\n").unwrap();

        let config = load_system_config(Some(&path)).unwrap();
        assert_eq!(config.worker_id, "from-file");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_system_config(Some(&dir.path().join("absent.kdl")));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
