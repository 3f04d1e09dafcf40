//! Execution backends for the Stepwise pipeline runner.
//!
//! Provides:
//! - `ShellExecutor`, running step commands under a local shell
//! - `JobLogs`, the file-backed job log with a single writer per job
//! - `Workspaces`, per-attempt working directories
//! - `RepositoryFetcher`, shallow single-branch repository checkout

pub mod git;
pub mod log;
pub mod shell;
pub mod workspace;

pub use git::{FetchError, FetchRequest, RepositoryFetcher};
pub use log::{JobLog, JobLogs, NO_LOGS_YET};
pub use shell::ShellExecutor;
pub use stepwise_core::executor::{CommandExecutor, CommandFailure, CommandSpec};
pub use workspace::Workspaces;
