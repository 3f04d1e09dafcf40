//! Command executor contract.
//!
//! An executor runs one command string to completion inside a job workspace,
//! streaming everything the process prints into the job's log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::LogSink;

/// A single command to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command text, interpreted by a shell.
    pub command: String,
    /// Directory the command runs in.
    pub working_dir: PathBuf,
    /// Variables layered over the executor's base environment. These win on collision.
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Why a command did not succeed.
///
/// Spawn errors and exit statuses share this type but keep distinct messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandFailure {
    /// The process could not be started at all.
    #[error("Command could not be started ({message}): {command}")]
    Spawn { command: String, message: String },

    /// The process exited with a non-zero code.
    #[error("Command failed (exit code {code}): {command}")]
    Exit { command: String, code: i32 },

    /// The process was killed by a signal and has no exit code.
    #[error("Command terminated by signal: {command}")]
    Signal { command: String },

    /// The process output could not be captured or written to the log.
    #[error("Command output could not be recorded ({message}): {command}")]
    Output { command: String, message: String },
}

impl CommandFailure {
    pub fn command(&self) -> &str {
        match self {
            CommandFailure::Spawn { command, .. }
            | CommandFailure::Exit { command, .. }
            | CommandFailure::Signal { command }
            | CommandFailure::Output { command, .. } => command,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandFailure::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Trait for command executors.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run the command to completion. Success iff the process exits with code 0.
    async fn run(&self, spec: &CommandSpec, log: &dyn LogSink) -> Result<(), CommandFailure>;
}
