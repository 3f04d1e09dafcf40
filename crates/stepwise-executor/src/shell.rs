//! Local shell executor.
//!
//! Runs each command as `<shell> -c <command>` in its own process group, with
//! stdout and stderr streamed into the job log as chunks arrive.

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::process::Stdio;
use stepwise_core::LogSink;
use stepwise_core::executor::{CommandExecutor, CommandFailure, CommandSpec};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default interpreter for step commands.
pub const DEFAULT_SHELL: &str = "/bin/sh";

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Executor that runs commands through a local shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

/// Kills the whole process group when dropped while armed.
///
/// Dropping the `run` future (an outer timeout) drops this guard, which takes
/// the shell and everything it started down with it.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        let pgid = pid
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid = pgid.as_raw(), "Killing process group");
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                // ESRCH: the group already exited.
                if e != nix::errno::Errno::ESRCH {
                    warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group");
                }
            }
        }
    }
}

/// Copy everything from `reader` into the log, one append per read.
async fn pump<R>(reader: Option<R>, log: &dyn LogSink) -> Result<(), String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(());
        }
        log.append(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(|e| e.to_string())?;
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn run(&self, spec: &CommandSpec, log: &dyn LogSink) -> Result<(), CommandFailure> {
        debug!(command = %spec.command, cwd = %spec.working_dir.display(), "Running command");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandFailure::Spawn {
                command: spec.command.clone(),
                message: e.to_string(),
            })?;

        let mut guard = ProcessGroupGuard::new(child.id());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (out, err, status) = tokio::join!(pump(stdout, log), pump(stderr, log), child.wait());
        guard.disarm();

        let output_failure = |message: String| CommandFailure::Output {
            command: spec.command.clone(),
            message,
        };
        out.map_err(output_failure)?;
        err.map_err(output_failure)?;
        let status = status.map_err(|e| output_failure(e.to_string()))?;

        if status.success() {
            return Ok(());
        }

        match status.code() {
            Some(code) => Err(CommandFailure::Exit {
                command: spec.command.clone(),
                code,
            }),
            None => Err(CommandFailure::Signal {
                command: spec.command.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stepwise_core::MemoryLogSink;

    fn spec(command: &str, dir: &std::path::Path) -> CommandSpec {
        CommandSpec::new(command, dir)
    }

    #[tokio::test]
    async fn test_success_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        ShellExecutor::default()
            .run(&spec("echo hello && echo world", dir.path()), &log)
            .await
            .unwrap();

        assert_eq!(log.contents(), "hello\nworld\n");
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        ShellExecutor::default()
            .run(&spec("echo oops 1>&2", dir.path()), &log)
            .await
            .unwrap();

        assert_eq!(log.contents(), "oops\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        let result = ShellExecutor::default()
            .run(&spec("echo partial; exit 3", dir.path()), &log)
            .await;

        assert_eq!(
            result,
            Err(CommandFailure::Exit {
                command: "echo partial; exit 3".to_string(),
                code: 3,
            })
        );
        assert_eq!(log.contents(), "partial\n");
    }

    #[tokio::test]
    async fn test_silent_failure_and_noisy_success() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();
        let executor = ShellExecutor::default();

        assert!(executor.run(&spec("false", dir.path()), &log).await.is_err());
        assert!(
            executor
                .run(&spec("echo error: not really 1>&2", dir.path()), &log)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        let result = ShellExecutor::new("/nonexistent/shell")
            .run(&spec("true", dir.path()), &log)
            .await;

        assert!(matches!(result, Err(CommandFailure::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        let result = ShellExecutor::default()
            .run(&spec("true", &dir.path().join("absent")), &log)
            .await;

        assert!(matches!(result, Err(CommandFailure::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        ShellExecutor::default()
            .run(&spec("touch created.txt", dir.path()), &log)
            .await
            .unwrap();

        assert!(dir.path().join("created.txt").exists());
    }

    #[tokio::test]
    async fn test_job_env_overrides_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        let spec = spec("echo \"$STEPWISE_TEST_VAR:$HOME\"", dir.path())
            .with_var("STEPWISE_TEST_VAR", "from-job")
            .with_var("HOME", "/job-home");

        ShellExecutor::default().run(&spec, &log).await.unwrap();
        assert_eq!(log.contents(), "from-job:/job-home\n");
    }

    #[tokio::test]
    async fn test_shell_features_are_available() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();

        ShellExecutor::default()
            .run(
                &spec("printf 'b\\na\\n' | sort && if true; then echo ok; fi", dir.path()),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(log.contents(), "a\nb\nok\n");
    }

    #[tokio::test]
    async fn test_dropping_run_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLogSink::new();
        let marker = dir.path().join("marker");

        let command = format!("(sleep 1; touch {}) & wait", marker.display());
        let executor = ShellExecutor::default();
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            executor.run(&spec(&command, dir.path()), &log),
        )
        .await;
        assert!(result.is_err(), "run should still be in flight");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background child survived the kill");
    }
}
