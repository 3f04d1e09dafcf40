//! File-backed job logs.
//!
//! Every job has one append-only text file at `<jobs_root>/<job_id>/log.txt`.
//! All writers of a job go through a single writer task, so appends from the
//! runner and from both output channels of a step never interleave mid-chunk.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use stepwise_core::{Error, JobId, LogSink, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// File name of a job log inside the job directory.
pub const LOG_FILE_NAME: &str = "log.txt";

/// Returned by `read` for jobs that have not written anything yet.
pub const NO_LOGS_YET: &str = "No logs yet.";

const WRITER_QUEUE_DEPTH: usize = 64;

/// Handle on the log files under a jobs root.
#[derive(Debug, Clone)]
pub struct JobLogs {
    root: PathBuf,
}

impl JobLogs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of a job's log file.
    pub fn path(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string()).join(LOG_FILE_NAME)
    }

    /// Open a job's log for appending. The file is created on first append.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, job_id: JobId) -> JobLog {
        JobLog::spawn(self.path(job_id))
    }

    /// Full log text, or the `No logs yet.` placeholder when there is no file.
    pub async fn read(&self, job_id: JobId) -> Result<String> {
        match tokio::fs::read(self.path(job_id)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(NO_LOGS_YET.to_string()),
            Err(e) => Err(e.into()),
        }
    }
}

struct AppendRequest {
    chunk: Bytes,
    ack: oneshot::Sender<io::Result<()>>,
}

/// Append handle for one job log. Clones share the same writer task.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
    tx: mpsc::Sender<AppendRequest>,
}

impl JobLog {
    fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        tokio::spawn(write_loop(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for JobLog {
    async fn append(&self, chunk: Bytes) -> Result<()> {
        let (ack, written) = oneshot::channel();
        self.tx
            .send(AppendRequest { chunk, ack })
            .await
            .map_err(|_| Error::Internal("log writer stopped".to_string()))?;

        written
            .await
            .map_err(|_| Error::Internal("log writer dropped an append".to_string()))??;
        Ok(())
    }
}

/// Drains append requests in order, acknowledging each once it is flushed.
async fn write_loop(path: PathBuf, mut rx: mpsc::Receiver<AppendRequest>) {
    let mut file: Option<File> = None;

    while let Some(request) = rx.recv().await {
        let result = write_chunk(&path, &mut file, &request.chunk).await;
        if let Err(e) = &result {
            warn!(path = %path.display(), error = %e, "Failed to append to job log");
            // Reopen on the next append.
            file = None;
        }
        let _ = request.ack.send(result);
    }

    debug!(path = %path.display(), "Job log writer finished");
}

async fn write_chunk(path: &Path, file: &mut Option<File>, chunk: &[u8]) -> io::Result<()> {
    if file.is_none() {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        *file = Some(opened);
    }

    let Some(file) = file.as_mut() else {
        return Err(io::Error::other("job log is not open"));
    };
    file.write_all(chunk).await?;
    file.flush().await
}
