//! Per-attempt working directories.

use std::io;
use std::path::PathBuf;
use stepwise_core::JobId;
use tracing::debug;

/// Layout of job workspaces under a jobs root:
/// `<root>/<job_id>/workspace/<attempt>/`.
#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, job_id: JobId, attempt: u32) -> PathBuf {
        self.root
            .join(job_id.to_string())
            .join("workspace")
            .join(attempt.to_string())
    }

    /// Create a fresh, empty workspace for an attempt, discarding leftovers
    /// from an earlier run with the same number.
    pub async fn prepare(&self, job_id: JobId, attempt: u32) -> io::Result<PathBuf> {
        let path = self.path(job_id, attempt);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed stale workspace"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_creates_attempt_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = Workspaces::new(dir.path());
        let id = JobId::new();

        let path = workspaces.prepare(id, 1).await.unwrap();
        assert!(path.is_dir());
        assert_eq!(path, dir.path().join(id.to_string()).join("workspace").join("1"));
    }

    #[tokio::test]
    async fn test_prepare_discards_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = Workspaces::new(dir.path());
        let id = JobId::new();

        let path = workspaces.prepare(id, 1).await.unwrap();
        std::fs::write(path.join("stale.txt"), "old").unwrap();

        let path = workspaces.prepare(id, 1).await.unwrap();
        assert!(!path.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_attempts_get_separate_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = Workspaces::new(dir.path());
        let id = JobId::new();

        let first = workspaces.prepare(id, 1).await.unwrap();
        std::fs::write(first.join("build.out"), "1").unwrap();
        let second = workspaces.prepare(id, 2).await.unwrap();

        assert_ne!(first, second);
        assert!(first.join("build.out").exists());
        assert!(!second.join("build.out").exists());
    }
}
