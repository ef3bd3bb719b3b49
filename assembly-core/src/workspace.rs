use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

/// Scoped scratch directory for one job run.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    pub root: PathBuf,
    pub segments: PathBuf,
    pub assembly: PathBuf,
}

impl JobWorkspace {
    pub fn new(work_dir: &Path, job_id: &str) -> Self {
        let root = work_dir.join(job_id);
        let segments = root.join("segments");
        let assembly = root.join("assembly");
        Self {
            root,
            segments,
            assembly,
        }
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        // Leftovers from an earlier run of the same episode are stale.
        if fs::try_exists(&self.root).await.unwrap_or(false) {
            fs::remove_dir_all(&self.root).await?;
        }
        fs::create_dir_all(&self.segments).await?;
        fs::create_dir_all(&self.assembly).await?;
        Ok(())
    }

    pub fn segment_path(&self, index: usize, extension: &str) -> PathBuf {
        self.segments.join(format!("segment_{index:04}.{extension}"))
    }

    pub async fn release(&self) {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.root.display(), error = %err, "failed to clean job workspace");
            }
        }
    }
}
