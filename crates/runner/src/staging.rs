//! Host-side staging area for collected artifacts

use reprotest_common::{Result, Round};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// Per-invocation staging directory with one subdirectory per round.
///
/// Removed on drop unless `keep` was requested.
#[derive(Debug)]
pub struct StagingArea {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl StagingArea {
    /// Create a fresh staging area under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>, keep: bool) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("reprotest-");
            b
        };
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().to_path_buf();
        for round in Round::ALL {
            std::fs::create_dir_all(path.join(round.dir_name()))?;
        }
        Ok(Self {
            dir: Some(dir),
            path,
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory receiving the artifacts of `round`
    pub fn round_dir(&self, round: Round) -> PathBuf {
        self.path.join(round.dir_name())
    }

    /// Scratch directory for intermediate files of `round`
    pub fn work_dir(&self, round: Round) -> Result<PathBuf> {
        let dir = self.path.join(format!(".work-{}", round.dir_name()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// Remove the staging area now, or leave it in place if it is kept.
    pub fn finish(mut self) -> Option<PathBuf> {
        self.release()
    }

    #[allow(deprecated)]
    fn release(&mut self) -> Option<PathBuf> {
        let dir = self.dir.take()?;
        if self.keep {
            let path = dir.into_path();
            info!("Keeping staged artifacts in {}", path.display());
            Some(path)
        } else {
            if let Err(e) = dir.close() {
                warn!("Failed to remove staging area {}: {}", self.path.display(), e);
            }
            None
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        self.release();
    }
}
