use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::job::JobId;

/// Private scratch directory of one job. Removed by `close` or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    pub fn create(job: JobId, root: Option<&Path>) -> CoreResult<Self> {
        let prefix = format!("hlsget-{}-", job.simple());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|err| CoreError::Io(format!("cannot create workspace: {}", err)))?;
        let path = dir.path().to_path_buf();
        debug!(%job, path = %path.display(), "workspace created");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }

    /// Removes the directory. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                warn!(path = %self.path.display(), error = %err, "workspace removal failed");
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.close();
    }
}
