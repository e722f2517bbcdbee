use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {0} exists; another helper is running or a previous run crashed")]
    Held(PathBuf),
    #[error("cannot create lock file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Exclusive lock held for the server's lifetime. The file is removed on drop.
///
/// A lock left behind by a crashed run is never removed automatically.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                info!("acquired lock {}", path.display());
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Held(path)),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove lock {}: {e}", self.path.display());
        }
    }
}
