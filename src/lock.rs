use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::{EngineError, Result};

pub const LOCK_FILE_NAME: &str = "tf.lock";

/// Advisory cross-process lock guarding the resource directory and terraform state.
///
/// Every acquisition opens its own descriptor, so tasks inside one process
/// contend for the lock exactly like separate processes do.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    retry: Duration,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release file lock");
        }
    }
}

impl FileLock {
    pub fn new(dir: &Path, retry: Duration) -> Self {
        Self {
            path: dir.join(LOCK_FILE_NAME),
            retry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking attempt; `Ok(None)` when another holder has the lock.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| EngineError::io(&self.path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLockGuard { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(EngineError::io(&self.path, e)),
        }
    }

    /// Blocks (asynchronously) until the lock is held. There is no timeout.
    pub async fn acquire(&self) -> Result<FileLockGuard> {
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            tracing::trace!(path = %self.path.display(), "file lock busy, retrying");
            tokio::time::sleep(self.retry).await;
        }
    }
}
