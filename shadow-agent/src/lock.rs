use std::{
    env,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use fs4::fs_std::FileExt as _;
use tracing::debug;

/// Exclusive advisory lock guaranteeing a single active rebuilder, across
/// threads and process restarts.
pub struct LockManager {
    path: PathBuf,
}

/// Held for the duration of one rebuild cycle. Dropping releases the lock on
/// every exit path.
#[derive(Debug)]
pub struct RebuildLock {
    file: File,
    path: PathBuf,
}

impl RebuildLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RebuildLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl LockManager {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking exclusive acquisition; `Ok(None)` when another rebuilder
    /// holds the lock.
    pub fn try_acquire(&self) -> io::Result<Option<RebuildLock>> {
        let (file, path) = self.open_lock_file()?;
        if file.try_lock_exclusive()? {
            debug!(path = %path.display(), "acquired shadow rebuild lock");
            Ok(Some(RebuildLock { file, path }))
        } else {
            Ok(None)
        }
    }

    pub fn acquire_blocking(&self) -> io::Result<RebuildLock> {
        let (file, path) = self.open_lock_file()?;
        file.lock_exclusive()?;
        Ok(RebuildLock { file, path })
    }

    /// Open without truncating so an already-running holder keeps its lock
    /// bytes; unwritable canonical paths fall back to the temp directory.
    fn open_lock_file(&self) -> io::Result<(File, PathBuf)> {
        match self.open_at(&self.path) {
            Ok(file) => Ok((file, self.path.clone())),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                let name = self
                    .path
                    .file_name()
                    .unwrap_or_else(|| "cnc-shadow.lock".as_ref());
                let fallback = env::temp_dir().join(name);
                let file = self.open_at(&fallback)?;
                Ok((file, fallback))
            }
            Err(err) => Err(err),
        }
    }

    fn open_at(&self, path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }
}
