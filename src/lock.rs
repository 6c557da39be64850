// src/lock.rs

//! Per-device exclusive lock
//!
//! One install or swap runs against a device at a time. The lock is an
//! advisory `flock(LOCK_EX)` on `<cache>/locks/<serial>.lock`, held for the
//! lifetime of the guard and released when the file is closed.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Held device lock
#[derive(Debug)]
pub struct DeviceLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    /// Acquire the lock, waiting for any other holder to finish
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(lock) = Self::try_acquire(path)? {
            return Ok(lock);
        }

        info!("Waiting for another deploy to release {}", path.display());
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        debug!("Acquired device lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Acquire the lock without blocking
    ///
    /// Returns `Ok(None)` when another process holds it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired device lock {}", path.display());
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}
