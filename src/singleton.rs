//! Single-instance guard.
//!
//! Two daemons tailing the same checkpoints would interleave offsets and
//! replay or skip pages, so the process takes an exclusive advisory lock on
//! a well-known pidfile at startup. The OS drops the lock on process exit,
//! clean or not.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fd_lock::{RwLock, RwLockWriteGuard};

pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("cinesyncd.lock")
}

pub fn open(path: &Path) -> Result<RwLock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;
    Ok(RwLock::new(file))
}

/// Take the exclusive lock, or fail if another instance holds it.
///
/// The returned guard must stay alive for the lifetime of the daemon.
pub fn try_exclusive<'a>(
    lock: &'a mut RwLock<File>,
    path: &Path,
) -> Result<RwLockWriteGuard<'a, File>> {
    match lock.try_write() {
        Ok(mut guard) => {
            let file = &mut *guard;
            file.set_len(0)?;
            write!(file, "{}", std::process::id())?;
            Ok(guard)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            anyhow::bail!(
                "another instance is already running (lock held at {})",
                path.display()
            )
        }
        Err(err) => Err(err).context("failed to acquire instance lock"),
    }
}
