use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::StorageError;

pub(crate) const LOCK_FILE: &str = ".demogen.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    owner: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Exclusive ownership of a warehouse for one run. Released on drop.
///
/// A lock whose recorded process no longer exists is reclaimed, so a crashed
/// run does not wedge the warehouse.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owner: String,
}

impl RunLock {
    pub(crate) fn acquire(root: &Path, owner: &str) -> Result<Self, StorageError> {
        let path = root.join(LOCK_FILE);
        if let Some(file) = create_exclusive(&path)? {
            return Self::claim(path, owner, file);
        }

        let holder = read_holder(&path);
        if let Some(info) = &holder {
            if !process_alive(info.pid) {
                tracing::warn!(
                    owner = %info.owner,
                    pid = info.pid,
                    acquired_at = %info.acquired_at,
                    "reclaiming run lock left by a dead process"
                );
                std::fs::remove_file(&path).map_err(|source| StorageError::Io {
                    path: path.clone(),
                    source,
                })?;
                if let Some(file) = create_exclusive(&path)? {
                    return Self::claim(path, owner, file);
                }
                // Lost the race to another run.
                let owner = read_holder(&path).map(|i| i.owner);
                return Err(locked(path, owner));
            }
        }
        Err(locked(path, holder.map(|i| i.owner)))
    }

    /// Record ownership in a freshly created lock file. The guard owns the
    /// file before the write, so a failed write removes it again.
    pub(crate) fn claim(
        path: PathBuf,
        owner: &str,
        mut out: impl Write,
    ) -> Result<Self, StorageError> {
        let lock = Self {
            path,
            owner: owner.to_string(),
        };
        let info = LockInfo {
            owner: owner.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_vec(&info).map_err(|source| StorageError::Serde {
            name: LOCK_FILE.to_string(),
            source,
        })?;
        out.write_all(&json)
            .and_then(|()| out.flush())
            .map_err(|source| StorageError::Io {
                path: lock.path.clone(),
                source,
            })?;

        tracing::debug!(owner = %owner, lock = %lock.path.display(), "acquired run lock");
        Ok(lock)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// `Ok(None)` when the lock file already exists.
fn create_exclusive(path: &Path) -> Result<Option<File>, StorageError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(source) => Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_holder(path: &Path) -> Option<LockInfo> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok())
}

fn locked(path: PathBuf, owner: Option<String>) -> StorageError {
    StorageError::Locked {
        owner: owner.unwrap_or_else(|| "unknown".to_string()),
        path,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

// Without a portable liveness check every recorded holder counts as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
