// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance advisory locks.
//!
//! Mutating operations hold an exclusive `flock` on `<home>/locks/<name>.lock` so two
//! invocations against the same instance cannot interleave. The lock is released
//! when the guard is dropped (or the process exits).

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{Error, Result};

/// Held lock on one instance name.
#[derive(Debug)]
pub struct InstanceLock {
    name: String,
    path: PathBuf,
    _lock: Flock<File>,
}

impl InstanceLock {
    /// Try to take the lock for `name` under `lock_dir` without blocking.
    ///
    /// Returns `Conflict` when another operation holds it.
    pub fn acquire(lock_dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir)
            .map_err(|e| Error::persistence(lock_dir.display(), e))?;
        let path = lock_dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::persistence(path.display(), e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(instance = %name, path = %path.display(), "Acquired instance lock");
                Ok(Self {
                    name: name.to_string(),
                    path,
                    _lock: lock,
                })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(Error::Conflict(format!(
                "another operation on instance '{}' is in progress (lock {})",
                name,
                path.display()
            ))),
            Err((_, errno)) => Err(Error::persistence(path.display(), errno)),
        }
    }

    /// Locked instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_conflicts_until_release() {
        let temp = TempDir::new().unwrap();
        let first = InstanceLock::acquire(temp.path(), "demo").unwrap();
        assert_eq!(first.name(), "demo");

        let err = InstanceLock::acquire(temp.path(), "demo").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        drop(first);
        assert!(InstanceLock::acquire(temp.path(), "demo").is_ok());
    }

    #[test]
    fn test_distinct_names_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let _a = InstanceLock::acquire(temp.path(), "a").unwrap();
        let _b = InstanceLock::acquire(temp.path(), "b").unwrap();
    }
}
