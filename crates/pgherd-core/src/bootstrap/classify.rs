// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data directory classification and preparation.
//!
//! A non-empty data directory is only erased when everything in it looks like a
//! PostgreSQL cluster layout and it is either stamped with the generated marker or
//! stops short of a complete cluster (no database under `base/`). A complete cluster
//! without the marker belongs to someone else. Anything else is reported as
//! [`Error::UnsafeState`] and left alone.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use tracing::{info, warn};

use super::conffile::GENERATED_MARKER;
use super::{BootstrapStep, SOCKET_DIR};
use crate::error::{Error, Result};
use crate::model::StorageSpec;
use crate::supervisor::process::is_alive;

/// Top-level entries of a cluster layout besides `pg_*` and `postgresql*.conf`.
const CLUSTER_ENTRIES: &[&str] = &[
    "PG_VERSION",
    "base",
    "global",
    "postmaster.opts",
    "postmaster.pid",
    "current_logfiles",
    "log",
    SOCKET_DIR,
];

const UNSAFE_HINT: &str =
    "move or delete the directory contents yourself, or choose another dataDirectory";

/// What was found in a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataDirState {
    /// Directory does not exist.
    Missing,
    /// Directory exists and is empty.
    Empty,
    /// Leftovers of an aborted create; safe to erase.
    PartialInstall {
        /// Top-level entries found.
        entries: Vec<String>,
    },
    /// Content this tool did not create.
    Unrecognized {
        /// Entries outside the cluster layout.
        entries: Vec<String>,
    },
    /// `postmaster.pid` names a live process.
    ServerRunning {
        /// The live postmaster pid.
        pid: u32,
    },
}

fn is_cluster_entry(name: &str) -> bool {
    name.starts_with("pg_")
        || (name.starts_with("postgresql") && name.ends_with(".conf"))
        || CLUSTER_ENTRIES.contains(&name)
}

/// Whether `postgresql.conf` in `dir` carries the generated marker.
pub fn has_generated_config(dir: &Path) -> bool {
    fs::read_to_string(dir.join("postgresql.conf"))
        .map(|text| text.lines().any(|line| line.trim() == GENERATED_MARKER))
        .unwrap_or(false)
}

/// Prepend the generated marker to the `postgresql.conf` written by `initdb`, claiming
/// the fresh cluster before any later step can fail.
pub fn stamp_cluster(dir: &Path) -> io::Result<()> {
    if has_generated_config(dir) {
        return Ok(());
    }
    let path = dir.join("postgresql.conf");
    let existing = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    fs::write(&path, format!("{}\n{}", GENERATED_MARKER, existing))
}

/// Whether `base/` holds at least one database directory.
fn has_databases(dir: &Path) -> bool {
    fs::read_dir(dir.join("base"))
        .map(|entries| entries.flatten().any(|e| e.path().is_dir()))
        .unwrap_or(false)
}

fn postmaster_pid(dir: &Path) -> Option<u32> {
    let text = fs::read_to_string(dir.join("postmaster.pid")).ok()?;
    text.lines().next()?.trim().parse().ok()
}

/// Classify the contents of `dir`.
pub fn classify_data_dir(dir: &Path) -> io::Result<DataDirState> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DataDirState::Missing),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    if names.is_empty() {
        return Ok(DataDirState::Empty);
    }

    let unknown: Vec<String> = names
        .iter()
        .filter(|n| !is_cluster_entry(n))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Ok(DataDirState::Unrecognized { entries: unknown });
    }

    if let Some(pid) = postmaster_pid(dir)
        && is_alive(pid)
    {
        return Ok(DataDirState::ServerRunning { pid });
    }

    if has_generated_config(dir) {
        return Ok(DataDirState::PartialInstall { entries: names });
    }

    let signature = names
        .iter()
        .any(|n| n == "PG_VERSION" || n == "global" || n == SOCKET_DIR);
    if signature && !has_databases(dir) {
        Ok(DataDirState::PartialInstall { entries: names })
    } else {
        Ok(DataDirState::Unrecognized { entries: names })
    }
}

/// Create `dir` (and parents) with mode 0700, tightening an existing directory.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

fn erase_contents(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Ensure the data/log/archive directories exist and the data directory is empty.
///
/// A partial install is erased; unrecognized content or a running server fails with
/// [`Error::UnsafeState`] without touching anything.
pub fn prepare_directories(storage: &StorageSpec) -> Result<DataDirState> {
    let data_dir = &storage.data_directory;
    let step = BootstrapStep::DirectoryPreparation;

    let state = classify_data_dir(data_dir)
        .map_err(|e| step.fail(format!("inspect {}: {}", data_dir.display(), e)))?;

    match &state {
        DataDirState::Missing | DataDirState::Empty => {}
        DataDirState::PartialInstall { entries } => {
            warn!(
                data_dir = %data_dir.display(),
                entries = ?entries,
                "Found partial installation from a previous attempt, erasing"
            );
            erase_contents(data_dir)
                .map_err(|e| step.fail(format!("erase {}: {}", data_dir.display(), e)))?;
        }
        DataDirState::Unrecognized { entries } => {
            return Err(Error::UnsafeState {
                path: data_dir.clone(),
                reason: "directory is not empty and its contents were not created by pgherd"
                    .to_string(),
                entries: entries.clone(),
                hint: UNSAFE_HINT.to_string(),
            });
        }
        DataDirState::ServerRunning { pid } => {
            return Err(Error::UnsafeState {
                path: data_dir.clone(),
                reason: format!("a server (pid {}) is running on this directory", pid),
                entries: Vec::new(),
                hint: "stop the running server before creating an instance here".to_string(),
            });
        }
    }

    create_private_dir(data_dir)
        .map_err(|e| step.fail(format!("create {}: {}", data_dir.display(), e)))?;
    let mut others = vec![&storage.log_directory];
    if let Some(archive) = &storage.archive_directory {
        others.push(archive);
    }
    for dir in others {
        fs::create_dir_all(dir).map_err(|e| step.fail(format!("create {}: {}", dir.display(), e)))?;
    }

    info!(data_dir = %data_dir.display(), "Data directory ready");
    Ok(state)
}
