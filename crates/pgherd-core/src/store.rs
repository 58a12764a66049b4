// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance record store.
//!
//! One TOML document per instance under `<home>/instances/<name>.toml`, plus the
//! global document `<home>/pgherd.toml`. Documents are written to a temporary file
//! in the same directory and renamed into place so a crash never leaves a torn
//! record behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{GlobalSettings, InstanceRecord};

/// File name of the global document.
pub const GLOBAL_FILE: &str = "pgherd.toml";

/// Persistence for instance records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load a record; `None` when absent.
    async fn get(&self, name: &str) -> Result<Option<InstanceRecord>>;

    /// Create or replace a record.
    async fn save(&self, record: &InstanceRecord) -> Result<()>;

    /// Delete a record. Returns false when there was nothing to delete.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Names of all records, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    /// Load the global document, falling back to defaults.
    async fn load_global(&self) -> Result<GlobalSettings>;

    /// Replace the global document.
    async fn save_global(&self, settings: &GlobalSettings) -> Result<()>;
}

/// File-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct TomlRecordStore {
    root: PathBuf,
}

impl TomlRecordStore {
    /// Store rooted at `root` (usually `PGHERD_HOME`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Path of the record document for `name`.
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.instances_dir().join(format!("{}.toml", name))
    }

    fn global_path(&self) -> PathBuf {
        self.root.join(GLOBAL_FILE)
    }
}

#[async_trait]
impl RecordStore for TomlRecordStore {
    async fn get(&self, name: &str) -> Result<Option<InstanceRecord>> {
        let path = self.record_path(name);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::persistence(path.display(), e)),
        };
        let record: InstanceRecord =
            toml::from_str(&text).map_err(|e| Error::persistence(path.display(), e))?;
        if record.spec.name != name {
            return Err(Error::PersistenceFailure(format!(
                "{}: record names instance '{}'",
                path.display(),
                record.spec.name
            )));
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &InstanceRecord) -> Result<()> {
        let path = self.record_path(record.name());
        let text = toml::to_string_pretty(record)
            .map_err(|e| Error::persistence(format!("serialize '{}'", record.name()), e))?;
        write_atomic(&path, &text).await?;
        debug!(instance = %record.name(), state = %record.status.state, "Saved instance record");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.record_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::persistence(path.display(), e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.instances_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::persistence(dir.display(), e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::persistence(dir.display(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn load_global(&self) -> Result<GlobalSettings> {
        let path = self.global_path();
        match fs::read_to_string(&path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| Error::persistence(path.display(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GlobalSettings::default()),
            Err(e) => Err(Error::persistence(path.display(), e)),
        }
    }

    async fn save_global(&self, settings: &GlobalSettings) -> Result<()> {
        let text = toml::to_string_pretty(settings)
            .map_err(|e| Error::persistence("serialize global settings", e))?;
        write_atomic(&self.global_path(), &text).await
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::PersistenceFailure(format!("{}: no parent", path.display())))?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::persistence(dir.display(), e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = dir.join(format!(".{}.tmp", file_name));
    fs::write(&tmp, contents)
        .await
        .map_err(|e| Error::persistence(tmp.display(), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::persistence(path.display(), e))
}
