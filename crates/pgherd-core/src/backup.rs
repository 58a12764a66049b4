// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup collaborator used by `remove` when a backup is requested.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::model::InstanceRecord;

/// Takes a backup of an instance before it is removed.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Backend name for logging.
    fn provider_type(&self) -> &'static str;

    /// Back up `record`. An error aborts the removal.
    async fn backup(&self, record: &InstanceRecord) -> Result<()>;
}

/// Provider that performs no backup.
#[derive(Debug, Default)]
pub struct NoopBackup;

#[async_trait]
impl BackupProvider for NoopBackup {
    fn provider_type(&self) -> &'static str {
        "noop"
    }

    async fn backup(&self, record: &InstanceRecord) -> Result<()> {
        warn!(
            instance = %record.name(),
            data_dir = %record.spec.storage.data_directory.display(),
            "No backup provider configured, continuing without a backup"
        );
        Ok(())
    }
}

/// Provider that only counts calls, for tests.
#[derive(Debug, Default)]
pub struct RecordingBackup {
    calls: AtomicUsize,
}

impl RecordingBackup {
    /// Create a recording provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backups requested.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupProvider for RecordingBackup {
    fn provider_type(&self) -> &'static str {
        "recording"
    }

    async fn backup(&self, _record: &InstanceRecord) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
