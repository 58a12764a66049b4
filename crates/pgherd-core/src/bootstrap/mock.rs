// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provisioner for testing.
//!
//! Lays out a fake cluster on disk the way `initdb` would, without running any
//! PostgreSQL executable. A failure point can be armed to simulate a crash in any
//! step; files written before the failure are left behind like a real aborted run.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::provisioner::{ClusterProvisioner, InitRequest, ProvisionRequest};
use super::BootstrapStep;
use crate::error::Result;

/// What the last successful provisioning call asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDatabase {
    /// Database name.
    pub database: String,
    /// Owner role.
    pub owner: String,
    /// Owner password.
    pub owner_password: String,
}

/// Mock provisioner for testing.
#[derive(Default)]
pub struct MockProvisioner {
    fail_at: Mutex<Option<BootstrapStep>>,
    init_calls: AtomicUsize,
    provision_calls: AtomicUsize,
    last: Mutex<Option<ProvisionedDatabase>>,
}

impl MockProvisioner {
    /// Create a mock provisioner that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock provisioner that fails at `step`.
    pub fn failing_at(step: BootstrapStep) -> Self {
        Self {
            fail_at: Mutex::new(Some(step)),
            ..Self::default()
        }
    }

    /// Arm (or clear) the failure point for subsequent calls.
    pub async fn set_fail_at(&self, step: Option<BootstrapStep>) {
        *self.fail_at.lock().await = step;
    }

    /// Number of `init_cluster` calls.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of `provision` calls.
    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Last successful provisioning request.
    pub async fn last_provisioned(&self) -> Option<ProvisionedDatabase> {
        self.last.lock().await.clone()
    }

    async fn armed(&self, steps: &[BootstrapStep]) -> Option<BootstrapStep> {
        let fail_at = *self.fail_at.lock().await;
        fail_at.filter(|s| steps.contains(s))
    }
}

#[async_trait(?Send)]
impl ClusterProvisioner for MockProvisioner {
    fn provisioner_type(&self) -> &'static str {
        "mock"
    }

    async fn init_cluster(&self, req: &InitRequest<'_>) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let step = BootstrapStep::ClusterInit;
        let io = |e: std::io::Error| step.fail(e.to_string());

        fs::write(req.data_dir.join("PG_VERSION"), "16\n").map_err(io)?;
        fs::create_dir_all(req.data_dir.join("global")).map_err(io)?;

        if self.armed(&[step]).await.is_some() {
            return Err(step.fail_with_stderr(
                "initdb exited with exit status: 1",
                "initdb: error: simulated failure",
            ));
        }

        fs::create_dir_all(req.data_dir.join("base").join("1")).map_err(io)?;
        fs::create_dir_all(req.data_dir.join("pg_wal")).map_err(io)?;
        fs::write(req.data_dir.join("postgresql.conf"), "# initdb defaults\n").map_err(io)?;
        Ok(())
    }

    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<()> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(step) = self
            .armed(&[
                BootstrapStep::TempServerStart,
                BootstrapStep::ReadinessWait,
                BootstrapStep::Provisioning,
                BootstrapStep::Teardown,
            ])
            .await
        {
            return Err(step.fail("simulated failure"));
        }

        *self.last.lock().await = Some(ProvisionedDatabase {
            database: req.database.to_string(),
            owner: req.owner.to_string(),
            owner_password: req.owner_password.to_string(),
        });
        Ok(())
    }
}
