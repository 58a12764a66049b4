// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for pgherd-core integration tests.
//!
//! Provides TestContext with a temporary home, stand-in server executables and an
//! orchestrator wired to mock provisioning and service backends.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pgherd_core::backup::RecordingBackup;
use pgherd_core::bootstrap::MockProvisioner;
use pgherd_core::locator::SearchPaths;
use pgherd_core::store::RecordStore;
use pgherd_core::supervisor::{MockServiceManager, SupervisorConfig, is_alive};
use pgherd_core::{InstanceRecord, Orchestrator};

/// Stand-in server that stays up until signalled.
pub const HEALTHY_SERVER: &str =
    "#!/bin/sh\necho 'database system is ready to accept connections'\nexec sleep 300\n";

/// Stand-in server that dies right away.
pub const CRASHING_SERVER: &str =
    "#!/bin/sh\necho 'FATAL:  could not bind IPv4 address' >&2\nexit 1\n";

/// Test context with an orchestrator and handles on its mock collaborators.
pub struct TestContext {
    pub orchestrator: Orchestrator,
    pub provisioner: Arc<MockProvisioner>,
    pub services: Arc<MockServiceManager>,
    pub backup: Arc<RecordingBackup>,
    pub home: PathBuf,
    pub bin_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context whose provisioner always succeeds.
    pub fn new() -> Self {
        Self::with_provisioner(MockProvisioner::new())
    }

    /// Context over a specific provisioner.
    pub fn with_provisioner(provisioner: MockProvisioner) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let home = temp_dir.path().join("home");
        let bin_dir = temp_dir.path().join("bin");
        fs::create_dir_all(&bin_dir).expect("Failed to create bin dir");

        write_executable(&bin_dir.join("initdb"), "#!/bin/sh\nexit 0\n");
        write_executable(&bin_dir.join("postgres"), HEALTHY_SERVER);

        let provisioner = Arc::new(provisioner);
        let services = Arc::new(MockServiceManager::new());
        let backup = Arc::new(RecordingBackup::new());

        let orchestrator = Orchestrator::builder(&home)
            .search_paths(SearchPaths::new(vec![], vec![bin_dir.clone()]))
            .provisioner(provisioner.clone())
            .service_manager(services.clone())
            .backup_provider(backup.clone())
            .supervisor_config(fast_supervisor())
            .build();

        Self {
            orchestrator,
            provisioner,
            services,
            backup,
            home,
            bin_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Replace the stand-in server executable.
    pub fn install_server(&self, script: &str) {
        write_executable(&self.bin_dir.join("postgres"), script);
    }

    /// Scratch path inside the temporary directory.
    pub fn path(&self, relative: &str) -> PathBuf {
        self._temp_dir.path().join(relative)
    }

    /// Record as persisted, bypassing reconciliation.
    pub async fn stored(&self, name: &str) -> Option<InstanceRecord> {
        self.orchestrator
            .store()
            .get(name)
            .await
            .expect("Failed to read record")
    }
}

/// Timings short enough for tests.
pub fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        settle_time: Duration::from_millis(300),
        stop_poll_interval: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(3),
        kill_grace: Duration::from_secs(1),
        restart_cooldown: Duration::from_millis(10),
    }
}

pub fn write_executable(path: &Path, script: &str) {
    fs::write(path, script).expect("Failed to write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .expect("Failed to set permissions");
}

/// Poll until `pid` is gone, for at most two seconds.
pub async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..100 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
