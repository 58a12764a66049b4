// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap sequencer.
//!
//! Turns a bare [`InstanceSpec`] into an initialized, credentialed data directory:
//!
//! ```text
//!  prepare dirs ──► initdb ──► temp server (socket only) ──► wait ready
//!       │                                                        │
//!       │ partial install? erase                                 ▼
//!       │ unrecognized?    UnsafeState              provision role + database
//!       │                                                        │
//!       ▼                                                        ▼
//!                        write postgresql.conf/pg_hba.conf ◄── teardown
//! ```
//!
//! Any failure after `initdb` leaves a partially initialized directory behind. The
//! classifier in [`classify`] recognizes it on the next attempt and erases it, so a
//! retried create heals itself instead of needing manual cleanup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::locator::ServerBinaries;
use crate::model::InstanceSpec;

pub mod classify;
pub mod conffile;
pub mod mock;
pub mod password;
mod provisioner;

pub use classify::{DataDirState, classify_data_dir, prepare_directories};
pub use conffile::{GENERATED_MARKER, access_rules, server_config, write_config_files};
pub use mock::MockProvisioner;
pub use provisioner::*;

/// Socket subdirectory inside the data directory.
pub const SOCKET_DIR: &str = "sockets";

/// Superuser created by `initdb`. Its password is set during provisioning and discarded.
pub const SUPERUSER: &str = "postgres";

/// Steps of the bootstrap sequence, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Directory creation and partial-install classification.
    DirectoryPreparation,
    /// `initdb`.
    ClusterInit,
    /// Spawning the socket-only server.
    TempServerStart,
    /// Polling the socket until the server answers.
    ReadinessWait,
    /// Role, database and grants.
    Provisioning,
    /// Stopping the temporary server.
    Teardown,
    /// Writing the generated configuration files.
    ConfigMaterialization,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapStep::DirectoryPreparation => "directory preparation",
            BootstrapStep::ClusterInit => "cluster initialization",
            BootstrapStep::TempServerStart => "bootstrap server start",
            BootstrapStep::ReadinessWait => "readiness wait",
            BootstrapStep::Provisioning => "provisioning",
            BootstrapStep::Teardown => "bootstrap server teardown",
            BootstrapStep::ConfigMaterialization => "config materialization",
        };
        f.write_str(s)
    }
}

impl BootstrapStep {
    /// Build a failure for this step.
    pub fn fail(self, message: impl Into<String>) -> Error {
        Error::BootstrapFailure {
            step: self,
            message: message.into(),
            stderr: None,
        }
    }

    /// Build a failure for this step carrying a captured error stream.
    pub fn fail_with_stderr(self, message: impl Into<String>, stderr: impl Into<String>) -> Error {
        Error::BootstrapFailure {
            step: self,
            message: message.into(),
            stderr: Some(stderr.into()),
        }
    }
}

/// Bootstrap timings.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Pause between readiness probes.
    pub ready_poll_interval: Duration,
    /// Readiness probe ceiling.
    pub ready_max_attempts: u32,
    /// How long the temporary server gets to exit after SIGTERM.
    pub teardown_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval: Duration::from_secs(1),
            ready_max_attempts: 30,
            teardown_timeout: Duration::from_secs(10),
        }
    }
}

/// Drives the bootstrap steps for one instance.
pub struct BootstrapSequencer {
    provisioner: Arc<dyn ClusterProvisioner>,
}

impl BootstrapSequencer {
    /// Create a sequencer over a provisioner backend.
    pub fn new(provisioner: Arc<dyn ClusterProvisioner>) -> Self {
        Self { provisioner }
    }

    /// Run every step for `spec`. On success the generated owner password has been
    /// written into `spec.database.password`.
    pub async fn run(&self, spec: &mut InstanceSpec, binaries: &ServerBinaries) -> Result<()> {
        let name = spec.name.clone();

        let state = prepare_directories(&spec.storage)?;
        info!(
            instance = %name,
            data_dir = %spec.storage.data_directory.display(),
            state = ?state,
            "Prepared directories"
        );

        self.provisioner
            .init_cluster(&InitRequest {
                initdb: &binaries.initdb,
                data_dir: &spec.storage.data_directory,
                superuser: SUPERUSER,
                encoding: &spec.database.encoding,
                locale: &spec.database.locale,
            })
            .await?;
        let data_dir = &spec.storage.data_directory;
        classify::stamp_cluster(data_dir).map_err(|e| {
            BootstrapStep::ClusterInit.fail(format!("stamp {}: {}", data_dir.display(), e))
        })?;
        let socket_dir = spec.socket_dir();
        classify::create_private_dir(&socket_dir).map_err(|e| {
            BootstrapStep::ClusterInit.fail(format!("create {}: {}", socket_dir.display(), e))
        })?;
        info!(
            instance = %name,
            provisioner = self.provisioner.provisioner_type(),
            "Cluster initialized"
        );

        let owner_password = password::generate_password();
        self.provisioner
            .provision(&ProvisionRequest {
                postgres: &binaries.postgres,
                data_dir: &spec.storage.data_directory,
                socket_dir: &socket_dir,
                log_dir: &spec.storage.log_directory,
                port: spec.network.port,
                superuser: SUPERUSER,
                database: &spec.database.name,
                owner: &spec.database.owner,
                owner_password: &owner_password,
                encoding: &spec.database.encoding,
                locale: &spec.database.locale,
            })
            .await?;
        info!(
            instance = %name,
            database = %spec.database.name,
            owner = %spec.database.owner,
            "Provisioned database and owner role"
        );

        spec.database.password = owner_password;
        write_config_files(spec)?;
        info!(instance = %name, port = spec.network.port, "Wrote generated configuration");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_display() {
        assert_eq!(BootstrapStep::ClusterInit.to_string(), "cluster initialization");
        assert_eq!(BootstrapStep::ReadinessWait.to_string(), "readiness wait");
    }

    #[test]
    fn test_default_config() {
        let config = BootstrapConfig::default();
        assert_eq!(config.ready_poll_interval, Duration::from_secs(1));
        assert_eq!(config.ready_max_attempts, 30);
        assert_eq!(config.teardown_timeout, Duration::from_secs(10));
    }

    fn demo_spec(root: &std::path::Path) -> InstanceSpec {
        use crate::model::*;
        InstanceSpec {
            name: "demo".to_string(),
            version: "16".to_string(),
            network: NetworkSpec {
                port: 5500,
                bind_address: "localhost".to_string(),
                max_connections: 100,
            },
            storage: StorageSpec {
                data_directory: root.join("data"),
                log_directory: root.join("logs"),
                archive_directory: None,
            },
            database: DatabaseSpec {
                name: "demo".to_string(),
                owner: "demo".to_string(),
                password: String::new(),
                encoding: "UTF8".to_string(),
                locale: "C".to_string(),
                timezone: "UTC".to_string(),
            },
            security: SecuritySpec::default(),
            performance: None,
            backup: None,
            supervision: Supervision::Direct,
        }
    }

    fn binaries() -> ServerBinaries {
        ServerBinaries {
            initdb: "/usr/bin/initdb".into(),
            postgres: "/usr/bin/postgres".into(),
        }
    }

    #[tokio::test]
    async fn test_run_writes_config_and_password() {
        let temp = tempfile::TempDir::new().unwrap();
        let provisioner = Arc::new(MockProvisioner::new());
        let sequencer = BootstrapSequencer::new(provisioner.clone());
        let mut spec = demo_spec(temp.path());

        sequencer.run(&mut spec, &binaries()).await.unwrap();

        assert_eq!(spec.database.password.len(), password::PASSWORD_LEN);
        let provisioned = provisioner.last_provisioned().await.unwrap();
        assert_eq!(provisioned.owner_password, spec.database.password);
        assert_eq!(provisioned.database, "demo");

        let conf = std::fs::read_to_string(temp.path().join("data/postgresql.conf")).unwrap();
        assert!(conf.starts_with(GENERATED_MARKER));
        assert!(conf.lines().any(|l| l == "port = 5500"));
        assert!(temp.path().join("data").join(SOCKET_DIR).is_dir());
        assert!(temp.path().join("logs").is_dir());
    }

    #[tokio::test]
    async fn test_failed_provisioning_reports_step_and_heals_on_retry() {
        let temp = tempfile::TempDir::new().unwrap();
        let provisioner = Arc::new(MockProvisioner::failing_at(BootstrapStep::ReadinessWait));
        let sequencer = BootstrapSequencer::new(provisioner.clone());

        let mut spec = demo_spec(temp.path());
        let err = sequencer.run(&mut spec, &binaries()).await.unwrap_err();
        match err {
            Error::BootstrapFailure { step, .. } => assert_eq!(step, BootstrapStep::ReadinessWait),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(spec.database.password.is_empty());
        assert!(temp.path().join("data/PG_VERSION").exists());
        assert!(classify::has_generated_config(&temp.path().join("data")));

        provisioner.set_fail_at(None).await;
        let mut spec = demo_spec(temp.path());
        sequencer.run(&mut spec, &binaries()).await.unwrap();
        assert_eq!(provisioner.init_calls(), 2);
        assert!(!spec.database.password.is_empty());
    }
}
