// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process supervisor.
//!
//! Starts, stops and observes one instance's server, either by spawning and
//! signalling it directly or through the OS service manager:
//!
//! ```text
//!                 ┌──────────── Supervision ────────────┐
//!                 │                                     │
//!              Direct                          ServiceManaged
//!   spawn_detached / terminate           ServiceManager (systemctl)
//!   null-signal probe on pid             query → ServiceStatus mirror
//! ```
//!
//! Every method mutates the in-memory [`InstanceRecord`] only; persisting it is the
//! caller's job.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::logfile;
use crate::model::{
    InstanceRecord, InstanceSpec, InstanceState, ServiceSpec, ServiceStatus, Supervision,
};

pub mod mock;
pub mod process;
pub mod systemd;

pub use mock::MockServiceManager;
pub use process::{SERVER_LOG, StopOutcome, is_alive};
pub use systemd::{ServiceManager, ServiceState, SystemdConfig, SystemdManager, UnitDescriptor};

/// Supervisor timings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait between spawning the server and the first liveness probe.
    pub settle_time: Duration,
    /// Poll interval while waiting for a stopped server to exit.
    pub stop_poll_interval: Duration,
    /// Graceful stop ceiling before SIGKILL.
    pub stop_timeout: Duration,
    /// How long a killed server gets to disappear.
    pub kill_grace: Duration,
    /// Pause between stop and start on restart.
    pub restart_cooldown: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            settle_time: Duration::from_secs(2),
            stop_poll_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(2),
        }
    }
}

/// Supervises instances in both modes.
pub struct Supervisor {
    config: SupervisorConfig,
    systemd: SystemdConfig,
    services: Arc<dyn ServiceManager>,
}

impl Supervisor {
    /// Create a supervisor.
    pub fn new(
        config: SupervisorConfig,
        systemd: SystemdConfig,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            config,
            systemd,
            services,
        }
    }

    /// Timings in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the server and wait until it is confirmed alive.
    ///
    /// On failure the record is moved to `error` with `lastError` set.
    pub async fn start(&self, record: &mut InstanceRecord, binary: &Path) -> Result<()> {
        transition(record, InstanceState::Starting)?;

        let result = match record.spec.supervision.clone() {
            Supervision::Direct => self.start_direct(record, binary).await,
            Supervision::ServiceManaged(_) => self.start_service(record).await,
        };

        match result {
            Ok(()) => {
                transition(record, InstanceState::Running)?;
                record.status.start_time = Some(Utc::now());
                record.status.last_error = None;
                info!(instance = %record.name(), pid = ?record.status.pid, "Instance running");
                Ok(())
            }
            Err(e) => {
                mark_error(record, &e);
                Err(e)
            }
        }
    }

    async fn start_direct(&self, record: &mut InstanceRecord, binary: &Path) -> Result<()> {
        let storage = &record.spec.storage;
        let pid = process::spawn_detached(binary, &storage.data_directory, &storage.log_directory)?;

        tokio::time::sleep(self.config.settle_time).await;

        if is_alive(pid) {
            record.status.pid = Some(pid);
            return Ok(());
        }

        let log_path = storage.log_directory.join(SERVER_LOG);
        let tail = logfile::tail_or_empty(&log_path, 10);
        Err(Error::SupervisionFailure {
            message: format!(
                "server (pid {}) exited within {} ms of starting",
                pid,
                self.config.settle_time.as_millis()
            ),
            hint: if tail.is_empty() {
                format!("check {}", log_path.display())
            } else {
                format!("check {}; last lines: {}", log_path.display(), tail.replace('\n', " | "))
            },
        })
    }

    async fn start_service(&self, record: &mut InstanceRecord) -> Result<()> {
        let unit = record.spec.unit_name();
        self.services.start(&unit).await?;
        let state = self.services.query(&unit).await?;
        record.status.pid = None;
        record.status.service = Some(mirror(&state));
        if state.active {
            Ok(())
        } else {
            Err(Error::SupervisionFailure {
                message: format!("{} is {} after start", unit, state.sub_state),
                hint: format!("see journalctl -u {}", unit),
            })
        }
    }

    /// Stop the server and confirm it is gone.
    ///
    /// On failure the record is moved to `error` with `lastError` set.
    pub async fn stop(&self, record: &mut InstanceRecord) -> Result<()> {
        if record.status.state != InstanceState::Error {
            transition(record, InstanceState::Stopping)?;
        }

        let result = match record.spec.supervision {
            Supervision::Direct => self.stop_direct(record).await,
            Supervision::ServiceManaged(_) => self.stop_service(record).await,
        };

        match result {
            Ok(()) => {
                transition(record, InstanceState::Stopped)?;
                record.status.pid = None;
                record.status.last_error = None;
                info!(instance = %record.name(), "Instance stopped");
                Ok(())
            }
            Err(e) => {
                mark_error(record, &e);
                Err(e)
            }
        }
    }

    async fn stop_direct(&self, record: &mut InstanceRecord) -> Result<()> {
        let Some(pid) = record.status.pid else {
            return Ok(());
        };
        let outcome = process::terminate(
            pid,
            self.config.stop_poll_interval,
            self.config.stop_timeout,
            self.config.kill_grace,
        )
        .await?;
        debug!(instance = %record.name(), pid, outcome = ?outcome, "Server terminated");
        Ok(())
    }

    async fn stop_service(&self, record: &mut InstanceRecord) -> Result<()> {
        let unit = record.spec.unit_name();
        self.services.stop(&unit).await?;
        let state = self.services.query(&unit).await?;
        record.status.service = Some(mirror(&state));
        if state.active {
            return Err(Error::SupervisionFailure {
                message: format!("{} still active after stop", unit),
                hint: format!("see journalctl -u {}", unit),
            });
        }
        Ok(())
    }

    /// Bring the recorded status in line with reality. Returns whether it changed.
    ///
    /// Never spawns or signals anything.
    pub async fn reconcile(&self, record: &mut InstanceRecord) -> Result<bool> {
        let before = record.status.clone();
        match &record.spec.supervision {
            Supervision::Direct => self.reconcile_direct(record),
            Supervision::ServiceManaged(_) => self.reconcile_service(record).await?,
        }
        Ok(record.status != before)
    }

    fn reconcile_direct(&self, record: &mut InstanceRecord) {
        let status = &mut record.status;
        status.service = None;
        let alive = status.pid.is_some_and(is_alive);

        match (status.state, alive) {
            (InstanceState::Error, true) => {}
            (InstanceState::Error, false) => status.pid = None,
            (_, true) => status.state = InstanceState::Running,
            (InstanceState::Stopped, false) => status.pid = None,
            (state, false) => {
                warn!(
                    instance = %record.spec.name,
                    recorded_state = %state,
                    pid = ?status.pid,
                    "Recorded server process is gone, marking stopped"
                );
                status.state = InstanceState::Stopped;
                status.pid = None;
            }
        }
    }

    async fn reconcile_service(&self, record: &mut InstanceRecord) -> Result<()> {
        let state = self.services.query(&record.spec.unit_name()).await?;
        let status = &mut record.status;
        status.pid = None;
        status.service = Some(mirror(&state));

        let next = if state.active {
            InstanceState::Running
        } else if status.state == InstanceState::Error {
            InstanceState::Error
        } else {
            InstanceState::Stopped
        };
        if next != status.state {
            warn!(
                instance = %record.spec.name,
                recorded_state = %status.state,
                observed_state = %next,
                sub_state = %state.sub_state,
                "Service state differs from record, correcting"
            );
            status.state = next;
        }
        Ok(())
    }

    /// Render, install and enable the unit for `spec`.
    pub async fn install_service(
        &self,
        spec: &InstanceSpec,
        service: &ServiceSpec,
        binary: &Path,
    ) -> Result<()> {
        let unit = spec.unit_name();
        let descriptor = UnitDescriptor::for_instance(
            spec,
            service,
            binary,
            self.config.stop_timeout,
            &self.systemd,
        );
        self.services.install(&unit, &descriptor.render()).await?;
        self.services.enable(&unit).await?;
        info!(
            instance = %spec.name,
            unit = %unit,
            manager = self.services.manager_type(),
            "Service unit installed and enabled"
        );
        Ok(())
    }

    /// Disable and uninstall the unit for `spec`.
    pub async fn remove_service(&self, spec: &InstanceSpec) -> Result<()> {
        let unit = spec.unit_name();
        if let Err(e) = self.services.disable(&unit).await {
            warn!(
                instance = %spec.name,
                unit = %unit,
                error = %e,
                "Failed to disable service unit"
            );
        }
        self.services.uninstall(&unit).await?;
        info!(instance = %spec.name, unit = %unit, "Service unit removed");
        Ok(())
    }
}

fn mirror(state: &ServiceState) -> ServiceStatus {
    ServiceStatus {
        enabled: state.enabled,
        active: state.active,
        status: state.sub_state.clone(),
    }
}

fn transition(record: &mut InstanceRecord, next: InstanceState) -> Result<()> {
    let current = record.status.state;
    if !current.can_transition_to(next) {
        return Err(Error::Conflict(format!(
            "instance '{}' cannot go from {} to {}",
            record.name(),
            current,
            next
        )));
    }
    record.status.state = next;
    Ok(())
}

fn mark_error(record: &mut InstanceRecord, err: &Error) {
    warn!(instance = %record.name(), error = %err, "Instance moved to error state");
    record.status.state = InstanceState::Error;
    record.status.last_error = Some(err.to_string());
    if record.spec.supervision.is_direct() && !record.status.pid.is_some_and(is_alive) {
        record.status.pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;

    fn record(supervision: Supervision) -> InstanceRecord {
        InstanceRecord::new(InstanceSpec {
            name: "demo".to_string(),
            version: "16".to_string(),
            network: NetworkSpec {
                port: 5500,
                bind_address: "localhost".to_string(),
                max_connections: 100,
            },
            storage: StorageSpec {
                data_directory: PathBuf::from("/nonexistent/data"),
                log_directory: PathBuf::from("/nonexistent/logs"),
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
            supervision,
        })
    }

    fn supervisor(services: Arc<MockServiceManager>) -> Supervisor {
        Supervisor::new(SupervisorConfig::default(), SystemdConfig::default(), services)
    }

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.settle_time, Duration::from_secs(2));
        assert_eq!(config.stop_poll_interval, Duration::from_millis(500));
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.restart_cooldown, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_reconcile_direct_stale_pid() {
        let sup = supervisor(Arc::new(MockServiceManager::new()));
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();

        let mut rec = record(Supervision::Direct);
        rec.status.state = InstanceState::Running;
        rec.status.pid = Some(dead);

        assert!(sup.reconcile(&mut rec).await.unwrap());
        assert_eq!(rec.status.state, InstanceState::Stopped);
        assert_eq!(rec.status.pid, None);

        assert!(!sup.reconcile(&mut rec).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_direct_live_pid_is_unchanged() {
        let sup = supervisor(Arc::new(MockServiceManager::new()));
        let mut rec = record(Supervision::Direct);
        rec.status.state = InstanceState::Running;
        rec.status.pid = Some(std::process::id());
        assert!(!sup.reconcile(&mut rec).await.unwrap());
        assert_eq!(rec.status.state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_error_state() {
        let sup = supervisor(Arc::new(MockServiceManager::new()));
        let mut rec = record(Supervision::Direct);
        rec.status.state = InstanceState::Error;
        rec.status.last_error = Some("boom".to_string());
        sup.reconcile(&mut rec).await.unwrap();
        assert_eq!(rec.status.state, InstanceState::Error);
        assert_eq!(rec.status.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_service_start_stop_and_reconcile() {
        let services = Arc::new(MockServiceManager::new());
        let sup = supervisor(services.clone());
        let mut rec = record(Supervision::ServiceManaged(ServiceSpec::default()));
        let service = rec.spec.supervision.service().cloned().unwrap();

        sup.install_service(&rec.spec, &service, Path::new("/usr/bin/postgres"))
            .await
            .unwrap();
        assert!(services.is_installed("pgherd-demo.service").await);

        sup.start(&mut rec, Path::new("/usr/bin/postgres")).await.unwrap();
        assert_eq!(rec.status.state, InstanceState::Running);
        assert_eq!(rec.status.pid, None);
        let mirror = rec.status.service.clone().unwrap();
        assert!(mirror.enabled && mirror.active);
        assert_eq!(mirror.status, "running");

        // The unit dies behind our back.
        services.set_active("pgherd-demo.service", false).await;
        assert!(sup.reconcile(&mut rec).await.unwrap());
        assert_eq!(rec.status.state, InstanceState::Stopped);

        services.set_active("pgherd-demo.service", true).await;
        assert!(sup.reconcile(&mut rec).await.unwrap());
        assert_eq!(rec.status.state, InstanceState::Running);

        sup.stop(&mut rec).await.unwrap();
        assert_eq!(rec.status.state, InstanceState::Stopped);
        assert!(!rec.status.service.as_ref().unwrap().active);

        sup.remove_service(&rec.spec).await.unwrap();
        assert!(!services.is_installed("pgherd-demo.service").await);
    }

    #[tokio::test]
    async fn test_service_start_failure_records_error() {
        let services = Arc::new(MockServiceManager::new());
        services.set_fail_start(true);
        let sup = supervisor(services.clone());
        let mut rec = record(Supervision::ServiceManaged(ServiceSpec::default()));
        let service = rec.spec.supervision.service().cloned().unwrap();
        sup.install_service(&rec.spec, &service, Path::new("/usr/bin/postgres"))
            .await
            .unwrap();

        let err = sup.start(&mut rec, Path::new("/usr/bin/postgres")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SupervisionFailure);
        assert_eq!(rec.status.state, InstanceState::Error);
        assert!(rec.status.last_error.as_deref().unwrap().contains("failed"));

        // Error allows a retry.
        services.set_fail_start(false);
        sup.start(&mut rec, Path::new("/usr/bin/postgres")).await.unwrap();
        assert_eq!(rec.status.state, InstanceState::Running);
        assert_eq!(rec.status.last_error, None);
    }

    #[tokio::test]
    async fn test_start_from_running_is_rejected() {
        let sup = supervisor(Arc::new(MockServiceManager::new()));
        let mut rec = record(Supervision::Direct);
        rec.status.state = InstanceState::Running;
        let err = sup.start(&mut rec, Path::new("/usr/bin/postgres")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(rec.status.state, InstanceState::Running);
    }
}
