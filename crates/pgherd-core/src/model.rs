// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance records: the declarative spec plus the observed status.
//!
//! Records are stored as TOML with camelCase keys so that hand-edited files
//! line up with the field names used throughout the tool.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted instance name (PostgreSQL identifier limit).
pub const MAX_NAME_LEN: usize = 63;

/// Validate an instance name: lowercase alphanumerics and hyphens, starting with an
/// alphanumeric character.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidSpec("instance name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidSpec(format!(
            "instance name '{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if name.starts_with('-') {
        return Err(Error::InvalidSpec(format!(
            "instance name '{}' must start with a letter or digit",
            name
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(Error::InvalidSpec(format!(
            "instance name '{}' contains invalid character '{}' (allowed: a-z, 0-9, '-')",
            name, c
        )));
    }
    Ok(())
}

/// Persisted record: spec plus last known status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// User intent.
    pub spec: InstanceSpec,
    /// Observed state.
    #[serde(default)]
    pub status: InstanceStatus,
}

impl InstanceRecord {
    /// New record in the `stopped` state.
    pub fn new(spec: InstanceSpec) -> Self {
        Self {
            spec,
            status: InstanceStatus::default(),
        }
    }

    /// Instance name (record key).
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Declarative instance specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Unique instance name.
    pub name: String,
    /// Server version (`major` or `major.minor`).
    pub version: String,
    /// Network settings.
    pub network: NetworkSpec,
    /// Directory layout.
    pub storage: StorageSpec,
    /// Database and owner role.
    pub database: DatabaseSpec,
    /// Access control.
    #[serde(default)]
    pub security: SecuritySpec,
    /// Server tuning knobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceSpec>,
    /// Backup settings (recorded, not acted upon).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,
    /// Supervision mode, persisted as the optional `service` table.
    #[serde(
        rename = "service",
        default,
        skip_serializing_if = "Supervision::is_direct"
    )]
    pub supervision: Supervision,
}

impl InstanceSpec {
    /// Deterministic service unit name for this instance.
    pub fn unit_name(&self) -> String {
        unit_name_for(&self.name)
    }

    /// Unix socket directory inside the data directory.
    pub fn socket_dir(&self) -> PathBuf {
        self.storage.data_directory.join(crate::bootstrap::SOCKET_DIR)
    }
}

/// Service unit name derived from an instance name.
pub fn unit_name_for(instance: &str) -> String {
    format!("pgherd-{}.service", instance)
}

/// Network settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// TCP port, unique across known instances.
    pub port: u16,
    /// Address(es) for `listen_addresses`.
    pub bind_address: String,
    /// `max_connections`.
    pub max_connections: u32,
}

/// Directory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Cluster data directory, exclusively owned by this instance.
    pub data_directory: PathBuf,
    /// Server log directory.
    pub log_directory: PathBuf,
    /// WAL archive directory; enables archiving when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_directory: Option<PathBuf>,
}

/// Database and owner role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Database name.
    pub name: String,
    /// Owner role name.
    pub owner: String,
    /// Owner password. Generated once at create time.
    #[serde(default)]
    pub password: String,
    /// Server encoding.
    pub encoding: String,
    /// Cluster locale.
    pub locale: String,
    /// Server timezone.
    pub timezone: String,
}

/// Access control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySpec {
    /// Write `ssl = on`.
    pub ssl: bool,
    /// Method for network rules.
    pub auth_method: String,
    /// Method for the local socket rule.
    pub local_auth_method: String,
    /// One `host` rule per entry (CIDR or hostname).
    pub allowed_hosts: Vec<String>,
}

impl Default for SecuritySpec {
    fn default() -> Self {
        Self {
            ssl: false,
            auth_method: "scram-sha-256".to_string(),
            local_auth_method: "trust".to_string(),
            allowed_hosts: vec!["127.0.0.1/32".to_string(), "::1/128".to_string()],
        }
    }
}

/// Server tuning knobs, written verbatim into the generated configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceSpec {
    /// e.g. `256MB`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_buffers: Option<String>,
    /// e.g. `1GB`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_cache_size: Option<String>,
    /// e.g. `4MB`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_mem: Option<String>,
    /// e.g. `64MB`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_work_mem: Option<String>,
    /// e.g. `16MB`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_buffers: Option<String>,
    /// Planner random page cost.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_page_cost: Option<f64>,
}

/// Backup settings. Recorded only; backups are performed by an external collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupSpec {
    /// Whether scheduled backups are wanted.
    pub enabled: bool,
    /// Cron-style schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// How long backups are kept.
    pub retention_days: u32,
    /// Target directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

/// Service unit restart policy (systemd `Restart=`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    No,
    /// Restart on non-zero exit or signal.
    #[default]
    OnFailure,
    /// Restart on signal, timeout or watchdog.
    OnAbnormal,
    /// Always restart.
    Always,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartPolicy::No => "no",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::OnAbnormal => "on-abnormal",
            RestartPolicy::Always => "always",
        };
        f.write_str(s)
    }
}

/// Service-managed supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Selects service-managed mode; the unit is enabled at boot.
    pub enabled: bool,
    /// Start the unit as soon as service mode is switched on.
    #[serde(default)]
    pub auto_start: bool,
    /// `Restart=` policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// `RestartSec=` in seconds.
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,
}

fn default_restart_sec() -> u32 {
    5
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: false,
            restart_policy: RestartPolicy::default(),
            restart_sec: default_restart_sec(),
        }
    }
}

/// How the server process is supervised.
///
/// On disk this is the optional `service` table; `enabled = true` selects
/// service-managed mode, anything else is direct supervision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<ServiceSpec>", into = "Option<ServiceSpec>")]
pub enum Supervision {
    /// This tool spawns and signals the server itself.
    #[default]
    Direct,
    /// The OS service manager owns the process.
    ServiceManaged(ServiceSpec),
}

impl Supervision {
    /// True for direct supervision.
    pub fn is_direct(&self) -> bool {
        matches!(self, Supervision::Direct)
    }

    /// Service settings when service-managed.
    pub fn service(&self) -> Option<&ServiceSpec> {
        match self {
            Supervision::Direct => None,
            Supervision::ServiceManaged(s) => Some(s),
        }
    }
}

impl From<Option<ServiceSpec>> for Supervision {
    fn from(value: Option<ServiceSpec>) -> Self {
        match value {
            Some(s) if s.enabled => Supervision::ServiceManaged(s),
            _ => Supervision::Direct,
        }
    }
}

impl From<Supervision> for Option<ServiceSpec> {
    fn from(value: Supervision) -> Self {
        match value {
            Supervision::Direct => None,
            Supervision::ServiceManaged(s) => Some(s),
        }
    }
}

/// Instance state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Not running.
    #[default]
    Stopped,
    /// Start in progress.
    Starting,
    /// Running and confirmed alive.
    Running,
    /// Stop in progress.
    Stopping,
    /// Last OS-level action failed unrecoverably.
    Error,
}

impl InstanceState {
    /// Allowed transitions of the lifecycle state machine.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
                | (_, Error)
        )
    }

    /// Lowercase name, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Error => "error",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciled service-manager state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Unit enabled at boot.
    pub enabled: bool,
    /// Unit currently active.
    pub active: bool,
    /// Raw sub-state reported by the service manager (e.g. `running`, `dead`).
    pub status: String,
}

/// Observed instance status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Lifecycle state.
    pub state: InstanceState,
    /// Server pid, direct mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the server was last started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the server was last restarted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Utc>>,
    /// Service-manager mirror, service mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceStatus>,
    /// Failure that moved the instance to `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstanceStatus {
    /// True when the record claims the server is up.
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

/// Global document with defaults for new instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    /// Version used when a create request names none.
    pub default_version: String,
    /// First port considered for automatic allocation.
    pub base_port: u16,
    /// Default `bindAddress`.
    pub bind_address: String,
    /// Root for generated data/log directories; `<home>/instances` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances_root: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            default_version: "16".to_string(),
            base_port: 5433,
            bind_address: "localhost".to_string(),
            instances_root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("app-db-2").is_ok());
        assert!(validate_name("9lives").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-lead").is_err());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name("under_score").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_state_transitions() {
        use InstanceState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Error));
        assert!(Error.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Stopping));
    }

    #[test]
    fn test_supervision_from_service_table() {
        let disabled = ServiceSpec {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(Supervision::from(Some(disabled)), Supervision::Direct);
        assert_eq!(Supervision::from(None), Supervision::Direct);

        let enabled = ServiceSpec::default();
        assert!(matches!(
            Supervision::from(Some(enabled)),
            Supervision::ServiceManaged(_)
        ));
    }

    #[test]
    fn test_unit_name() {
        assert_eq!(unit_name_for("demo"), "pgherd-demo.service");
    }

    #[test]
    fn test_restart_policy_display_matches_serde() {
        for policy in [
            RestartPolicy::No,
            RestartPolicy::OnFailure,
            RestartPolicy::OnAbnormal,
            RestartPolicy::Always,
        ] {
            let json = serde_json::to_string(&policy).unwrap();
            assert_eq!(json, format!("\"{}\"", policy));
        }
    }
}
