// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service-manager integration.
//!
//! [`ServiceManager`] is the seam between the supervisor and the OS service manager.
//! [`SystemdManager`] writes unit files and drives `systemctl`; tests use
//! [`super::MockServiceManager`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::bootstrap::GENERATED_MARKER;
use crate::error::{Error, Result};
use crate::model::{InstanceSpec, ServiceSpec};

/// systemd integration settings.
#[derive(Debug, Clone)]
pub struct SystemdConfig {
    /// Directory unit files are written to.
    pub unit_dir: PathBuf,
    /// Use the per-user manager (`systemctl --user`).
    pub user_mode: bool,
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            user_mode: false,
        }
    }
}

/// State reported by the service manager for one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    /// Enabled at boot.
    pub enabled: bool,
    /// Currently active.
    pub active: bool,
    /// Raw sub-state (`running`, `dead`, `failed`, ...).
    pub sub_state: String,
}

/// OS service manager operations used by the supervisor.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Backend name for logging.
    fn manager_type(&self) -> &'static str;

    /// Write (or overwrite) a unit and make the manager aware of it.
    async fn install(&self, unit: &str, contents: &str) -> Result<()>;

    /// Remove a unit. Removing a missing unit is not an error.
    async fn uninstall(&self, unit: &str) -> Result<()>;

    /// Enable at boot.
    async fn enable(&self, unit: &str) -> Result<()>;

    /// Disable at boot.
    async fn disable(&self, unit: &str) -> Result<()>;

    /// Start now.
    async fn start(&self, unit: &str) -> Result<()>;

    /// Stop now.
    async fn stop(&self, unit: &str) -> Result<()>;

    /// Query the current state.
    async fn query(&self, unit: &str) -> Result<ServiceState>;
}

/// Everything needed to render a unit file for one instance.
#[derive(Debug, Clone)]
pub struct UnitDescriptor {
    /// Instance name, for the description.
    pub instance: String,
    /// Server version, for the description.
    pub version: String,
    /// `postgres` executable.
    pub binary: PathBuf,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Paths the sandboxed server may write to.
    pub writable_paths: Vec<PathBuf>,
    /// Restart settings.
    pub service: ServiceSpec,
    /// `TimeoutStopSec=`.
    pub stop_timeout: Duration,
    /// `User=`; omitted in user mode.
    pub user: Option<String>,
    /// Target for `WantedBy=`.
    pub user_mode: bool,
}

impl UnitDescriptor {
    /// Describe the unit for `spec`.
    pub fn for_instance(
        spec: &InstanceSpec,
        service: &ServiceSpec,
        binary: &Path,
        stop_timeout: Duration,
        config: &SystemdConfig,
    ) -> Self {
        let mut writable_paths = vec![
            spec.storage.data_directory.clone(),
            spec.storage.log_directory.clone(),
        ];
        if let Some(archive) = &spec.storage.archive_directory {
            writable_paths.push(archive.clone());
        }
        Self {
            instance: spec.name.clone(),
            version: spec.version.clone(),
            binary: binary.to_path_buf(),
            data_dir: spec.storage.data_directory.clone(),
            writable_paths,
            service: service.clone(),
            stop_timeout,
            user: if config.user_mode { None } else { current_user_name() },
            user_mode: config.user_mode,
        }
    }

    /// Render the unit file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(GENERATED_MARKER);
        out.push('\n');

        out.push_str("[Unit]\n");
        out.push_str(&format!(
            "Description=PostgreSQL {} instance {}\n",
            self.version, self.instance
        ));
        out.push_str("After=network.target\n\n");

        out.push_str("[Service]\n");
        out.push_str("Type=simple\n");
        if let Some(user) = &self.user {
            out.push_str(&format!("User={}\n", user));
        }
        out.push_str(&format!(
            "ExecStart={} -D {}\n",
            unit_quote(&self.binary),
            unit_quote(&self.data_dir)
        ));
        out.push_str("ExecReload=/bin/kill -HUP $MAINPID\n");
        out.push_str("KillMode=mixed\n");
        out.push_str("KillSignal=SIGTERM\n");
        out.push_str(&format!("TimeoutStopSec={}\n", self.stop_timeout.as_secs()));
        out.push_str(&format!("Restart={}\n", self.service.restart_policy));
        out.push_str(&format!("RestartSec={}\n", self.service.restart_sec));
        out.push_str("NoNewPrivileges=true\n");
        out.push_str("PrivateTmp=true\n");
        out.push_str("ProtectSystem=strict\n");
        out.push_str("ProtectHome=read-only\n");
        let writable: Vec<String> = self.writable_paths.iter().map(|p| unit_quote(p)).collect();
        out.push_str(&format!("ReadWritePaths={}\n\n", writable.join(" ")));

        out.push_str("[Install]\n");
        let target = if self.user_mode {
            "default.target"
        } else {
            "multi-user.target"
        };
        out.push_str(&format!("WantedBy={}\n", target));
        out
    }
}

/// Quote a path for a unit file command line when it contains whitespace or quotes.
fn unit_quote(path: &Path) -> String {
    let s = path.display().to_string();
    if s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s
    }
}

/// Name of the invoking user, for `User=`.
pub fn current_user_name() -> Option<String> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(e) => {
            debug!(error = %e, "Cannot resolve current user");
            None
        }
    }
}

/// Parse `systemctl show --property=...` output.
pub fn parse_show_output(output: &str) -> ServiceState {
    let mut state = ServiceState::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "UnitFileState" => state.enabled = matches!(value, "enabled" | "enabled-runtime"),
            "ActiveState" => state.active = matches!(value, "active" | "reloading"),
            "SubState" => state.sub_state = value.to_string(),
            _ => {}
        }
    }
    state
}

/// `systemctl`-backed service manager.
pub struct SystemdManager {
    config: SystemdConfig,
}

impl SystemdManager {
    /// Create a manager with the given settings.
    pub fn new(config: SystemdConfig) -> Self {
        Self { config }
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.config.unit_dir.join(unit)
    }

    fn hint(&self) -> String {
        if self.config.user_mode {
            "check that a user session manager is running (systemctl --user status)".to_string()
        } else {
            "system units need root; set PGHERD_SYSTEMD_USER=1 to use the per-user manager"
                .to_string()
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("systemctl");
        if self.config.user_mode {
            cmd.arg("--user");
        }
        cmd.args(args);
        debug!(args = ?args, user_mode = self.config.user_mode, "Running systemctl");

        let output = cmd.output().await.map_err(|e| Error::SupervisionFailure {
            message: format!("failed to run systemctl: {}", e),
            hint: "install systemd or use direct supervision".to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::SupervisionFailure {
                message: format!(
                    "systemctl {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                hint: self.hint(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn io_failure(&self, action: &str, path: &Path, e: io::Error) -> Error {
        Error::SupervisionFailure {
            message: format!("cannot {} {}: {}", action, path.display(), e),
            hint: self.hint(),
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    fn manager_type(&self) -> &'static str {
        "systemd"
    }

    async fn install(&self, unit: &str, contents: &str) -> Result<()> {
        let dir = &self.config.unit_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| self.io_failure("create", dir, e))?;
        let path = self.unit_path(unit);
        fs::write(&path, contents)
            .await
            .map_err(|e| self.io_failure("write", &path, e))?;
        self.systemctl(&["daemon-reload"]).await?;
        info!(unit, path = %path.display(), "Installed service unit");
        Ok(())
    }

    async fn uninstall(&self, unit: &str) -> Result<()> {
        let path = self.unit_path(unit);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_failure("remove", &path, e)),
        }
        self.systemctl(&["daemon-reload"]).await?;
        info!(unit, "Removed service unit");
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", unit]).await.map(|_| ())
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["disable", unit]).await.map(|_| ())
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit]).await.map(|_| ())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl(&["stop", unit]).await.map(|_| ())
    }

    async fn query(&self, unit: &str) -> Result<ServiceState> {
        let output = self
            .systemctl(&[
                "show",
                unit,
                "--property=UnitFileState,ActiveState,SubState",
            ])
            .await?;
        Ok(parse_show_output(&output))
    }
}
