// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle orchestrator.
//!
//! The public face of the crate. Each operation is one sequential flow:
//!
//! ```text
//! create:  lock → conflict checks → locate binaries → bootstrap → save → [install unit]
//! start:   lock → reconcile → supervisor.start → save
//! stop:    lock → reconcile → supervisor.stop  → save
//! status:  reconcile → save if changed (only when the lock is free)
//! remove:  lock → reconcile → [backup] → [stop] → [uninstall unit] → delete record
//! ```
//!
//! Mutating operations hold the per-name [`InstanceLock`] for their whole duration.
//! Errors leave the orchestrator wrapped in [`Error::Operation`] so every message names
//! the instance and operation.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::{BackupProvider, NoopBackup};
use crate::bootstrap::{
    BootstrapConfig, BootstrapSequencer, ClusterProvisioner, PostgresProvisioner,
};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::locator::{BinaryLocator, POSTGRES, SearchPaths};
use crate::lock::InstanceLock;
use crate::logfile;
use crate::model::{
    BackupSpec, DatabaseSpec, GlobalSettings, InstanceRecord, InstanceSpec, InstanceState,
    InstanceStatus, NetworkSpec, PerformanceSpec, SecuritySpec, ServiceSpec, StorageSpec,
    Supervision, validate_name,
};
use crate::store::{RecordStore, TomlRecordStore};
use crate::supervisor::{
    ServiceManager, Supervisor, SupervisorConfig, SystemdConfig, SystemdManager, is_alive,
};

/// Default `maxConnections` for new instances.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;

/// Request to create an instance. Unset fields fall back to the global defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Server version; defaults to `defaultVersion`.
    pub version: Option<String>,
    /// TCP port; allocated from `basePort` when unset.
    pub port: Option<u16>,
    /// `listen_addresses`; defaults to `bindAddress`.
    pub bind_address: Option<String>,
    /// `max_connections`.
    pub max_connections: Option<u32>,
    /// Data directory; `<instancesRoot>/<name>/data` when unset.
    pub data_directory: Option<PathBuf>,
    /// Log directory; `<instancesRoot>/<name>/logs` when unset.
    pub log_directory: Option<PathBuf>,
    /// WAL archive directory.
    pub archive_directory: Option<PathBuf>,
    /// Database name; the instance name with `-` replaced by `_` when unset.
    pub database: Option<String>,
    /// Owner role; the database name when unset.
    pub owner: Option<String>,
    /// Encoding, `UTF8` by default.
    pub encoding: Option<String>,
    /// Locale, `C` by default.
    pub locale: Option<String>,
    /// Timezone, `UTC` by default.
    pub timezone: Option<String>,
    /// Access control.
    pub security: Option<SecuritySpec>,
    /// Tuning knobs.
    pub performance: Option<PerformanceSpec>,
    /// Backup settings.
    pub backup: Option<BackupSpec>,
    /// Service-managed supervision when set with `enabled = true`.
    pub service: Option<ServiceSpec>,
}

/// Request to remove an instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Ask the backup provider for a backup first.
    pub backup: bool,
    /// Stop a running instance instead of refusing.
    pub force: bool,
}

/// How to reach an instance's database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Host to connect to.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Owner role.
    pub user: String,
    /// Owner password.
    pub password: String,
    /// Unix socket directory.
    pub socket_directory: PathBuf,
    /// `postgresql://` URL with the password percent-encoded.
    pub url: String,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    home: PathBuf,
    store: Option<Arc<dyn RecordStore>>,
    search_paths: SearchPaths,
    provisioner: Option<Arc<dyn ClusterProvisioner>>,
    services: Option<Arc<dyn ServiceManager>>,
    backup: Option<Arc<dyn BackupProvider>>,
    bootstrap: BootstrapConfig,
    supervisor: SupervisorConfig,
    systemd: SystemdConfig,
}

impl OrchestratorBuilder {
    fn new(home: PathBuf) -> Self {
        Self {
            home,
            store: None,
            search_paths: SearchPaths::default(),
            provisioner: None,
            services: None,
            backup: None,
            bootstrap: BootstrapConfig::default(),
            supervisor: SupervisorConfig::default(),
            systemd: SystemdConfig::default(),
        }
    }

    /// Record store. Default: [`TomlRecordStore`] at the home directory.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Binary locator probe list.
    pub fn search_paths(mut self, search_paths: SearchPaths) -> Self {
        self.search_paths = search_paths;
        self
    }

    /// Cluster provisioner. Default: [`PostgresProvisioner`].
    pub fn provisioner(mut self, provisioner: Arc<dyn ClusterProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Service manager. Default: [`SystemdManager`].
    pub fn service_manager(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = Some(services);
        self
    }

    /// Backup provider. Default: [`NoopBackup`].
    pub fn backup_provider(mut self, backup: Arc<dyn BackupProvider>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Bootstrap timings.
    pub fn bootstrap_config(mut self, config: BootstrapConfig) -> Self {
        self.bootstrap = config;
        self
    }

    /// Supervisor timings.
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = config;
        self
    }

    /// systemd settings.
    pub fn systemd_config(mut self, config: SystemdConfig) -> Self {
        self.systemd = config;
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Orchestrator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(TomlRecordStore::new(self.home.clone())));
        let provisioner = self
            .provisioner
            .unwrap_or_else(|| Arc::new(PostgresProvisioner::new(self.bootstrap.clone())));
        let services = self
            .services
            .unwrap_or_else(|| Arc::new(SystemdManager::new(self.systemd.clone())));
        let backup = self.backup.unwrap_or_else(|| Arc::new(NoopBackup));

        Orchestrator {
            lock_dir: self.home.join("locks"),
            home: self.home,
            store,
            locator: BinaryLocator::new(self.search_paths),
            sequencer: BootstrapSequencer::new(provisioner),
            supervisor: Supervisor::new(self.supervisor, self.systemd, services),
            backup,
        }
    }
}

/// Coordinates the record store, locator, bootstrap sequencer and supervisor.
pub struct Orchestrator {
    home: PathBuf,
    lock_dir: PathBuf,
    store: Arc<dyn RecordStore>,
    locator: BinaryLocator,
    sequencer: BootstrapSequencer,
    supervisor: Supervisor,
    backup: Arc<dyn BackupProvider>,
}

impl Orchestrator {
    /// Start building an orchestrator rooted at `home`.
    pub fn builder(home: impl Into<PathBuf>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(home.into())
    }

    /// Orchestrator with production backends configured from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::builder(config.home.clone())
            .search_paths(config.search_paths.clone())
            .bootstrap_config(config.bootstrap.clone())
            .supervisor_config(config.supervisor.clone())
            .systemd_config(config.systemd.clone())
            .build()
    }

    /// Home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Record store in use.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    fn lock(&self, name: &str) -> Result<InstanceLock> {
        InstanceLock::acquire(&self.lock_dir, name)
    }

    async fn load(&self, name: &str) -> Result<InstanceRecord> {
        self.store
            .get(name)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for name in self.store.list().await? {
            if let Some(record) = self.store.get(&name).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Create, bootstrap and persist a new instance. Returns the full spec, including
    /// the generated owner password.
    pub async fn create(&self, name: &str, options: CreateOptions) -> Result<InstanceSpec> {
        self.create_inner(name, options)
            .await
            .map_err(|e| e.in_operation(name, "create"))
    }

    async fn create_inner(&self, name: &str, options: CreateOptions) -> Result<InstanceSpec> {
        validate_name(name)?;
        let _lock = self.lock(name)?;

        if self.store.get(name).await?.is_some() {
            return Err(Error::Conflict(format!("instance '{}' already exists", name)));
        }

        let global = self.store.load_global().await?;
        let others = self.load_all().await?;
        let mut spec = self.resolve_spec(name, options, &global, &others)?;
        validate_spec(&spec)?;

        if let Some(other) = others.iter().find(|r| r.spec.network.port == spec.network.port) {
            return Err(Error::Conflict(format!(
                "port {} is already used by instance '{}'",
                spec.network.port,
                other.name()
            )));
        }
        check_directory_ownership(&spec, &others)?;

        let binaries = self.locator.server_binaries(&spec.version)?;
        info!(
            instance = %name,
            version = %spec.version,
            port = spec.network.port,
            data_dir = %spec.storage.data_directory.display(),
            "Creating instance"
        );

        self.sequencer.run(&mut spec, &binaries).await?;

        let mut record = InstanceRecord::new(spec);
        self.store.save(&record).await?;

        if let Supervision::ServiceManaged(service) = record.spec.supervision.clone() {
            self.supervisor
                .install_service(&record.spec, &service, &binaries.postgres)
                .await?;
            if service.auto_start {
                let started = self.supervisor.start(&mut record, &binaries.postgres).await;
                self.store.save(&record).await?;
                started?;
            }
        }

        info!(instance = %name, port = record.spec.network.port, "Instance created");
        Ok(record.spec)
    }

    fn resolve_spec(
        &self,
        name: &str,
        options: CreateOptions,
        global: &GlobalSettings,
        others: &[InstanceRecord],
    ) -> Result<InstanceSpec> {
        let root = global
            .instances_root
            .clone()
            .unwrap_or_else(|| self.home.join("instances"));
        let instance_dir = root.join(name);

        let port = match options.port {
            Some(port) => port,
            None => allocate_port(global.base_port, others)?,
        };
        let database = options.database.unwrap_or_else(|| name.replace('-', "_"));
        let owner = options.owner.unwrap_or_else(|| database.clone());

        let supervision = Supervision::from(options.service);

        Ok(InstanceSpec {
            name: name.to_string(),
            version: options
                .version
                .unwrap_or_else(|| global.default_version.clone()),
            network: NetworkSpec {
                port,
                bind_address: options
                    .bind_address
                    .unwrap_or_else(|| global.bind_address.clone()),
                max_connections: options.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
            storage: StorageSpec {
                data_directory: normalize_path(
                    &options
                        .data_directory
                        .unwrap_or_else(|| instance_dir.join("data")),
                )?,
                log_directory: normalize_path(
                    &options
                        .log_directory
                        .unwrap_or_else(|| instance_dir.join("logs")),
                )?,
                archive_directory: options
                    .archive_directory
                    .as_deref()
                    .map(normalize_path)
                    .transpose()?,
            },
            database: DatabaseSpec {
                name: database,
                owner,
                password: String::new(),
                encoding: options.encoding.unwrap_or_else(|| "UTF8".to_string()),
                locale: options.locale.unwrap_or_else(|| "C".to_string()),
                timezone: options.timezone.unwrap_or_else(|| "UTC".to_string()),
            },
            security: options.security.unwrap_or_default(),
            performance: options.performance,
            backup: options.backup,
            supervision,
        })
    }

    /// Start a stopped instance and wait until it is confirmed alive.
    pub async fn start(&self, name: &str) -> Result<InstanceStatus> {
        self.start_inner(name)
            .await
            .map_err(|e| e.in_operation(name, "start"))
    }

    async fn start_inner(&self, name: &str) -> Result<InstanceStatus> {
        let _lock = self.lock(name)?;
        let mut record = self.load(name).await?;
        self.supervisor.reconcile(&mut record).await?;

        if record.status.is_running() {
            return Err(Error::Conflict(format!("instance '{}' is already running", name)));
        }

        let binary = self.locator.locate(POSTGRES, &record.spec.version)?;
        let started = self.supervisor.start(&mut record, &binary).await;
        self.store.save(&record).await?;
        started?;
        Ok(record.status)
    }

    /// Stop a running instance and wait until it is gone.
    pub async fn stop(&self, name: &str) -> Result<InstanceStatus> {
        self.stop_inner(name)
            .await
            .map_err(|e| e.in_operation(name, "stop"))
    }

    async fn stop_inner(&self, name: &str) -> Result<InstanceStatus> {
        let _lock = self.lock(name)?;
        let mut record = self.load(name).await?;
        self.supervisor.reconcile(&mut record).await?;

        if !is_stoppable(&record) {
            return Err(Error::Conflict(format!(
                "instance '{}' is not running (state: {})",
                name, record.status.state
            )));
        }

        let stopped = self.supervisor.stop(&mut record).await;
        self.store.save(&record).await?;
        stopped?;
        Ok(record.status)
    }

    /// Stop (when running), pause for the cooldown, then start.
    pub async fn restart(&self, name: &str) -> Result<InstanceStatus> {
        self.restart_inner(name)
            .await
            .map_err(|e| e.in_operation(name, "restart"))
    }

    async fn restart_inner(&self, name: &str) -> Result<InstanceStatus> {
        let _lock = self.lock(name)?;
        let mut record = self.load(name).await?;
        self.supervisor.reconcile(&mut record).await?;

        if is_stoppable(&record) {
            let stopped = self.supervisor.stop(&mut record).await;
            self.store.save(&record).await?;
            stopped?;
            tokio::time::sleep(self.supervisor.config().restart_cooldown).await;
        }

        let binary = self.locator.locate(POSTGRES, &record.spec.version)?;
        let started = self.supervisor.start(&mut record, &binary).await;
        if started.is_ok() {
            record.status.last_restart = Some(Utc::now());
        }
        self.store.save(&record).await?;
        started?;
        info!(instance = %name, "Instance restarted");
        Ok(record.status)
    }

    /// Reconciled record for `name`. A stale status is corrected and persisted.
    pub async fn status(&self, name: &str) -> Result<InstanceRecord> {
        self.status_inner(name)
            .await
            .map_err(|e| e.in_operation(name, "status"))
    }

    async fn status_inner(&self, name: &str) -> Result<InstanceRecord> {
        let mut record = self.load(name).await?;
        if self.supervisor.reconcile(&mut record).await? {
            self.persist_correction(&record).await?;
        }
        Ok(record)
    }

    async fn persist_correction(&self, record: &InstanceRecord) -> Result<()> {
        match self.lock(record.name()) {
            Ok(_lock) => self.store.save(record).await,
            Err(e) if e.kind() == ErrorKind::Conflict => {
                debug!(
                    instance = %record.name(),
                    "Instance busy, not persisting status correction"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// All records, reconciled, sorted by name.
    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for name in self.store.list().await? {
            let Some(mut record) = self.store.get(&name).await? else {
                continue;
            };
            match self.supervisor.reconcile(&mut record).await {
                Ok(true) => self.persist_correction(&record).await?,
                Ok(false) => {}
                Err(e) => {
                    warn!(instance = %name, error = %e, "Could not reconcile instance status");
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Delete the record of an instance. Data and log directories stay on disk.
    pub async fn remove(&self, name: &str, options: RemoveOptions) -> Result<()> {
        self.remove_inner(name, options)
            .await
            .map_err(|e| e.in_operation(name, "remove"))
    }

    async fn remove_inner(&self, name: &str, options: RemoveOptions) -> Result<()> {
        let _lock = self.lock(name)?;
        let mut record = self.load(name).await?;
        self.supervisor.reconcile(&mut record).await?;

        let running = is_stoppable(&record);
        if running && !options.force {
            return Err(Error::Conflict(format!(
                "instance '{}' is running; stop it first or use force",
                name
            )));
        }

        if options.backup {
            info!(
                instance = %name,
                provider = self.backup.provider_type(),
                "Backing up before removal"
            );
            self.backup.backup(&record).await?;
        }

        if running && let Err(e) = self.supervisor.stop(&mut record).await {
            warn!(instance = %name, error = %e, "Stop failed during forced removal, continuing");
        }

        if !record.spec.supervision.is_direct()
            && let Err(e) = self.supervisor.remove_service(&record.spec).await
        {
            warn!(instance = %name, error = %e, "Service unit removal failed, continuing");
        }

        self.store.delete(name).await?;
        info!(
            instance = %name,
            data_dir = %record.spec.storage.data_directory.display(),
            "Instance removed; data directory kept"
        );
        Ok(())
    }

    /// Switch an instance to service-managed supervision.
    pub async fn enable_service(&self, name: &str, service: ServiceSpec) -> Result<InstanceRecord> {
        self.enable_service_inner(name, service)
            .await
            .map_err(|e| e.in_operation(name, "enable-service"))
    }

    async fn enable_service_inner(
        &self,
        name: &str,
        mut service: ServiceSpec,
    ) -> Result<InstanceRecord> {
        let _lock = self.lock(name)?;
        let mut record = self.load(name).await?;
        self.supervisor.reconcile(&mut record).await?;

        if record.spec.supervision.is_direct() && is_stoppable(&record) {
            return Err(Error::Conflict(format!(
                "instance '{}' is running under direct supervision; stop it first",
                name
            )));
        }

        let binary = self.locator.locate(POSTGRES, &record.spec.version)?;
        service.enabled = true;
        record.spec.supervision = Supervision::ServiceManaged(service.clone());
        record.status.pid = None;
        self.store.save(&record).await?;

        self.supervisor
            .install_service(&record.spec, &service, &binary)
            .await?;
        self.supervisor.reconcile(&mut record).await?;

        if service.auto_start && !record.status.is_running() {
            let started = self.supervisor.start(&mut record, &binary).await;
            self.store.save(&record).await?;
            started?;
        } else {
            self.store.save(&record).await?;
        }
        Ok(record)
    }

    /// Return an instance to direct supervision, stopping and removing its unit.
    pub async fn disable_service(&self, name: &str) -> Result<InstanceRecord> {
        self.disable_service_inner(name)
            .await
            .map_err(|e| e.in_operation(name, "disable-service"))
    }

    async fn disable_service_inner(&self, name: &str) -> Result<InstanceRecord> {
        let _lock = self.lock(name)?;
        let mut record = self.load(name).await?;
        if record.spec.supervision.is_direct() {
            return Err(Error::Conflict(format!(
                "instance '{}' is not service-managed",
                name
            )));
        }
        self.supervisor.reconcile(&mut record).await?;

        if is_stoppable(&record) {
            let stopped = self.supervisor.stop(&mut record).await;
            self.store.save(&record).await?;
            stopped?;
        }

        self.supervisor.remove_service(&record.spec).await?;
        record.spec.supervision = Supervision::Direct;
        record.status.service = None;
        if record.status.state == InstanceState::Error {
            record.status.state = InstanceState::Stopped;
            record.status.last_error = None;
        }
        self.store.save(&record).await?;
        info!(instance = %name, "Instance returned to direct supervision");
        Ok(record)
    }

    /// Connection parameters for the instance's database.
    pub async fn connection_info(&self, name: &str) -> Result<ConnectionInfo> {
        let record = self
            .load(name)
            .await
            .map_err(|e| e.in_operation(name, "info"))?;
        Ok(connection_info(&record.spec))
    }

    /// Last `lines` lines of the newest log file in the instance's log directory.
    pub async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        self.logs_inner(name, lines)
            .await
            .map_err(|e| e.in_operation(name, "logs"))
    }

    async fn logs_inner(&self, name: &str, lines: usize) -> Result<String> {
        let record = self.load(name).await?;
        let dir = &record.spec.storage.log_directory;
        let newest = logfile::newest_log(dir).map_err(|e| {
            Error::NotFound(format!("log directory {}: {}", dir.display(), e))
        })?;
        let Some(path) = newest else {
            return Err(Error::NotFound(format!("no log files in {}", dir.display())));
        };
        logfile::tail(&path, lines)
            .map_err(|e| Error::NotFound(format!("{}: {}", path.display(), e)))
    }
}

fn is_stoppable(record: &InstanceRecord) -> bool {
    match record.status.state {
        InstanceState::Running => true,
        InstanceState::Error => match &record.spec.supervision {
            Supervision::Direct => record.status.pid.is_some_and(is_alive),
            Supervision::ServiceManaged(_) => {
                record.status.service.as_ref().is_some_and(|s| s.active)
            }
        },
        _ => false,
    }
}

fn allocate_port(base: u16, others: &[InstanceRecord]) -> Result<u16> {
    (base..=u16::MAX)
        .find(|port| others.iter().all(|r| r.spec.network.port != *port))
        .ok_or_else(|| Error::Conflict(format!("no free port at or above {}", base)))
}

/// Absolute form of `path` with `.` and `..` folded and symlinks resolved as far as
/// the path exists. Components that do not exist yet are appended verbatim.
fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .map_err(|e| Error::InvalidSpec(format!("cannot resolve {}: {}", path.display(), e)))?;

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    for ancestor in lexical.ancestors() {
        if let Ok(resolved) = std::fs::canonicalize(ancestor) {
            let rest = lexical.strip_prefix(ancestor).unwrap_or(Path::new(""));
            if rest.as_os_str().is_empty() {
                return Ok(resolved);
            }
            return Ok(resolved.join(rest));
        }
    }
    Ok(lexical)
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Data directories must not nest in or alias another instance's data or log
/// directory; log directories must not be shared or sit inside another data directory.
fn check_directory_ownership(spec: &InstanceSpec, others: &[InstanceRecord]) -> Result<()> {
    let data = normalize_path(&spec.storage.data_directory)?;
    let logs = normalize_path(&spec.storage.log_directory)?;

    for other in others {
        let other_data = normalize_path(&other.spec.storage.data_directory)?;
        let other_logs = normalize_path(&other.spec.storage.log_directory)?;

        let clash = if overlaps(&data, &other_data) {
            Some(("data directory", &data, "data directory"))
        } else if overlaps(&data, &other_logs) {
            Some(("data directory", &data, "log directory"))
        } else if overlaps(&logs, &other_data) {
            Some(("log directory", &logs, "data directory"))
        } else if logs == other_logs {
            Some(("log directory", &logs, "log directory"))
        } else {
            None
        };

        if let Some((what, path, theirs)) = clash {
            return Err(Error::Conflict(format!(
                "{} {} overlaps the {} of instance '{}'",
                what,
                path.display(),
                theirs,
                other.name()
            )));
        }
    }
    Ok(())
}

fn validate_spec(spec: &InstanceSpec) -> Result<()> {
    if spec.version.trim().is_empty() {
        return Err(Error::InvalidSpec("version must not be empty".into()));
    }
    if spec.network.port == 0 {
        return Err(Error::InvalidSpec("port must be between 1 and 65535".into()));
    }
    if spec.network.max_connections == 0 {
        return Err(Error::InvalidSpec("maxConnections must be positive".into()));
    }
    if spec.database.name.is_empty() || spec.database.owner.is_empty() {
        return Err(Error::InvalidSpec("database name and owner must not be empty".into()));
    }
    for (field, method) in [
        ("authMethod", &spec.security.auth_method),
        ("localAuthMethod", &spec.security.local_auth_method),
    ] {
        if method.is_empty() || method.chars().any(char::is_whitespace) {
            return Err(Error::InvalidSpec(format!(
                "{} must be a single word, got '{}'",
                field, method
            )));
        }
    }
    if let Some(host) = spec
        .security
        .allowed_hosts
        .iter()
        .find(|h| h.is_empty() || h.chars().any(char::is_whitespace))
    {
        return Err(Error::InvalidSpec(format!("invalid allowed host '{}'", host)));
    }
    Ok(())
}

/// Connection parameters derived from a spec.
pub fn connection_info(spec: &InstanceSpec) -> ConnectionInfo {
    let first = spec
        .network
        .bind_address
        .split(',')
        .map(str::trim)
        .next()
        .unwrap_or("");
    let host = match first {
        "" | "*" | "0.0.0.0" | "::" => "localhost".to_string(),
        other => other.to_string(),
    };
    let url_host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.clone()
    };
    let url = format!(
        "postgresql://{}:{}@{}:{}/{}",
        urlencoding::encode(&spec.database.owner),
        urlencoding::encode(&spec.database.password),
        url_host,
        spec.network.port,
        urlencoding::encode(&spec.database.name)
    );

    ConnectionInfo {
        host,
        port: spec.network.port,
        database: spec.database.name.clone(),
        user: spec.database.owner.clone(),
        password: spec.database.password.clone(),
        socket_directory: spec.socket_dir(),
        url,
    }
}
