// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster provisioner backends.
//!
//! [`PostgresProvisioner`] drives the real `initdb` and a temporary socket-only
//! `postgres` process. Tests use [`super::MockProvisioner`] instead.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{BootstrapConfig, BootstrapStep, password};
use crate::error::Result;
use crate::logfile;

/// Log file of the temporary bootstrap server, inside the log directory.
pub const BOOTSTRAP_LOG: &str = "bootstrap.log";

/// Lines of the bootstrap log attached to readiness failures.
const LOG_TAIL_LINES: usize = 20;

/// Arguments for cluster initialization.
#[derive(Debug, Clone)]
pub struct InitRequest<'a> {
    /// `initdb` executable.
    pub initdb: &'a Path,
    /// Target data directory (exists and is empty).
    pub data_dir: &'a Path,
    /// Superuser name.
    pub superuser: &'a str,
    /// Cluster encoding.
    pub encoding: &'a str,
    /// Cluster locale.
    pub locale: &'a str,
}

/// Arguments for role/database provisioning on a temporary server.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    /// `postgres` executable.
    pub postgres: &'a Path,
    /// Initialized data directory.
    pub data_dir: &'a Path,
    /// Socket directory for the temporary server.
    pub socket_dir: &'a Path,
    /// Where the temporary server writes its output.
    pub log_dir: &'a Path,
    /// Port; with no TCP listener this only names the socket file.
    pub port: u16,
    /// Superuser name.
    pub superuser: &'a str,
    /// Database to create.
    pub database: &'a str,
    /// Owner role to create or update.
    pub owner: &'a str,
    /// Password for the owner role.
    pub owner_password: &'a str,
    /// Database encoding.
    pub encoding: &'a str,
    /// Database collation and ctype.
    pub locale: &'a str,
}

/// Backend that initializes a cluster and provisions its database.
///
/// Futures are not `Send`: the sqlx connection borrows held across awaits are not
/// general enough for a `Send` bound, and no caller moves them across threads.
#[async_trait(?Send)]
pub trait ClusterProvisioner: Send + Sync {
    /// Backend name for logging.
    fn provisioner_type(&self) -> &'static str;

    /// Initialize the cluster files.
    async fn init_cluster(&self, req: &InitRequest<'_>) -> Result<()>;

    /// Start a temporary server, create the role and database, then stop it.
    ///
    /// The temporary server is stopped whether or not provisioning succeeds.
    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<()>;
}

/// Provisioner backed by the real PostgreSQL executables.
pub struct PostgresProvisioner {
    config: BootstrapConfig,
}

impl PostgresProvisioner {
    /// Create a provisioner with the given timings.
    pub fn new(config: BootstrapConfig) -> Self {
        Self { config }
    }

    fn connect_options(req: &ProvisionRequest<'_>, database: &str) -> PgConnectOptions {
        PgConnectOptions::new_without_pgpass()
            .socket(req.socket_dir)
            .port(req.port)
            .username(req.superuser)
            .database(database)
            .disable_statement_logging()
    }

    fn spawn_server(&self, req: &ProvisionRequest<'_>) -> Result<Child> {
        let step = BootstrapStep::TempServerStart;
        let log_path = req.log_dir.join(BOOTSTRAP_LOG);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| step.fail(format!("open {}: {}", log_path.display(), e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| step.fail(format!("open {}: {}", log_path.display(), e)))?;

        let child = Command::new(req.postgres)
            .arg("-D")
            .arg(req.data_dir)
            .arg("-p")
            .arg(req.port.to_string())
            .arg("-c")
            .arg("listen_addresses=")
            .arg("-c")
            .arg(format!("unix_socket_directories={}", req.socket_dir.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| step.fail(format!("spawn {}: {}", req.postgres.display(), e)))?;

        debug!(
            pid = ?child.id(),
            socket_dir = %req.socket_dir.display(),
            "Spawned bootstrap server"
        );
        Ok(child)
    }

    async fn wait_ready(
        &self,
        child: &mut Child,
        req: &ProvisionRequest<'_>,
    ) -> Result<PgConnection> {
        let log_path = req.log_dir.join(BOOTSTRAP_LOG);
        let options = Self::connect_options(req, "postgres");
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.config.ready_max_attempts {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(BootstrapStep::TempServerStart.fail_with_stderr(
                    format!("bootstrap server exited early with {}", status),
                    logfile::tail_or_empty(&log_path, LOG_TAIL_LINES),
                ));
            }

            match try_connect(&options).await {
                Ok(conn) => {
                    debug!(attempt, "Bootstrap server accepting connections");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Bootstrap server not ready yet");
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }

        Err(BootstrapStep::ReadinessWait.fail_with_stderr(
            format!(
                "server did not accept connections after {} attempts (last error: {}); \
                 check {} and the permissions of {}",
                self.config.ready_max_attempts,
                last_error,
                log_path.display(),
                req.socket_dir.display()
            ),
            logfile::tail_or_empty(&log_path, LOG_TAIL_LINES),
        ))
    }

    async fn stop_server(&self, child: &mut Child) -> Result<()> {
        let step = BootstrapStep::Teardown;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        if let Some(pid) = child.id() {
            let pid = signal_target(pid)?;
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                debug!(error = %e, "SIGTERM to bootstrap server failed");
            }
        }

        let deadline = Instant::now() + self.config.teardown_timeout;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "Bootstrap server stopped");
                    return Ok(());
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(e) => return Err(step.fail(format!("wait for bootstrap server: {}", e))),
            }
        }

        warn!(
            timeout_secs = self.config.teardown_timeout.as_secs(),
            "Bootstrap server ignored SIGTERM, killing"
        );
        child
            .kill()
            .await
            .map_err(|e| step.fail(format!("kill bootstrap server: {}", e)))
    }
}

#[async_trait(?Send)]
impl ClusterProvisioner for PostgresProvisioner {
    fn provisioner_type(&self) -> &'static str {
        "postgres"
    }

    async fn init_cluster(&self, req: &InitRequest<'_>) -> Result<()> {
        let step = BootstrapStep::ClusterInit;
        info!(initdb = %req.initdb.display(), data_dir = %req.data_dir.display(), "Running initdb");

        let output = Command::new(req.initdb)
            .arg("-D")
            .arg(req.data_dir)
            .arg("-U")
            .arg(req.superuser)
            .arg(format!("--encoding={}", req.encoding))
            .arg(format!("--locale={}", req.locale))
            .arg("--auth-local=trust")
            .arg("--auth-host=scram-sha-256")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| step.fail(format!("spawn {}: {}", req.initdb.display(), e)))?;

        if !output.status.success() {
            return Err(step.fail_with_stderr(
                format!("initdb exited with {}", output.status),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }

    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<()> {
        let mut child = self.spawn_server(req)?;

        let outcome = match self.wait_ready(&mut child, req).await {
            Ok(mut conn) => {
                let result = provision_objects(&mut conn, req).await;
                if let Err(e) = conn.close().await {
                    debug!(error = %e, "Closing provisioning connection failed");
                }
                match result {
                    Ok(()) => grant_schema(req).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let teardown = self.stop_server(&mut child).await;
        match (outcome, teardown) {
            (Err(e), Err(t)) => {
                warn!(error = %t, "Bootstrap server teardown also failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), teardown) => teardown,
        }
    }
}

fn signal_target(pid: u32) -> Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(BootstrapStep::Teardown
            .fail(format!("bootstrap server pid {} out of range", pid))),
    }
}

async fn try_connect(
    options: &PgConnectOptions,
) -> std::result::Result<PgConnection, sqlx::Error> {
    let mut conn = PgConnection::connect_with(options).await?;
    sqlx::query("SELECT 1").execute(&mut conn).await?;
    Ok(conn)
}

fn sql_error(what: &str, e: sqlx::Error) -> crate::error::Error {
    BootstrapStep::Provisioning.fail(format!("{}: {}", what, e))
}

/// Render a statement server-side with `format()` so identifiers and literals are quoted
/// by PostgreSQL itself.
async fn render(conn: &mut PgConnection, template: &str, args: &[&str]) -> Result<String> {
    let placeholders: Vec<String> = (1..=args.len()).map(|i| format!("${}::text", i)).collect();
    let sql = format!("SELECT format('{}', {})", template, placeholders.join(", "));
    let mut query = sqlx::query_scalar::<_, String>(&sql);
    for arg in args {
        query = query.bind(*arg);
    }
    query
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| sql_error("render statement", e))
}

async fn execute(conn: &mut PgConnection, what: &str, template: &str, args: &[&str]) -> Result<()> {
    let stmt = render(conn, template, args).await?;
    sqlx::raw_sql(&stmt)
        .execute(&mut *conn)
        .await
        .map_err(|e| sql_error(what, e))?;
    Ok(())
}

async fn exists(conn: &mut PgConnection, sql: &str, name: &str) -> Result<bool> {
    sqlx::query_scalar::<_, bool>(sql)
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| sql_error("query catalog", e))
}

async fn provision_objects(conn: &mut PgConnection, req: &ProvisionRequest<'_>) -> Result<()> {
    // Superuser gets a throwaway password; local access stays on the socket rule.
    if req.owner != req.superuser {
        let superuser_password = password::generate_password();
        execute(
            conn,
            "set superuser password",
            "ALTER ROLE %I WITH PASSWORD %L",
            &[req.superuser, &superuser_password],
        )
        .await?;
    }

    let role_exists = exists(
        conn,
        "SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)",
        req.owner,
    )
    .await?;
    if role_exists {
        execute(
            conn,
            "update owner role",
            "ALTER ROLE %I WITH LOGIN PASSWORD %L",
            &[req.owner, req.owner_password],
        )
        .await?;
    } else {
        execute(
            conn,
            "create owner role",
            "CREATE ROLE %I WITH LOGIN PASSWORD %L",
            &[req.owner, req.owner_password],
        )
        .await?;
    }

    let db_exists = exists(
        conn,
        "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
        req.database,
    )
    .await?;
    if db_exists {
        execute(
            conn,
            "change database owner",
            "ALTER DATABASE %I OWNER TO %I",
            &[req.database, req.owner],
        )
        .await?;
    } else {
        execute(
            conn,
            "create database",
            "CREATE DATABASE %I OWNER %I ENCODING %L LC_COLLATE %L LC_CTYPE %L TEMPLATE template0",
            &[req.database, req.owner, req.encoding, req.locale, req.locale],
        )
        .await?;
    }

    execute(
        conn,
        "grant database privileges",
        "GRANT ALL PRIVILEGES ON DATABASE %I TO %I",
        &[req.database, req.owner],
    )
    .await
}

async fn grant_schema(req: &ProvisionRequest<'_>) -> Result<()> {
    let options = PostgresProvisioner::connect_options(req, req.database);
    let mut conn = PgConnection::connect_with(&options)
        .await
        .map_err(|e| sql_error("connect to new database", e))?;
    let result = execute(
        &mut conn,
        "grant schema privileges",
        "GRANT CREATE, USAGE ON SCHEMA public TO %I",
        &[req.owner],
    )
    .await;
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Closing provisioning connection failed");
    }
    result
}
