// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgherd - run several PostgreSQL instances side by side
//!
//! Thin command-line front end over [`pgherd_core::Orchestrator`]:
//! - create / remove instances
//! - start, stop, restart, status, list
//! - switch between direct and systemd supervision
//! - print connection details and server logs

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use pgherd_core::model::{InstanceRecord, RestartPolicy};
use pgherd_core::{Config, CreateOptions, Orchestrator, RemoveOptions, ServiceSpec};

#[derive(Parser)]
#[command(name = "pgherd")]
#[command(about = "Create and supervise side-by-side PostgreSQL instances", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a new instance (data directory, database, owner role, config).
    Create {
        /// Instance name (lowercase letters, digits and '-').
        name: String,
        /// Server version, e.g. 16 or 16.2.
        #[arg(long)]
        version: Option<String>,
        /// TCP port; the first free port at or above basePort when omitted.
        #[arg(long)]
        port: Option<u16>,
        /// listen_addresses value.
        #[arg(long)]
        bind_address: Option<String>,
        /// max_connections value.
        #[arg(long)]
        max_connections: Option<u32>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Enables WAL archiving into this directory.
        #[arg(long)]
        archive_dir: Option<PathBuf>,
        /// Database name; derived from the instance name when omitted.
        #[arg(long)]
        database: Option<String>,
        /// Owner role; the database name when omitted.
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        encoding: Option<String>,
        #[arg(long)]
        locale: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        /// Supervise through systemd instead of directly.
        #[arg(long, default_value_t = false)]
        service: bool,
        /// With --service: start the unit right away.
        #[arg(long, default_value_t = false)]
        auto_start: bool,
        /// With --service: no, on-failure, on-abnormal or always.
        #[arg(long, value_parser = parse_restart_policy)]
        restart_policy: Option<RestartPolicy>,
    },
    /// Start an instance.
    Start { name: String },
    /// Stop an instance.
    Stop { name: String },
    /// Stop (if running) and start an instance.
    Restart { name: String },
    /// Show the reconciled status of an instance.
    Status {
        name: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List all instances.
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Forget an instance. Data and log directories are kept.
    Remove {
        name: String,
        /// Stop a running instance first.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Back up before removing.
        #[arg(long, default_value_t = false)]
        backup: bool,
    },
    /// Hand supervision over to systemd.
    EnableService {
        name: String,
        #[arg(long, default_value_t = false)]
        auto_start: bool,
        #[arg(long, value_parser = parse_restart_policy)]
        restart_policy: Option<RestartPolicy>,
        /// Seconds between automatic restarts.
        #[arg(long)]
        restart_sec: Option<u32>,
    },
    /// Remove the systemd unit and return to direct supervision.
    DisableService { name: String },
    /// Print connection details.
    Info {
        name: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the tail of the newest server log.
    Logs {
        name: String,
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },
}

fn parse_restart_policy(s: &str) -> Result<RestartPolicy, String> {
    match s {
        "no" => Ok(RestartPolicy::No),
        "on-failure" => Ok(RestartPolicy::OnFailure),
        "on-abnormal" => Ok(RestartPolicy::OnAbnormal),
        "always" => Ok(RestartPolicy::Always),
        other => Err(format!(
            "unknown restart policy '{}' (expected no, on-failure, on-abnormal or always)",
            other
        )),
    }
}

fn service_spec(
    auto_start: bool,
    restart_policy: Option<RestartPolicy>,
    restart_sec: Option<u32>,
) -> ServiceSpec {
    let defaults = ServiceSpec::default();
    ServiceSpec {
        enabled: true,
        auto_start,
        restart_policy: restart_policy.unwrap_or(defaults.restart_policy),
        restart_sec: restart_sec.unwrap_or(defaults.restart_sec),
    }
}

fn print_record(record: &InstanceRecord) {
    let spec = &record.spec;
    let status = &record.status;
    println!("Instance:   {}", spec.name);
    println!("Version:    {}", spec.version);
    println!("State:      {}", status.state);
    if let Some(pid) = status.pid {
        println!("PID:        {}", pid);
    }
    println!("Port:       {}", spec.network.port);
    println!("Data:       {}", spec.storage.data_directory.display());
    println!("Logs:       {}", spec.storage.log_directory.display());
    match spec.supervision.service() {
        Some(service) => println!("Supervisor: systemd ({})", service.restart_policy),
        None => println!("Supervisor: direct"),
    }
    if let Some(service) = &status.service {
        println!(
            "Service:    enabled={} active={} ({})",
            service.enabled, service.active, service.status
        );
    }
    if let Some(started) = status.start_time {
        println!("Started:    {}", started.to_rfc3339());
    }
    if let Some(restarted) = status.last_restart {
        println!("Restarted:  {}", restarted.to_rfc3339());
    }
    if let Some(error) = &status.last_error {
        println!("Last error: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so --json output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgherd_core=info,pgherd=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        debug!("No .env file loaded: {}", e);
    }

    let args = Args::parse();
    let config = Config::from_env().context("load configuration")?;
    debug!(
        home = %config.home.display(),
        user_mode = config.systemd.user_mode,
        "Configuration loaded"
    );
    let orchestrator = Orchestrator::from_config(&config);

    match args.command {
        Command::Create {
            name,
            version,
            port,
            bind_address,
            max_connections,
            data_dir,
            log_dir,
            archive_dir,
            database,
            owner,
            encoding,
            locale,
            timezone,
            service,
            auto_start,
            restart_policy,
        } => {
            if !service && (auto_start || restart_policy.is_some()) {
                warn!("--auto-start and --restart-policy only apply with --service");
            }
            let options = CreateOptions {
                version,
                port,
                bind_address,
                max_connections,
                data_directory: data_dir,
                log_directory: log_dir,
                archive_directory: archive_dir,
                database,
                owner,
                encoding,
                locale,
                timezone,
                service: service.then(|| service_spec(auto_start, restart_policy, None)),
                ..Default::default()
            };
            let spec = orchestrator.create(&name, options).await?;
            let info = pgherd_core::orchestrator::connection_info(&spec);
            println!("Created instance '{}'", spec.name);
            println!("  port:     {}", spec.network.port);
            println!("  data:     {}", spec.storage.data_directory.display());
            println!("  database: {}", spec.database.name);
            println!("  owner:    {}", spec.database.owner);
            println!("  password: {}", spec.database.password);
            println!("  url:      {}", info.url);
        }
        Command::Start { name } => {
            let status = orchestrator.start(&name).await?;
            match status.pid {
                Some(pid) => println!("Started '{}' (pid {})", name, pid),
                None => println!("Started '{}'", name),
            }
        }
        Command::Stop { name } => {
            orchestrator.stop(&name).await?;
            println!("Stopped '{}'", name);
        }
        Command::Restart { name } => {
            orchestrator.restart(&name).await?;
            println!("Restarted '{}'", name);
        }
        Command::Status { name, json } => {
            let record = orchestrator.status(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        Command::List { json } => {
            let records = orchestrator.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No instances");
            } else {
                println!(
                    "{:<24} {:<8} {:<9} {:<6} {:<8}",
                    "NAME", "VERSION", "STATE", "PORT", "PID"
                );
                for record in &records {
                    println!(
                        "{:<24} {:<8} {:<9} {:<6} {:<8}",
                        record.spec.name,
                        record.spec.version,
                        record.status.state,
                        record.spec.network.port,
                        record
                            .status
                            .pid
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
        Command::Remove { name, force, backup } => {
            orchestrator
                .remove(&name, RemoveOptions { backup, force })
                .await?;
            println!("Removed '{}' (data directory kept)", name);
        }
        Command::EnableService {
            name,
            auto_start,
            restart_policy,
            restart_sec,
        } => {
            let record = orchestrator
                .enable_service(&name, service_spec(auto_start, restart_policy, restart_sec))
                .await?;
            println!("'{}' is now managed by {}", name, record.spec.unit_name());
        }
        Command::DisableService { name } => {
            orchestrator.disable_service(&name).await?;
            println!("'{}' is back under direct supervision", name);
        }
        Command::Info { name, json } => {
            let info = orchestrator.connection_info(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("host:     {}", info.host);
                println!("port:     {}", info.port);
                println!("database: {}", info.database);
                println!("user:     {}", info.user);
                println!("password: {}", info.password);
                println!("socket:   {}", info.socket_directory.display());
                println!("url:      {}", info.url);
            }
        }
        Command::Logs { name, lines } => {
            println!("{}", orchestrator.logs(&name, lines).await?);
        }
    }

    Ok(())
}
