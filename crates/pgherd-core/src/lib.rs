// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgherd Core - PostgreSQL Instance Lifecycle Management
//!
//! This crate runs several independently configured PostgreSQL servers side by side
//! on one host. It creates each instance from a declarative spec (data directory,
//! first database, owner role, generated configuration), supervises the server
//! either directly or through systemd, and keeps the persisted status honest by
//! reconciling it against the live process on every read.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          pgherd CLI (pgherd-ctl)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Orchestrator (this crate)                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Record    │  │   Binary    │  │  Bootstrap  │  │   Process   │     │
//! │  │    Store    │  │   Locator   │  │  Sequencer  │  │  Supervisor │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!         │                  │                │                 │
//!         ▼                  ▼                ▼                 ▼
//!   <home>/instances/   vendor dirs,     initdb + temp     postgres -D / systemctl
//!     <name>.toml          PATH          socket server
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `create` | Bootstrap a new instance and persist its record |
//! | `start` | Start the server and confirm it is alive |
//! | `stop` | SIGTERM, bounded wait, SIGKILL fallback |
//! | `restart` | Stop if running, cool down, start |
//! | `status` | Reconciled record; stale state is corrected and persisted |
//! | `list` | Every record, reconciled |
//! | `remove` | Delete the record; data directories are kept |
//! | `enable_service` / `disable_service` | Switch between direct and systemd supervision |
//! | `connection_info` | Host, port, credentials and URL |
//! | `logs` | Tail of the newest server log |
//!
//! # Instance State Machine
//!
//! ```text
//!     ┌─────────┐  start   ┌──────────┐  alive   ┌─────────┐
//!     │ STOPPED │─────────►│ STARTING │─────────►│ RUNNING │
//!     └─────────┘          └──────────┘          └────┬────┘
//!          ▲                                          │ stop
//!          │               ┌──────────┐               │
//!          └───────────────│ STOPPING │◄──────────────┘
//!                          └──────────┘
//!
//!     any state ──OS failure──► ERROR ──► STARTING | STOPPED
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PGHERD_HOME` | `$HOME/.pgherd` | Records, global defaults and lock files |
//! | `PGHERD_SEARCH_PATHS` | built-in list | Colon-separated binary probe list |
//! | `PGHERD_UNIT_DIR` | `/etc/systemd/system` | Where unit files are written |
//! | `PGHERD_SYSTEMD_USER` | `false` | Use `systemctl --user` |
//! | `PGHERD_SETTLE_SECS` | `2` | Wait before the post-start liveness probe |
//! | `PGHERD_STOP_TIMEOUT_SECS` | `30` | Graceful stop ceiling |
//! | `PGHERD_READY_ATTEMPTS` | `30` | Bootstrap readiness attempts |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error taxonomy
//! - [`model`]: Instance records and global defaults
//! - [`store`]: TOML record store
//! - [`locator`]: PostgreSQL executable discovery
//! - [`lock`]: Per-instance advisory locks
//! - [`bootstrap`]: Data directory initialization and provisioning
//! - [`supervisor`]: Direct and systemd process supervision
//! - [`orchestrator`]: The lifecycle operations
//! - [`backup`]: Backup hook used before removal
//! - [`logfile`]: Server log tailing

#![deny(missing_docs)]

/// Backup collaborator invoked before removal.
pub mod backup;

/// Data directory initialization, provisioning and config generation.
pub mod bootstrap;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for pgherd operations.
pub mod error;

/// PostgreSQL executable discovery.
pub mod locator;

/// Per-instance advisory locks.
pub mod lock;

/// Server log helpers.
pub mod logfile;

/// Instance records and global defaults.
pub mod model;

/// Lifecycle operations.
pub mod orchestrator;

/// Instance record persistence.
pub mod store;

/// Direct and service-managed process supervision.
pub mod supervisor;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use model::{
    InstanceRecord, InstanceSpec, InstanceState, InstanceStatus, ServiceSpec, Supervision,
};
pub use orchestrator::{ConnectionInfo, CreateOptions, Orchestrator, RemoveOptions};
