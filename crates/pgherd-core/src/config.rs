// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for pgherd.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bootstrap::BootstrapConfig;
use crate::locator::SearchPaths;
use crate::supervisor::SupervisorConfig;
use crate::supervisor::systemd::SystemdConfig;

/// Tool configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for records, the global document and lock files.
    pub home: PathBuf,
    /// Binary locator probe list.
    pub search_paths: SearchPaths,
    /// Bootstrap timings.
    pub bootstrap: BootstrapConfig,
    /// Supervisor timings.
    pub supervisor: SupervisorConfig,
    /// systemd integration.
    pub systemd: SystemdConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = match std::env::var("PGHERD_HOME") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => home_dir()?.join(".pgherd"),
        };

        let search_paths = match std::env::var("PGHERD_SEARCH_PATHS") {
            Ok(list) if !list.trim().is_empty() => SearchPaths::parse(&list),
            _ => SearchPaths::default(),
        };

        let user_mode = parse_env_bool("PGHERD_SYSTEMD_USER", false);
        let unit_dir = match std::env::var("PGHERD_UNIT_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ if user_mode => home_dir()?.join(".config/systemd/user"),
            _ => PathBuf::from("/etc/systemd/system"),
        };

        let mut supervisor = SupervisorConfig::default();
        if let Some(secs) = parse_env_u64("PGHERD_SETTLE_SECS")? {
            supervisor.settle_time = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env_u64("PGHERD_STOP_TIMEOUT_SECS")? {
            supervisor.stop_timeout = Duration::from_secs(secs);
        }

        let mut bootstrap = BootstrapConfig::default();
        if let Some(attempts) = ready_attempts(std::env::var("PGHERD_READY_ATTEMPTS").ok())? {
            bootstrap.ready_max_attempts = attempts;
        }

        Ok(Self {
            home,
            search_paths,
            bootstrap,
            supervisor,
            systemd: SystemdConfig {
                unit_dir,
                user_mode,
            },
        })
    }

    /// Configuration rooted at `home` with defaults everywhere else.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            search_paths: SearchPaths::default(),
            bootstrap: BootstrapConfig::default(),
            supervisor: SupervisorConfig::default(),
            systemd: SystemdConfig::default(),
        }
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| ConfigError::MissingEnvVar("PGHERD_HOME or HOME"))
}

/// Parse an env var into a bool with a sensible default.
fn parse_env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn parse_env_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    parse_number(var, std::env::var(var).ok())
}

fn parse_number<T: FromStr>(
    var: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| v.trim().parse().map_err(|_| ConfigError::InvalidNumber(var)))
        .transpose()
}

/// Readiness attempt ceiling: a `u32` of at least one.
fn ready_attempts(value: Option<String>) -> Result<Option<u32>, ConfigError> {
    const VAR: &str = "PGHERD_READY_ATTEMPTS";
    match parse_number::<u32>(VAR, value)? {
        Some(0) => Err(ConfigError::OutOfRange(VAR, "must be at least 1")),
        attempts => Ok(attempts),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable did not parse.
    #[error("Invalid number in environment variable {0}")]
    InvalidNumber(&'static str),
    /// A numeric variable parsed but is not usable.
    #[error("Environment variable {0} out of range: {1}")]
    OutOfRange(&'static str, &'static str),
}
