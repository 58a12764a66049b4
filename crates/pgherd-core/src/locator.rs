// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary locator.
//!
//! Resolves PostgreSQL executables by probing an explicit, ordered list of install
//! locations:
//!
//! 1. versioned templates with the exact version (`/usr/lib/postgresql/16.2/bin`)
//! 2. versioned templates with the major version (`/usr/lib/postgresql/16/bin`)
//! 3. generic directories (`/usr/local/bin`, ...)
//! 4. `PATH`
//!
//! The first hit wins, so an exact vendor install beats whatever `PATH` points at.
//! Nothing is cached: installs can change between invocations.

use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Placeholder substituted with the exact or major version in versioned templates.
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Cluster initializer.
pub const INITDB: &str = "initdb";
/// Server binary.
pub const POSTGRES: &str = "postgres";

const DEFAULT_VERSIONED: &[&str] = &[
    "/usr/lib/postgresql/{version}/bin",
    "/usr/pgsql-{version}/bin",
    "/opt/homebrew/opt/postgresql@{version}/bin",
    "/usr/local/opt/postgresql@{version}/bin",
];

const DEFAULT_GENERIC: &[&str] = &[
    "/usr/local/pgsql/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/opt/local/bin",
];

/// Ordered probe list for the [`BinaryLocator`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPaths {
    /// Templates containing [`VERSION_PLACEHOLDER`].
    pub versioned: Vec<String>,
    /// Directories probed after every versioned candidate.
    pub generic: Vec<PathBuf>,
    /// `PATH`-style list probed last; `None` disables the fallback.
    pub path_env: Option<OsString>,
}

impl Default for SearchPaths {
    fn default() -> Self {
        Self {
            versioned: DEFAULT_VERSIONED.iter().map(|s| s.to_string()).collect(),
            generic: DEFAULT_GENERIC.iter().map(PathBuf::from).collect(),
            path_env: std::env::var_os("PATH"),
        }
    }
}

impl SearchPaths {
    /// Explicit probe list without a `PATH` fallback.
    pub fn new(versioned: Vec<String>, generic: Vec<PathBuf>) -> Self {
        Self {
            versioned,
            generic,
            path_env: None,
        }
    }

    /// Parse a colon-separated list. Entries with [`VERSION_PLACEHOLDER`] become
    /// versioned templates, the rest generic directories. `PATH` stays as fallback.
    pub fn parse(list: &str) -> Self {
        let mut versioned = Vec::new();
        let mut generic = Vec::new();
        for entry in list.split(':').map(str::trim).filter(|s| !s.is_empty()) {
            if entry.contains(VERSION_PLACEHOLDER) {
                versioned.push(entry.to_string());
            } else {
                generic.push(PathBuf::from(entry));
            }
        }
        Self {
            versioned,
            generic,
            path_env: std::env::var_os("PATH"),
        }
    }

    /// Replace the `PATH` fallback.
    pub fn with_path_env(mut self, path_env: Option<OsString>) -> Self {
        self.path_env = path_env;
        self
    }

    /// Candidate directories for `version`, in probe order, without duplicates.
    pub fn candidates(&self, version: &str) -> Vec<PathBuf> {
        let major = major_version(version);
        let mut dirs: Vec<PathBuf> = Vec::new();
        let mut push = |dir: PathBuf| {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        };

        for template in &self.versioned {
            push(PathBuf::from(template.replace(VERSION_PLACEHOLDER, version)));
        }
        for template in &self.versioned {
            push(PathBuf::from(template.replace(VERSION_PLACEHOLDER, major)));
        }
        for dir in &self.generic {
            push(dir.clone());
        }
        if let Some(path_env) = &self.path_env {
            for dir in std::env::split_paths(path_env) {
                push(dir);
            }
        }
        dirs
    }
}

/// Major component of a `major.minor` version string.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Resolves executables from a [`SearchPaths`] list.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    search: SearchPaths,
}

impl BinaryLocator {
    /// Create a locator over an explicit probe list.
    pub fn new(search: SearchPaths) -> Self {
        Self { search }
    }

    /// The probe list.
    pub fn search_paths(&self) -> &SearchPaths {
        &self.search
    }

    /// Locate `name` for `version`.
    pub fn locate(&self, name: &str, version: &str) -> Result<PathBuf> {
        let candidates = self.search.candidates(version);
        for dir in &candidates {
            let path = dir.join(name);
            if is_executable(&path) {
                debug!(
                    binary = %name,
                    version = %version,
                    path = %path.display(),
                    "Located executable"
                );
                return Ok(path);
            }
        }

        Err(Error::ExternalToolMissing {
            name: name.to_string(),
            version: version.to_string(),
            searched: candidates,
        })
    }

    /// Locate both executables needed to create an instance.
    pub fn server_binaries(&self, version: &str) -> Result<ServerBinaries> {
        Ok(ServerBinaries {
            initdb: self.locate(INITDB, version)?,
            postgres: self.locate(POSTGRES, version)?,
        })
    }
}

/// Executables used by the bootstrap sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerBinaries {
    /// Cluster initializer.
    pub initdb: PathBuf,
    /// Server binary.
    pub postgres: PathBuf,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
