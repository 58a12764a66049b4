// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generated configuration files.
//!
//! `postgresql.conf` is built as a [`ConfDocument`] (sections of typed settings) and
//! rendered in one place, so values are always quoted the way the server expects.
//! `pg_hba.conf` is rendered from [`HbaRule`]s in fixed-width columns.

use std::fmt;
use std::fs;
use std::path::Path;

use super::BootstrapStep;
use crate::error::Result;
use crate::model::InstanceSpec;

/// First line of every generated file. The partial-install classifier looks for it.
pub const GENERATED_MARKER: &str = "# Generated by pgherd";

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfValue {
    /// Bare integer.
    Int(i64),
    /// Bare real number.
    Real(f64),
    /// `on` / `off`.
    Bool(bool),
    /// Single-quoted string, embedded quotes doubled.
    Str(String),
}

impl fmt::Display for ConfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfValue::Int(v) => write!(f, "{}", v),
            ConfValue::Real(v) => write!(f, "{}", v),
            ConfValue::Bool(v) => f.write_str(if *v { "on" } else { "off" }),
            ConfValue::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<i64> for ConfValue {
    fn from(v: i64) -> Self {
        ConfValue::Int(v)
    }
}

impl From<u16> for ConfValue {
    fn from(v: u16) -> Self {
        ConfValue::Int(v.into())
    }
}

impl From<u32> for ConfValue {
    fn from(v: u32) -> Self {
        ConfValue::Int(v.into())
    }
}

impl From<f64> for ConfValue {
    fn from(v: f64) -> Self {
        ConfValue::Real(v)
    }
}

impl From<bool> for ConfValue {
    fn from(v: bool) -> Self {
        ConfValue::Bool(v)
    }
}

impl From<&str> for ConfValue {
    fn from(v: &str) -> Self {
        ConfValue::Str(v.to_string())
    }
}

impl From<String> for ConfValue {
    fn from(v: String) -> Self {
        ConfValue::Str(v)
    }
}

impl From<&Path> for ConfValue {
    fn from(v: &Path) -> Self {
        ConfValue::Str(v.display().to_string())
    }
}

/// A `# Title` section of settings.
#[derive(Debug, Clone, Default)]
pub struct ConfSection {
    title: String,
    entries: Vec<(String, ConfValue)>,
}

impl ConfSection {
    /// Append a setting.
    pub fn set(&mut self, key: &str, value: impl Into<ConfValue>) -> &mut Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    /// Append a setting when `value` is present.
    pub fn set_opt<V: Into<ConfValue>>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        if let Some(v) = value {
            self.set(key, v);
        }
        self
    }
}

/// Server configuration document.
#[derive(Debug, Clone, Default)]
pub struct ConfDocument {
    header: Vec<String>,
    sections: Vec<ConfSection>,
}

impl ConfDocument {
    /// Empty document; rendering always starts with [`GENERATED_MARKER`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a comment line below the marker.
    pub fn comment(&mut self, line: impl Into<String>) -> &mut Self {
        self.header.push(line.into());
        self
    }

    /// Start a new section.
    pub fn section(&mut self, title: &str) -> &mut ConfSection {
        self.sections.push(ConfSection {
            title: title.to_string(),
            entries: Vec::new(),
        });
        let last = self.sections.len() - 1;
        &mut self.sections[last]
    }

    /// Look up a rendered value.
    pub fn get(&self, key: &str) -> Option<&ConfValue> {
        self.sections
            .iter()
            .flat_map(|s| s.entries.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Render to text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(GENERATED_MARKER);
        out.push('\n');
        for line in &self.header {
            out.push_str("# ");
            out.push_str(line);
            out.push('\n');
        }
        for section in self.sections.iter().filter(|s| !s.entries.is_empty()) {
            out.push('\n');
            out.push_str("# ");
            out.push_str(&section.title);
            out.push('\n');
            for (key, value) in &section.entries {
                out.push_str(&format!("{} = {}\n", key, value));
            }
        }
        out
    }
}

/// Quote a path for `/bin/sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Build `postgresql.conf` for `spec`.
pub fn server_config(spec: &InstanceSpec) -> ConfDocument {
    let mut doc = ConfDocument::new();
    doc.comment(format!("Instance: {} (PostgreSQL {})", spec.name, spec.version))
        .comment("Edits are overwritten when the instance is re-created.");

    doc.section("Connection")
        .set("listen_addresses", spec.network.bind_address.as_str())
        .set("port", spec.network.port)
        .set("max_connections", spec.network.max_connections)
        .set("unix_socket_directories", spec.socket_dir().as_path())
        .set("unix_socket_permissions", "0700");

    if let Some(perf) = &spec.performance {
        doc.section("Performance")
            .set_opt("shared_buffers", perf.shared_buffers.clone())
            .set_opt("effective_cache_size", perf.effective_cache_size.clone())
            .set_opt("work_mem", perf.work_mem.clone())
            .set_opt("maintenance_work_mem", perf.maintenance_work_mem.clone())
            .set_opt("wal_buffers", perf.wal_buffers.clone())
            .set_opt("random_page_cost", perf.random_page_cost);
    }

    if let Some(archive) = &spec.storage.archive_directory {
        let dir = archive.display().to_string();
        let target = shell_quote(&format!("{}/", dir));
        doc.section("Archiving")
            .set("wal_level", "replica")
            .set("archive_mode", true)
            .set(
                "archive_command",
                format!("test ! -f {target}%f && cp %p {target}%f"),
            );
    }

    doc.section("Logging")
        .set("logging_collector", true)
        .set("log_directory", spec.storage.log_directory.as_path())
        .set("log_filename", "postgresql-%Y-%m-%d.log")
        .set("log_line_prefix", "%m [%p] %q%u@%d ");

    doc.section("Security")
        .set("ssl", spec.security.ssl)
        .set("password_encryption", "scram-sha-256");

    doc.section("Locale")
        .set("timezone", spec.database.timezone.as_str())
        .set("log_timezone", spec.database.timezone.as_str());

    doc
}

/// Connection type of an access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbaKind {
    /// Unix socket.
    Local,
    /// TCP, with or without SSL.
    Host,
}

/// One `pg_hba.conf` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaRule {
    /// Connection type.
    pub kind: HbaKind,
    /// Database column.
    pub database: String,
    /// User column.
    pub user: String,
    /// Address column, `None` for local rules.
    pub address: Option<String>,
    /// Auth method.
    pub method: String,
}

impl fmt::Display for HbaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HbaKind::Local => "local",
            HbaKind::Host => "host",
        };
        write!(
            f,
            "{:<8}{:<16}{:<16}{:<24}{}",
            kind,
            self.database,
            self.user,
            self.address.as_deref().unwrap_or(""),
            self.method
        )
    }
}

/// Access rules for `spec`: the socket rule first, then one per allowed host.
pub fn access_rules(spec: &InstanceSpec) -> Vec<HbaRule> {
    let mut rules = vec![HbaRule {
        kind: HbaKind::Local,
        database: "all".to_string(),
        user: "all".to_string(),
        address: None,
        method: spec.security.local_auth_method.clone(),
    }];
    for host in &spec.security.allowed_hosts {
        rules.push(HbaRule {
            kind: HbaKind::Host,
            database: "all".to_string(),
            user: "all".to_string(),
            address: Some(host.clone()),
            method: spec.security.auth_method.clone(),
        });
    }
    rules
}

/// Render `pg_hba.conf`.
pub fn render_access_rules(rules: &[HbaRule]) -> String {
    let mut out = String::new();
    out.push_str(GENERATED_MARKER);
    out.push('\n');
    out.push_str(&format!(
        "# {:<6}{:<16}{:<16}{:<24}{}\n",
        "TYPE", "DATABASE", "USER", "ADDRESS", "METHOD"
    ));
    for rule in rules {
        out.push_str(&rule.to_string());
        out.push('\n');
    }
    out
}

/// Write `postgresql.conf` and `pg_hba.conf` into the data directory.
pub fn write_config_files(spec: &InstanceSpec) -> Result<()> {
    let step = BootstrapStep::ConfigMaterialization;
    let data_dir = &spec.storage.data_directory;

    let conf_path = data_dir.join("postgresql.conf");
    fs::write(&conf_path, server_config(spec).render())
        .map_err(|e| step.fail(format!("write {}: {}", conf_path.display(), e)))?;

    let hba_path = data_dir.join("pg_hba.conf");
    fs::write(&hba_path, render_access_rules(&access_rules(spec)))
        .map_err(|e| step.fail(format!("write {}: {}", hba_path.display(), e)))?;

    Ok(())
}
