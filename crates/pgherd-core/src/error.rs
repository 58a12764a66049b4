// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pgherd-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::bootstrap::BootstrapStep;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Instance record does not exist.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// Duplicate name, claimed port or directory, or instance already in the target state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The binary locator could not resolve a required executable.
    #[error(
        "Executable '{name}' for PostgreSQL {version} not found (searched {} locations and PATH)",
        .searched.len()
    )]
    ExternalToolMissing {
        /// Executable name (e.g. `initdb`).
        name: String,
        /// Requested server version.
        version: String,
        /// Every directory probed before giving up.
        searched: Vec<PathBuf>,
    },

    /// A bootstrap step failed.
    #[error("Bootstrap failed during {step}: {message}{}", format_stderr(.stderr))]
    BootstrapFailure {
        /// The step that failed.
        step: BootstrapStep,
        /// What went wrong.
        message: String,
        /// Captured error stream of the external tool, when there was one.
        stderr: Option<String>,
    },

    /// Start or stop did not reach the expected liveness within the bounded wait.
    #[error("Supervision failed: {message} (hint: {hint})")]
    SupervisionFailure {
        /// What went wrong.
        message: String,
        /// Troubleshooting hint for the operator.
        hint: String,
    },

    /// Data directory holds content this tool did not create.
    #[error("Unsafe data directory {}: {reason} (hint: {hint})", .path.display())]
    UnsafeState {
        /// The data directory.
        path: PathBuf,
        /// Why the directory was rejected.
        reason: String,
        /// Unrecognized top-level entries.
        entries: Vec<String>,
        /// Troubleshooting hint for the operator.
        hint: String,
    },

    /// Record store read/write failed.
    #[error("Persistence error: {0}")]
    PersistenceFailure(String),

    /// Instance specification or request is invalid.
    #[error("Invalid instance spec: {0}")]
    InvalidSpec(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A lower-level failure annotated with the instance and operation.
    #[error("{operation} '{instance}' failed: {source}")]
    Operation {
        /// Instance name.
        instance: String,
        /// Orchestrator operation (e.g. `start`).
        operation: &'static str,
        /// The underlying failure, surfaced verbatim.
        source: Box<Error>,
    },
}

/// Error taxonomy, independent of the annotation wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::Conflict`].
    Conflict,
    /// See [`Error::ExternalToolMissing`].
    ExternalToolMissing,
    /// See [`Error::BootstrapFailure`].
    BootstrapFailure,
    /// See [`Error::SupervisionFailure`].
    SupervisionFailure,
    /// See [`Error::UnsafeState`].
    UnsafeState,
    /// See [`Error::PersistenceFailure`].
    PersistenceFailure,
    /// See [`Error::InvalidSpec`].
    InvalidSpec,
    /// See [`Error::Config`].
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ExternalToolMissing => "external_tool_missing",
            ErrorKind::BootstrapFailure => "bootstrap_failure",
            ErrorKind::SupervisionFailure => "supervision_failure",
            ErrorKind::UnsafeState => "unsafe_state",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Classify the error, looking through [`Error::Operation`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::ExternalToolMissing { .. } => ErrorKind::ExternalToolMissing,
            Error::BootstrapFailure { .. } => ErrorKind::BootstrapFailure,
            Error::SupervisionFailure { .. } => ErrorKind::SupervisionFailure,
            Error::UnsafeState { .. } => ErrorKind::UnsafeState,
            Error::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
            Error::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Error::Config(_) => ErrorKind::Config,
            Error::Operation { source, .. } => source.kind(),
        }
    }

    /// Annotate with instance name and operation. Already-annotated errors pass through.
    pub fn in_operation(self, instance: &str, operation: &'static str) -> Error {
        match self {
            Error::Operation { .. } => self,
            other => Error::Operation {
                instance: instance.to_string(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Strip the annotation wrapper.
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn persistence(context: impl fmt::Display, err: impl fmt::Display) -> Error {
        Error::PersistenceFailure(format!("{}: {}", context, err))
    }
}

fn format_stderr(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => format!("\n--- stderr ---\n{}", s.trim()),
        _ => String::new(),
    }
}

/// Result type using pgherd Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_operation_wrapper() {
        let err = Error::Conflict("instance 'demo' is already running".into())
            .in_operation("demo", "start");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let msg = err.to_string();
        assert!(msg.contains("start 'demo' failed"));
        assert!(msg.contains("already running"));
    }

    #[test]
    fn test_in_operation_does_not_double_wrap() {
        let err = Error::NotFound("demo".into())
            .in_operation("demo", "stop")
            .in_operation("demo", "restart");
        match err {
            Error::Operation { operation, .. } => assert_eq!(operation, "stop"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_bootstrap_failure_includes_stderr() {
        let err = Error::BootstrapFailure {
            step: BootstrapStep::ClusterInit,
            message: "initdb exited with status 1".into(),
            stderr: Some("initdb: error: directory exists\n".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("cluster initialization"));
        assert!(msg.contains("--- stderr ---"));
        assert!(msg.contains("directory exists"));
    }

    #[test]
    fn test_bootstrap_failure_without_stderr() {
        let err = Error::BootstrapFailure {
            step: BootstrapStep::Teardown,
            message: "server did not exit".into(),
            stderr: None,
        };
        assert!(!err.to_string().contains("stderr"));
    }

    #[test]
    fn test_external_tool_missing_message() {
        let err = Error::ExternalToolMissing {
            name: "initdb".into(),
            version: "16".into(),
            searched: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        let msg = err.to_string();
        assert!(msg.contains("initdb"));
        assert!(msg.contains("searched 2 locations"));
    }
}
