//! Error taxonomy for resolution, installation and persistence.
//!
//! Endpoints report [`EndpointError`], which is `Clone` so that one failed
//! lookup can be shared by every requester waiting on the metadata cache.
//! Everything that reaches the command layer is a [`PackageError`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Normalized failure of a package source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Timeouts, connection resets, 5xx responses. Retried by the caller.
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    #[error("network error: {0}")]
    NetworkPermanent(String),

    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),
}

impl EndpointError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EndpointError::NetworkTransient(_))
    }

    /// Wrap an I/O or parsing failure on a local artifact.
    pub fn corrupt(err: impl fmt::Display) -> Self {
        EndpointError::CorruptArtifact(err.to_string())
    }
}

/// One side of a version conflict: who asked, and for what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Requesting package, or `<root>` for the manifest itself.
    pub requester: String,
    pub constraint: String,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires {}", self.requester, self.constraint)
    }
}

/// A single failed installation operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub package: String,
    pub path: PathBuf,
    pub cause: String,
    /// The failure was a network problem (as opposed to disk, hooks, integrity).
    pub network: bool,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.package, self.path.display(), self.cause)
    }
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("malformed version constraint '{constraint}': {reason}")]
    MalformedConstraint { constraint: String, reason: String },

    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("package {package} not found{}: {detail}", chain_suffix(.chain))]
    NotFound {
        package: String,
        chain: Vec<String>,
        detail: String,
    },

    #[error("authentication required for {package}: {detail}")]
    AuthRequired { package: String, detail: String },

    #[error("network error while fetching {package} (retries exhausted): {detail}")]
    NetworkTransient { package: String, detail: String },

    #[error("network error while fetching {package}: {detail}")]
    NetworkPermanent { package: String, detail: String },

    #[error("corrupt artifact for {package}: {detail}")]
    CorruptArtifact { package: String, detail: String },

    #[error("circular dependency: {}", .path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("conflicting requirements for {package}: {existing} but {incoming}")]
    ResolutionConflict {
        package: String,
        existing: Requirement,
        incoming: Requirement,
    },

    #[error("{} of {total} operations failed:\n{}", .failures.len(), format_failures(.failures))]
    PartialInstallFailure {
        failures: Vec<OperationFailure>,
        total: usize,
    },

    #[error("failed to persist {path}: {reason}")]
    PersistenceFailure { path: PathBuf, reason: String },

    #[error("interrupted")]
    Cancelled,
}

impl PackageError {
    /// Attach package context to an endpoint failure.
    pub fn from_endpoint(package: &str, chain: &[String], err: EndpointError) -> Self {
        let package = package.to_string();
        match err {
            EndpointError::NotFound(detail) => PackageError::NotFound {
                package,
                chain: chain.to_vec(),
                detail,
            },
            EndpointError::AuthRequired(detail) => PackageError::AuthRequired { package, detail },
            EndpointError::NetworkTransient(detail) => {
                PackageError::NetworkTransient { package, detail }
            }
            EndpointError::NetworkPermanent(detail) => {
                PackageError::NetworkPermanent { package, detail }
            }
            EndpointError::CorruptArtifact(detail) => {
                PackageError::CorruptArtifact { package, detail }
            }
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        PackageError::PersistenceFailure {
            path: path.into(),
            reason: format!("{:#}", err),
        }
    }

    /// Result code reported to the command layer.
    pub fn status(&self) -> RunStatus {
        match self {
            PackageError::AuthRequired { .. }
            | PackageError::NetworkTransient { .. }
            | PackageError::NetworkPermanent { .. } => RunStatus::NetworkFailed,
            PackageError::PartialInstallFailure { .. } => RunStatus::PartialInstallFailed,
            PackageError::PersistenceFailure { .. } => RunStatus::PersistenceFailed,
            PackageError::Cancelled => RunStatus::Interrupted,
            _ => RunStatus::ResolutionFailed,
        }
    }
}

fn chain_suffix(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (required by {})", chain.join(" -> "))
    }
}

fn format_failures(failures: &[OperationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Outcome category of a command, mapped to a process exit code by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    ResolutionFailed,
    NetworkFailed,
    PartialInstallFailed,
    PersistenceFailed,
    Interrupted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::ResolutionFailed => 2,
            RunStatus::NetworkFailed => 3,
            RunStatus::PartialInstallFailed => 4,
            RunStatus::PersistenceFailed => 5,
            RunStatus::Interrupted => 130,
        }
    }
}
