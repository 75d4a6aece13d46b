//! Error taxonomy for the evaluation engine.
//!
//! The image orchestrator and instance runner return [`HarnessError`]; the
//! scheduler records every error against its instance id together with its
//! [`ErrorKind`], so a report can tell a timeout apart from any other failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the container runtime endpoint itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The endpoint did not answer within its request timeout.
    #[error("container runtime request timed out: {0}")]
    EndpointTimeout(String),

    /// The referenced image or container does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other API failure.
    #[error("container runtime error: {0}")]
    Api(String),
}

/// Primary error type for build, run, and report collection.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The image could not be produced. Sticky per image identity.
    #[error("{message}")]
    Build { image: String, message: String },

    /// Remote registry pull or push failed.
    #[error("registry error for {image}: {message}")]
    Registry { image: String, message: String },

    /// A container or build exceeded its wall-clock budget.
    #[error("{message}")]
    Timeout { elapsed: Duration, message: String },

    /// The test command produced no usable structured report.
    #[error("{0}")]
    Report(String),

    /// A patch failed to apply inside the container.
    #[error("failed to apply patches: {detail}")]
    PatchApply { detail: String },

    /// Test discovery failed for a collector.
    #[error("failed to collect tests: {nodeid}\n{longrepr}")]
    Collection {
        nodeid: String,
        longrepr: String,
        import_error: bool,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The run was interrupted by the operator.
    #[error("interrupted")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable label recorded alongside a captured error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Build,
    Registry,
    Report,
    PatchApply,
    Collection,
    Runtime,
    Cancelled,
    Other,
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Build { .. } => ErrorKind::Build,
            HarnessError::Registry { .. } => ErrorKind::Registry,
            HarnessError::Timeout { .. } => ErrorKind::Timeout,
            HarnessError::Report(_) => ErrorKind::Report,
            HarnessError::PatchApply { .. } => ErrorKind::PatchApply,
            HarnessError::Collection { .. } => ErrorKind::Collection,
            HarnessError::Runtime(_) => ErrorKind::Runtime,
            HarnessError::Cancelled => ErrorKind::Cancelled,
            HarnessError::Io(_) | HarnessError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub(crate) fn container_timeout(elapsed: Duration) -> Self {
        HarnessError::Timeout {
            elapsed,
            message: format!("Container timed out after {} seconds.", elapsed.as_secs()),
        }
    }

    pub(crate) fn build_timeout(elapsed: Duration) -> Self {
        HarnessError::Timeout {
            elapsed,
            message: format!("Build timeout after {} seconds.", elapsed.as_secs()),
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
