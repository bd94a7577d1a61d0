use std::{io, path::PathBuf};

use crate::workflow::WfId;

/// Errors that abort a simulation.
///
/// Deadlocks are deliberately not represented here: a detected dependency
/// cycle is recovered locally by rollback and surfaces only as a
/// [`DeadlockDetected`] value at the candidate-selector boundary.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: cannot parse workload row: {reason}")]
    WorkloadRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("unknown access type for workflow kind {0:?}")]
    UnknownAccessType(String),

    #[error("invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("language of {0:?} is infinite; refusing to enumerate")]
    InfiniteLanguage(String),

    #[error("containment tree structure bug: {0}")]
    TreeStructure(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl SimError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SimError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// Raised by the dependency-set closure walk when it meets a workflow that is
/// already being expanded (a grey-on-grey edge in the waits-for graph). The
/// witness is the workflow that closed the cycle and is the one rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlockDetected {
    pub witness: WfId,
}
