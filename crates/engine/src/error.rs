//! Engine error types.
//!
//! Item collaborators fail with `anyhow::Error`; everything the engine itself
//! raises is a [`StepError`]. A handful of error types are always fatal and
//! escape every user-configured skip or retry rule, see [`is_fatal`].

use std::fmt;

use thiserror::Error;

use batchforge_infra::RepositoryError;

/// The pipeline phase an item error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Read,
    Process,
    Write,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Read => "read",
            Phase::Process => "process",
            Phase::Write => "write",
        })
    }
}

/// Raised by collaborators for failures no policy may absorb.
#[derive(Debug, Error)]
#[error("unrecoverable: {message}")]
pub struct Unrecoverable {
    message: String,
}

impl Unrecoverable {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Invalid step or policy configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid step configuration: {0}")]
    Invalid(String),

    #[error("retry context cache is full ({capacity} entries)")]
    RetryCacheFull { capacity: usize },
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// A skip policy refused because its budget is spent.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("skip limit of {limit} exceeded")]
pub struct SkipLimitExceeded {
    pub limit: u64,
}

/// Marks a no-rollback write failure that must still roll back so the chunk
/// can be scanned item by item.
#[derive(Debug, Error)]
#[error("forced rollback to isolate a failed write")]
pub struct ForceRollbackForWriteSkip {
    #[source]
    pub source: anyhow::Error,
}

/// Why a step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("non-skippable {phase} error")]
    NonSkippable {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("skip limit of {limit} exceeded in {phase}")]
    SkipLimitExceeded {
        phase: Phase,
        limit: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("retry exhausted after {attempts} attempts in {phase}")]
    RetryExhausted {
        phase: Phase,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("listener callback {callback} failed")]
    Listener {
        callback: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("unrecoverable error")]
    Unrecoverable(#[source] anyhow::Error),

    #[error("stream {operation} failed")]
    Stream {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("transaction {operation} failed")]
    Transaction {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("step interrupted")]
    Interrupted,

    #[error("step cannot be started: {0}")]
    Restart(String),

    #[error("partitioned step failed: {0}")]
    Partition(String),

    #[error("{phase} failed")]
    Item {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
}

impl StepError {
    /// Turn an escaping collaborator error into a step failure, unwrapping
    /// engine errors that travelled through `anyhow`.
    pub fn escalate(phase: Phase, err: anyhow::Error) -> StepError {
        let err = match err.downcast::<StepError>() {
            Ok(step_error) => return step_error,
            Err(err) => err,
        };
        let err = match err.downcast::<ConfigError>() {
            Ok(config) => return StepError::Configuration(config),
            Err(err) => err,
        };
        if err.chain().any(|c| c.is::<Unrecoverable>()) {
            return StepError::Unrecoverable(err);
        }
        if let Some(limit) = err.downcast_ref::<SkipLimitExceeded>() {
            let limit = limit.limit;
            return StepError::SkipLimitExceeded {
                phase,
                limit,
                source: err,
            };
        }
        StepError::Item { phase, source: err }
    }

    /// The item error underneath, when there is one.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            StepError::NonSkippable { source, .. }
            | StepError::SkipLimitExceeded { source, .. }
            | StepError::RetryExhausted { source, .. }
            | StepError::Item { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors that win over every skip, retry and no-rollback rule.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<Unrecoverable>()
            || cause.is::<StepError>()
            || cause.is::<SkipLimitExceeded>()
            || cause.is::<ConfigError>()
    })
}
