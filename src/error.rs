//! Error types for the sync engine

use std::fmt;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T = ()> = Result<T, EngineError>;

/// Errors that can occur across the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation failed
    #[error("Database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// Cloud provider error. Transient variants are retried with backoff
    /// inside the component that owns the call.
    #[error("Cloud provider error: {0}")]
    Cloud(String),

    /// Index disagreed with the live tree; the live state won and the index
    /// was corrected.
    #[error("Consistency repair: {0}")]
    Consistency(String),

    /// Internal invariant broken (uid collision, dir demoted to file, cycle
    /// in op graph). Fatal to the batch that triggered it.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An op failed during execution; dependents remain blocked and the
    /// executor pauses.
    #[error("Operation failed: {0}")]
    OpFailed(String),

    /// A copy found a byte-identical destination. Soft error: treated as a
    /// successful no-op by the executor.
    #[error("Identical file already exists at destination")]
    IdenticalFileExists,

    /// A single op exceeded its timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Shutdown was requested while waiting
    #[error("Engine was interrupted")]
    Interrupted,

    /// Configuration problem
    #[error("Config error: {0}")]
    Config(String),

    /// Requested node is not in the index
    #[error("Node not found: {0}")]
    NodeNotFound(String),
}

impl EngineError {
    pub fn cloud<T: fmt::Display>(msg: T) -> Self {
        Self::Cloud(msg.to_string())
    }

    pub fn invariant<T: fmt::Display>(msg: T) -> Self {
        Self::InvariantViolation(msg.to_string())
    }

    pub fn op_failed<T: fmt::Display>(msg: T) -> Self {
        Self::OpFailed(msg.to_string())
    }

    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn node_not_found<T: fmt::Display>(what: T) -> Self {
        Self::NodeNotFound(what.to_string())
    }

    /// True for errors that are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cloud(msg) => {
                msg.contains("rate limit") || msg.contains("503") || msg.contains("500")
            }
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Soft errors terminate an op successfully without doing work.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::IdenticalFileExists)
    }
}
