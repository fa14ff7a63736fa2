// Error taxonomy for shard fan-out execution and sharded transactions
//
// INVARIANTS:
// 1. Only the first per-shard failure of a call or phase is surfaced; it is
//    always wrapped with the operation name or transaction phase
// 2. Per-shard transaction failures are a distinct type (TransactionError) so
//    the coordinator can tell them apart from every other failure
// 3. Halting early because a result was already found is never an error

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::shard_id::ShardId;

/// Phase of a sharded transaction, used to label wrapped failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPhase::Begin => write!(f, "begin"),
            TransactionPhase::Commit => write!(f, "commit"),
            TransactionPhase::Rollback => write!(f, "rollback"),
        }
    }
}

/// Failure signal raised by per-shard transactions and by the coordinator.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Raised by a per-shard transaction collaborator.
    #[error("shard transaction failed: {0}")]
    Failed(String),

    /// First per-shard failure of a begin/commit/rollback phase.
    #[error("transaction {phase} failed on shard {shard}: {source}")]
    Phase {
        phase: TransactionPhase,
        shard: ShardId,
        #[source]
        source: Box<TransactionError>,
    },

    /// A before-completion hook refused the commit.
    #[error("transaction synchronization failed: {0}")]
    Synchronization(String),

    #[error("invalid transaction state: {0}")]
    InvalidState(String),
}

impl TransactionError {
    /// Phase this error was raised in, if it is a wrapped phase failure.
    pub fn phase(&self) -> Option<TransactionPhase> {
        match self {
            TransactionError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("operation `{operation}` did not complete within {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// First per-shard failure observed while fanning out an operation.
    #[error("operation `{operation}` failed on shard {shard}: {source}")]
    AggregateOperation {
        operation: String,
        shard: ShardId,
        #[source]
        source: Box<ShardError>,
    },

    #[error("expected a unique result but {count} results were found across shards")]
    NonUniqueResult { count: usize },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller cancelled the operation.
    #[error("operation `{operation}` was cancelled")]
    Cancelled { operation: String },

    #[error("worker for operation `{operation}` panicked on shard {shard}: {message}")]
    WorkerPanicked {
        operation: String,
        shard: ShardId,
        message: String,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    /// Raised by a session collaborator while establishing or closing a session.
    #[error("session error: {0}")]
    Session(String),

    /// Raised by an operation collaborator while preparing or executing.
    #[error("operation error: {0}")]
    Operation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl ShardError {
    /// Wraps a per-shard failure with the name of the operation that raised it.
    pub fn aggregate(operation: impl Into<String>, shard: ShardId, source: ShardError) -> Self {
        ShardError::AggregateOperation {
            operation: operation.into(),
            shard,
            source: Box::new(source),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ShardError::Timeout { .. })
    }
}

impl From<config::ConfigError> for ShardError {
    fn from(err: config::ConfigError) -> Self {
        ShardError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for ShardError {
    fn from(err: serde_yaml::Error) -> Self {
        ShardError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(err: serde_json::Error) -> Self {
        ShardError::Config(err.to_string())
    }
}

pub type ShardResult<T> = Result<T, ShardError>;
