//! Error taxonomy for tidepool.
//!
//! Callers see one small, stable set of error kinds no matter which
//! driver produced the underlying failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionId;

/// Result type alias for pool, router, and service operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Whether a driver failure concerns the connection or the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport or session failure. Counts against connection health.
    Connection,
    /// The statement itself was rejected (syntax, constraint, ...).
    Statement,
}

/// Error returned by a `DriverConnection` or `ConnectionFactory`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} failure: {message}")]
pub struct DriverError {
    pub kind: FailureKind,
    pub message: String,
}

impl DriverError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Connection,
            message: message.into(),
        }
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Statement,
            message: message.into(),
        }
    }
}

/// Errors surfaced by tidepool operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoolError {
    /// Invalid or missing startup parameters, or the database is unreachable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No connection became available before the acquire timeout.
    #[error("timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    /// The caller cancelled a pending acquire.
    #[error("acquire cancelled")]
    Cancelled,

    /// Capacity is unavailable because replacement connections keep failing.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Internal: drives recycling, never returned from public operations.
    #[error("connection {0} is unhealthy")]
    ConnectionUnhealthy(ConnectionId),

    /// The driver failed executing a statement.
    #[error("query failed on {connection_id} [{fingerprint}]: {message}")]
    QueryExecution {
        connection_id: ConnectionId,
        fingerprint: String,
        kind: FailureKind,
        message: String,
    },

    /// Illegal nesting, or commit/rollback with no open transaction.
    #[error("transaction aborted: {0}")]
    TransactionAbort(String),

    /// The pool has begun shutting down.
    #[error("pool is shutting down")]
    ShuttingDown,

    /// The connection id is not checked out by anyone.
    #[error("unknown or idle connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl PoolError {
    /// Stable machine-readable kind, used by the operation surface.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::Configuration(_) => "ConfigurationError",
            PoolError::AcquireTimeout(_) => "ConnectionAcquireTimeout",
            PoolError::Cancelled => "Cancelled",
            PoolError::PoolExhausted(_) => "PoolExhausted",
            PoolError::ConnectionUnhealthy(_) => "ConnectionUnhealthy",
            PoolError::QueryExecution { .. } => "QueryExecutionError",
            PoolError::TransactionAbort(_) => "TransactionAbortError",
            PoolError::ShuttingDown => "PoolShuttingDown",
            PoolError::UnknownConnection(_) => "UnknownConnection",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::AcquireTimeout(_) | PoolError::PoolExhausted(_) => true,
            PoolError::QueryExecution { kind, .. } => *kind == FailureKind::Connection,
            _ => false,
        }
    }

    /// Wrap a driver error with the context of where it happened.
    pub fn query(connection_id: ConnectionId, fingerprint: &str, err: DriverError) -> Self {
        PoolError::QueryExecution {
            connection_id,
            fingerprint: fingerprint.to_string(),
            kind: err.kind,
            message: err.message,
        }
    }
}
