//! Pool and driver error types.

use thiserror::Error;

/// Broad classification of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The target refused or could not be reached.
    Refused,
    /// The operation ran against a closed connection.
    Closed,
    /// A statement failed.
    Query,
    Other,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionErrorKind::Refused => write!(f, "refused"),
            ConnectionErrorKind::Closed => write!(f, "closed"),
            ConnectionErrorKind::Query => write!(f, "query"),
            ConnectionErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Failure reported by a [`Driver`](crate::Driver) or a [`RawConnection`](crate::RawConnection).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Refused, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Closed, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Query, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Other, message)
    }
}

/// Errors surfaced to callers of the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The driver could not open a connection, or a pass-through call failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Too many bad connections were seen during a single acquisition.
    #[error("could not get a good connection to the database ({bad} bad connections)")]
    Exhausted { bad: usize },

    /// The acquisition loop ended without a connection.
    #[error("unknown severe error condition: {0}")]
    Internal(String),

    /// The wait for a connection was interrupted by a pool shutdown.
    #[error("acquisition cancelled while waiting for a connection")]
    Cancelled,

    /// The pool has been shut down and accepts no new acquisitions.
    #[error("connection pool is shut down")]
    Closed,

    /// The handle was invalidated (released, reclaimed, or force-closed).
    #[error("connection {id} is invalid")]
    InvalidConnection { id: u64 },
}

pub type PoolResult<T> = Result<T, PoolError>;
