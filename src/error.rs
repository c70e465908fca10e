//! Error types shared across the order pipeline.
//!
//! Local-write failures (`OrderError`) surface synchronously to the caller.
//! Remote failures (`ApiError`) never abort a sync pass; they are classified
//! into a [`FailureKind`] and recorded on the queue item.

use thiserror::Error;

use crate::queue::FailureKind;

/// Failures from the local SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Failures raised by the order service before anything is queued.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order item not found: {0}")]
    ItemNotFound(String),

    #[error("order {0} is already served")]
    OrderServed(String),

    #[error("order {0} was paid offline and accepts no further changes")]
    OfflineServed(String),

    #[error("order {0} is cancelled")]
    OrderCancelled(String),

    #[error("quantity must be at least 1, got {0}")]
    InvalidQuantity(i64),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid table assignment: {0}")]
    InvalidTable(String),

    #[error("order {0} has no conflicted creation to retarget")]
    NotConflicted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from the remote order API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("conflict ({code}): {message}")]
    Conflict { code: String, message: String },

    #[error("terminal not authorized (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// How the queue should record this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::Conflict { .. } => FailureKind::Conflict,
            ApiError::Rejected { .. } => FailureKind::Rejected,
            // An unreadable success body may still mean the write landed;
            // replaying with the same request id lets the server answer again.
            ApiError::Network(_)
            | ApiError::Timeout
            | ApiError::Unauthorized { .. }
            | ApiError::Server { .. }
            | ApiError::Decode(_) => FailureKind::Transient,
        }
    }

    /// Conflict code reported by the server, if any.
    pub fn conflict_code(&self) -> Option<&str> {
        match self {
            ApiError::Conflict { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Failures that abort a whole sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("remote rejected terminal credentials (HTTP {0})")]
    Unauthorized(u16),
}
