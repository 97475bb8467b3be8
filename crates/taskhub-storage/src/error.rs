//! Storage error types for the task storage abstraction layer.

use std::fmt;

use taskhub_core::DeadlineExceeded;

/// Errors that can occur during storage operations.
///
/// A task that exists but belongs to another owner is reported as
/// [`StorageError::NotFound`], exactly like a task that does not exist.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The task does not exist or is not owned by the caller.
    #[error("Task not found: {id}")]
    NotFound {
        /// The requested task ID.
        id: i64,
    },

    /// Attempted to create a task that already exists.
    #[error("Task already exists: {message}")]
    AlreadyExists {
        /// Description of the conflicting row.
        message: String,
    },

    /// The request deadline elapsed before the store answered.
    #[error("Storage call exceeded the request deadline")]
    DeadlineExceeded,

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(id: i64) -> Self {
        Self::NotFound { id }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::DeadlineExceeded => ErrorCategory::Timeout,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<DeadlineExceeded> for StorageError {
    fn from(_: DeadlineExceeded) -> Self {
        Self::DeadlineExceeded
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Task not found.
    NotFound,
    /// Duplicate create.
    Conflict,
    /// Request deadline elapsed.
    Timeout,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Timeout => write!(f, "timeout"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
