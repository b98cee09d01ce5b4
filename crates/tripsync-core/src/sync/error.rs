//! Error types for the sync engine.

use thiserror::Error;

/// Result type for remote and sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised while talking to the remote data source.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Server-side failure (5xx).
    #[error("server error: {0}")]
    Server(String),

    /// Remote call exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// No network connectivity.
    #[error("not connected to server")]
    NotConnected,

    /// No authenticated user.
    #[error("not authenticated")]
    Unauthenticated,

    /// Server refused the change outright (4xx, validation).
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Caller cancelled the cycle.
    #[error("sync cancelled")]
    Cancelled,

    /// Local store failure.
    #[error("local store error: {0}")]
    Store(#[from] crate::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed operation should be retried with backoff.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Server(_) | Self::Timeout | Self::NotConnected => true,
            _ => false,
        }
    }

    /// Cancellation is never recorded as a retry or a failure.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::Server("internal error".into()).is_retryable());
        assert!(!SyncError::Rejected("bad payload".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Unauthenticated.is_retryable());
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(SyncError::Cancelled.is_cancelled());
        assert!(!SyncError::Timeout.is_cancelled());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");
        let err = SyncError::from(crate::Error::NotFound("trip 1".into()));
        assert!(err.to_string().contains("trip 1"));
    }
}
