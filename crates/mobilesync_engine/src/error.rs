//! Error types for the sync engine.

use mobilesync_protocol::{ProtocolError, RestResponse};
use mobilesync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid target or sync configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered a whole request with a non-success status.
    #[error("server error {status}: {body}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// A server payload could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// JSON error while reading or writing a configuration.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sync was stopped.
    #[error("sync cancelled")]
    Cancelled,

    /// No sync definition with that id or name.
    #[error("unknown sync: {0}")]
    UnknownSync(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current status.
        from: String,
        /// Attempted status.
        to: String,
    },
}

impl SyncError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

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

    /// Creates a server error from a non-success response.
    pub fn server(response: &RestResponse) -> Self {
        Self::Server {
            status: response.status,
            body: response.as_string(),
        }
    }

    /// Returns true if this error can be retried by a later sync.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true for configuration errors.
    pub fn is_config(&self) -> bool {
        matches!(self, SyncError::Config(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(error: ProtocolError) -> Self {
        if error.is_configuration() {
            SyncError::Config(error.to_string())
        } else {
            SyncError::Protocol(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::server(&RestResponse::new(503, json!("busy"))).is_retryable());
        assert!(!SyncError::server(&RestResponse::new(400, json!("bad"))).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::config("no fields").is_retryable());
    }

    #[test]
    fn protocol_errors_are_classified() {
        let err: SyncError = ProtocolError::BatchTooLarge { size: 30, max: 25 }.into();
        assert!(err.is_config());
        let err: SyncError = ProtocolError::invalid_response("no records").into();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn error_display() {
        let err = SyncError::Server {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(err.to_string(), "server error 500: boom");
        assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    }
}
