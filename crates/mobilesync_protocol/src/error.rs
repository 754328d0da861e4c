//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building requests or parsing responses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A record could not be turned into a request.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A record has no `attributes.type` so its object type is unknown.
    #[error("record {reference} has no object type")]
    MissingObjectType {
        /// Id or reference id of the offending record.
        reference: String,
    },

    /// More requests than a batched encoding accepts.
    #[error("batch of {size} requests exceeds the maximum of {max}")]
    BatchTooLarge {
        /// Number of requests in the batch.
        size: usize,
        /// Maximum accepted by the encoding.
        max: usize,
    },

    /// Upserts in one collection request must share object type and external id field.
    #[error("upsert collection mixes object types or external id fields: {0}")]
    MixedUpsertCollection(String),

    /// A SOQL query could not be parsed or built.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A server payload did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A timestamp could not be parsed or formatted.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    /// Returns true if the error comes from caller configuration rather than
    /// from what the server sent back.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidRecord(_)
                | ProtocolError::MissingObjectType { .. }
                | ProtocolError::BatchTooLarge { .. }
                | ProtocolError::MixedUpsertCollection(_)
                | ProtocolError::InvalidQuery(_)
        )
    }
}
