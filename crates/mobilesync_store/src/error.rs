//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The soup was never registered.
    #[error("soup not found: {0}")]
    SoupNotFound(String),

    /// No entry with that id exists in the soup.
    #[error("entry {entry_id} not found in soup {soup}")]
    EntryNotFound {
        /// Soup name.
        soup: String,
        /// Missing entry id.
        entry_id: i64,
    },

    /// More than one entry carries the external id used for an upsert.
    #[error("{count} entries in soup {soup} match {path} = {value}")]
    DuplicateExternalId {
        /// Soup name.
        soup: String,
        /// External id path.
        path: String,
        /// External id value.
        value: String,
        /// Number of matching entries.
        count: usize,
    },

    /// A soup name or index spec was rejected.
    #[error("invalid soup definition: {0}")]
    InvalidSoup(String),

    /// An I/O error occurred while reading or writing a snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Json(#[from] serde_json::Error),
}
