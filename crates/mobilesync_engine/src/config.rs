//! Configuration for sync operations.

use serde::{Deserialize, Serialize};

/// Default REST API version.
pub const DEFAULT_API_VERSION: &str = "v60.0";
/// Default soup holding sync definitions.
pub const DEFAULT_SYNCS_SOUP: &str = "syncs_soup";

/// How a sync reconciles local changes with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeMode {
    /// Server data replaces local data; records deleted remotely may be
    /// recreated from local edits.
    #[default]
    Overwrite,
    /// Locally modified records are left alone.
    LeaveIfChanged,
}

/// Per-sync options persisted with the sync definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Fields to upload when a target has no list of its own.
    #[serde(default)]
    pub fieldlist: Vec<String>,
    /// Merge mode.
    #[serde(default)]
    pub merge_mode: MergeMode,
}

impl SyncOptions {
    /// Creates options with an empty field list and merge mode overwrite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the field list.
    pub fn with_fieldlist<I, S>(mut self, fieldlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fieldlist = fieldlist.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the merge mode.
    pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
        self.merge_mode = merge_mode;
        self
    }
}

/// Configuration for the sync runner.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST API version, e.g. `v60.0`.
    pub api_version: String,
    /// Soup holding sync definitions.
    pub syncs_soup: String,
}

impl SyncConfig {
    /// Creates a configuration for an API version.
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            syncs_soup: DEFAULT_SYNCS_SOUP.to_string(),
        }
    }

    /// Sets the soup holding sync definitions.
    pub fn with_syncs_soup(mut self, soup: impl Into<String>) -> Self {
        self.syncs_soup = soup.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_VERSION)
    }
}
