//! # MobileSync Engine
//!
//! Sync-up and sync-down targets plus the runner that drives them.
//!
//! This crate provides:
//! - Sync-up targets: single record, composite batch, sObject collection
//!   and parent/children trees
//! - Sync-down targets: SOQL, refresh, MRU, SOSL, metadata, layout,
//!   parent/children and briefcase
//! - A registry that rebuilds targets from their persisted configuration
//! - Persisted sync definitions and a sequential runner
//! - The [`RestClient`] transport seam
//!
//! ## Architecture
//!
//! Targets never own I/O. Each operation receives a [`SyncContext`] that
//! bundles the local store, the REST client and the API version. The
//! [`SyncRunner`] loads a [`SyncDefinition`], rebuilds its target through
//! the [`TargetRegistry`] and runs it page by page (down) or batch by batch
//! (up), persisting status and progress as it goes.
//!
//! ## Key Invariants
//!
//! - A batch never exceeds the target's maximum batch size
//! - Local changes from one batch are applied in one store transaction
//! - Records the server no longer has are re-run at most once
//! - Ghost cleanup never touches locally dirty records
//! - Stop requests are honoured at page and batch boundaries only

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod down;
mod error;
pub mod parent_children;
mod registry;
mod state;
pub mod target;
mod transport;
pub mod up;

pub use config::{MergeMode, SyncConfig, SyncOptions, DEFAULT_API_VERSION, DEFAULT_SYNCS_SOUP};
pub use down::{DownTarget, FetchCursor, FetchPage, SyncDownTarget};
pub use error::{SyncError, SyncResult};
pub use parent_children::{ChildrenInfo, ParentInfo, RelationshipType};
pub use registry::{
    DownFactory, TargetRegistry, UpFactory, CUSTOM_TYPE, DOWN_DISCRIMINATOR, UP_DISCRIMINATOR,
};
pub use state::{SyncDefinition, SyncDirection, SyncRunner, SyncStats, SyncStatus};
pub use target::{QueryPage, SyncContext, TargetFields};
pub use transport::{MockRestClient, RestClient};
pub use up::{SyncUpTarget, UpTarget, UpTargetConfig};
