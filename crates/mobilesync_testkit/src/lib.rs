//! # MobileSync Testkit
//!
//! Test utilities for MobileSync.
//!
//! This crate provides:
//! - Record builders, canned responses and seeded stores
//! - A fake REST server answering CRUD, composite, collection and query
//!   requests from memory
//! - Property-based test generators using proptest
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mobilesync_testkit::prelude::*;
//!
//! #[test]
//! fn uploads_new_accounts() {
//!     let harness = SyncHarness::new(&["accounts"]);
//!     harness.seed("accounts", vec![created("Account", json!({ "Name": "Acme" }))]);
//!     // ... run a sync-up and inspect harness.server
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_server;
pub mod fixtures;
pub mod generators;
pub mod soql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fake_server::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use serde_json::json;
}

pub use fake_server::*;
pub use fixtures::*;
pub use generators::*;

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
