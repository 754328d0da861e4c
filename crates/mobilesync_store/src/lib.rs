//! # MobileSync Store
//!
//! Local store facade consumed by the sync engine.
//!
//! Records live in named soups. Each stored record carries a store assigned
//! `_soupEntryId` and `_soupLastModifiedDate`. The sync engine only talks to
//! the [`LocalStore`] trait: paged predicate queries, counts, index
//! introspection, and writes grouped in transactions.
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - In-memory soups with JSON snapshot persistence

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod query;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use query::{Filter, QuerySpec, SortOrder, DEFAULT_PAGE_SIZE};
pub use store::{
    entry_id, EntryId, IndexSpec, IndexType, LocalStore, StoreReader, StoreWriter, TransactionFn,
    SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE,
};
