//! Local store facade.

use crate::error::StoreResult;
use crate::query::{Filter, QuerySpec};
use mobilesync_protocol::Record;
use serde::{Deserialize, Serialize};

/// Field holding the store assigned entry id.
pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
/// Field holding the time an entry was last written, in epoch milliseconds.
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";

/// Store assigned id of a soup entry.
pub type EntryId = i64;

/// Kind of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// String values.
    String,
    /// Integer values.
    Integer,
    /// Floating point values.
    Floating,
    /// JSON extracted values.
    Json1,
    /// Full text search.
    FullText,
}

/// Index declared on a soup path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed path.
    pub path: String,
    /// Index kind.
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

impl IndexSpec {
    /// Creates an index spec.
    pub fn new(path: impl Into<String>, index_type: IndexType) -> Self {
        Self {
            path: path.into(),
            index_type,
        }
    }

    /// String index on `path`.
    pub fn string(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::String)
    }

    /// Integer index on `path`.
    pub fn integer(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Integer)
    }

    /// JSON index on `path`.
    pub fn json1(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Json1)
    }
}

/// Read access to soups.
pub trait StoreReader {
    /// Returns true if the soup is registered.
    fn has_soup(&self, soup: &str) -> bool;

    /// Index specs of a soup.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn index_specs(&self, soup: &str) -> StoreResult<Vec<IndexSpec>>;

    /// Returns true if the soup has an index on `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn has_index(&self, soup: &str, path: &str) -> StoreResult<bool> {
        Ok(self.index_specs(soup)?.iter().any(|spec| spec.path == path))
    }

    /// Returns one page of matching entries.
    ///
    /// Pages are numbered from zero. Entries with equal order keys come back
    /// in entry id order so paging is stable.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn query(&self, soup: &str, spec: &QuerySpec, page_index: usize) -> StoreResult<Vec<Record>>;

    /// Returns every matching entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn query_all(&self, soup: &str, spec: &QuerySpec) -> StoreResult<Vec<Record>> {
        let mut all = Vec::new();
        let mut page_index = 0;
        loop {
            let page = self.query(soup, spec, page_index)?;
            let last = page.len() < spec.page_size;
            all.extend(page);
            if last {
                return Ok(all);
            }
            page_index += 1;
        }
    }

    /// Number of matching entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn count(&self, soup: &str, filter: &Filter) -> StoreResult<usize>;

    /// Entries by id; unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn retrieve(&self, soup: &str, entry_ids: &[EntryId]) -> StoreResult<Vec<Record>>;
}

/// Write access to soups, available inside a transaction.
pub trait StoreWriter: StoreReader {
    /// Inserts or replaces an entry and returns it as stored.
    ///
    /// An entry is replaced when the record carries the id of an existing
    /// entry, or else when `external_id_path` is given and exactly one entry
    /// has the same value at that path. Otherwise a new entry is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist, if the record carries an
    /// unknown entry id, or if several entries match the external id.
    fn upsert(
        &mut self,
        soup: &str,
        record: Record,
        external_id_path: Option<&str>,
    ) -> StoreResult<Record>;

    /// Replaces the entry with the given id.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup or the entry does not exist.
    fn update(&mut self, soup: &str, record: Record, entry_id: EntryId) -> StoreResult<Record>;

    /// Deletes entries by id; unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn delete(&mut self, soup: &str, entry_ids: &[EntryId]) -> StoreResult<()>;

    /// Deletes every matching entry and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn delete_by_query(&mut self, soup: &str, filter: &Filter) -> StoreResult<usize>;
}

/// Closure run inside [`LocalStore::transaction`].
pub type TransactionFn<'a> = dyn FnMut(&mut dyn StoreWriter) -> StoreResult<()> + 'a;

/// A shared local store.
///
/// All writes go through [`LocalStore::transaction`]: the closure's writes
/// become visible together when it returns `Ok` and are discarded when it
/// returns `Err`. The closure must use the writer it is given rather than
/// the store itself.
pub trait LocalStore: StoreReader + Send + Sync {
    /// Registers a soup, or adds missing index specs to an existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup name is empty.
    fn register_soup(&self, soup: &str, indexes: &[IndexSpec]) -> StoreResult<()>;

    /// Removes a soup and its entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the soup does not exist.
    fn drop_soup(&self, soup: &str) -> StoreResult<()>;

    /// Runs `f` atomically.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, in which case nothing was written.
    fn transaction(&self, f: &mut TransactionFn<'_>) -> StoreResult<()>;

    /// Upserts one record in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`StoreWriter::upsert`].
    fn upsert_one(
        &self,
        soup: &str,
        record: Record,
        external_id_path: Option<&str>,
    ) -> StoreResult<Record> {
        let mut pending = Some(record);
        let mut saved = None;
        self.transaction(&mut |writer| {
            if let Some(record) = pending.take() {
                saved = Some(writer.upsert(soup, record, external_id_path)?);
            }
            Ok(())
        })?;
        Ok(saved.unwrap_or_default())
    }

    /// Deletes entries in their own transaction.
    ///
    /// # Errors
    ///
    /// See [`StoreWriter::delete`].
    fn delete_entries(&self, soup: &str, entry_ids: &[EntryId]) -> StoreResult<()> {
        self.transaction(&mut |writer| writer.delete(soup, entry_ids))
    }
}

/// Entry id of a stored record.
pub fn entry_id(record: &Record) -> Option<EntryId> {
    record.get(SOUP_ENTRY_ID).and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_id_accepts_numbers_and_strings() {
        let rec = Record::new().with(SOUP_ENTRY_ID, 12);
        assert_eq!(entry_id(&rec), Some(12));
        let rec = Record::new().with(SOUP_ENTRY_ID, "13");
        assert_eq!(entry_id(&rec), Some(13));
        assert_eq!(entry_id(&Record::new()), None);
    }

    #[test]
    fn index_spec_serialization() {
        let spec = IndexSpec::string("Id");
        assert_eq!(serde_json::to_value(&spec).unwrap(), json!({ "path": "Id", "type": "string" }));
        let back: IndexSpec =
            serde_json::from_value(json!({ "path": "n", "type": "integer" })).unwrap();
        assert_eq!(back, IndexSpec::integer("n"));
    }
}
