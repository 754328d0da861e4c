//! In-memory soup store.

use crate::error::{StoreError, StoreResult};
use crate::query::{Filter, QuerySpec};
use crate::store::{
    entry_id, EntryId, IndexSpec, LocalStore, StoreReader, StoreWriter, TransactionFn,
    SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE,
};
use mobilesync_protocol::Record;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Soup {
    indexes: Vec<IndexSpec>,
    entries: BTreeMap<EntryId, Record>,
}

/// Soups plus the entry id sequence; cloned to stage a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SoupSet {
    soups: BTreeMap<String, Soup>,
    last_entry_id: EntryId,
}

impl SoupSet {
    fn soup(&self, name: &str) -> StoreResult<&Soup> {
        self.soups
            .get(name)
            .ok_or_else(|| StoreError::SoupNotFound(name.to_string()))
    }

    fn soup_mut(&mut self, name: &str) -> StoreResult<&mut Soup> {
        self.soups
            .get_mut(name)
            .ok_or_else(|| StoreError::SoupNotFound(name.to_string()))
    }

    fn stamp(mut record: Record, entry_id: EntryId) -> Record {
        record.insert(SOUP_ENTRY_ID, entry_id);
        record.insert(
            SOUP_LAST_MODIFIED_DATE,
            chrono::Utc::now().timestamp_millis(),
        );
        record
    }
}

impl StoreReader for SoupSet {
    fn has_soup(&self, soup: &str) -> bool {
        self.soups.contains_key(soup)
    }

    fn index_specs(&self, soup: &str) -> StoreResult<Vec<IndexSpec>> {
        Ok(self.soup(soup)?.indexes.clone())
    }

    fn query(&self, soup: &str, spec: &QuerySpec, page_index: usize) -> StoreResult<Vec<Record>> {
        let mut matching: Vec<&Record> = self
            .soup(soup)?
            .entries
            .values()
            .filter(|e| spec.filter.matches(e))
            .collect();
        // Stable sort keeps entry id order among equal keys.
        matching.sort_by(|a, b| spec.compare(a, b));
        let page_size = spec.page_size.max(1);
        Ok(matching
            .into_iter()
            .skip(page_index.saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect())
    }

    fn count(&self, soup: &str, filter: &Filter) -> StoreResult<usize> {
        Ok(self
            .soup(soup)?
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .count())
    }

    fn retrieve(&self, soup: &str, entry_ids: &[EntryId]) -> StoreResult<Vec<Record>> {
        let soup = self.soup(soup)?;
        Ok(entry_ids
            .iter()
            .filter_map(|id| soup.entries.get(id).cloned())
            .collect())
    }
}

impl StoreWriter for SoupSet {
    fn upsert(
        &mut self,
        soup_name: &str,
        record: Record,
        external_id_path: Option<&str>,
    ) -> StoreResult<Record> {
        let soup = self.soup(soup_name)?;
        let existing = match entry_id(&record) {
            Some(id) if soup.entries.contains_key(&id) => Some(id),
            Some(id) => {
                return Err(StoreError::EntryNotFound {
                    soup: soup_name.to_string(),
                    entry_id: id,
                })
            }
            None => match external_id_path.and_then(|p| record.project(p).map(|v| (p, v))) {
                Some((path, value)) => {
                    let matches: Vec<EntryId> = soup
                        .entries
                        .iter()
                        .filter(|(_, e)| e.project(path) == Some(value))
                        .map(|(id, _)| *id)
                        .collect();
                    if matches.len() > 1 {
                        return Err(StoreError::DuplicateExternalId {
                            soup: soup_name.to_string(),
                            path: path.to_string(),
                            value: value.to_string(),
                            count: matches.len(),
                        });
                    }
                    matches.first().copied()
                }
                None => None,
            },
        };
        let id = match existing {
            Some(id) => id,
            None => {
                self.last_entry_id += 1;
                self.last_entry_id
            }
        };
        let stored = Self::stamp(record, id);
        self.soup_mut(soup_name)?.entries.insert(id, stored.clone());
        Ok(stored)
    }

    fn update(
        &mut self,
        soup_name: &str,
        record: Record,
        entry_id: EntryId,
    ) -> StoreResult<Record> {
        let soup = self.soup_mut(soup_name)?;
        if !soup.entries.contains_key(&entry_id) {
            return Err(StoreError::EntryNotFound {
                soup: soup_name.to_string(),
                entry_id,
            });
        }
        let stored = Self::stamp(record, entry_id);
        soup.entries.insert(entry_id, stored.clone());
        Ok(stored)
    }

    fn delete(&mut self, soup: &str, entry_ids: &[EntryId]) -> StoreResult<()> {
        let soup = self.soup_mut(soup)?;
        for id in entry_ids {
            soup.entries.remove(id);
        }
        Ok(())
    }

    fn delete_by_query(&mut self, soup: &str, filter: &Filter) -> StoreResult<usize> {
        let soup = self.soup_mut(soup)?;
        let before = soup.entries.len();
        soup.entries.retain(|_, e| !filter.matches(e));
        Ok(before - soup.entries.len())
    }
}

/// An in-memory local store.
///
/// Suitable for tests and for apps that persist through snapshots. Readers
/// share the lock; a transaction holds it exclusively while it runs against
/// a staged copy, so a page of writes becomes visible all at once.
///
/// # Example
///
/// ```rust
/// use mobilesync_protocol::Record;
/// use mobilesync_store::{IndexSpec, LocalStore, MemoryStore, QuerySpec, StoreReader};
///
/// let store = MemoryStore::new();
/// store.register_soup("accounts", &[IndexSpec::string("Id")]).unwrap();
/// store.upsert_one("accounts", Record::new().with("Id", "001"), Some("Id")).unwrap();
/// assert_eq!(store.query_all("accounts", &QuerySpec::all()).unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    connection: RwLock<SoupSet>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes every soup to a JSON file.
    ///
    /// The snapshot is written next to `path` and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_snapshot(&self, path: &Path) -> StoreResult<()> {
        let bytes = serde_json::to_vec(&*self.connection.read())?;
        let staging = path.with_extension("tmp");
        {
            let mut file = File::create(&staging)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&staging, path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved store snapshot");
        Ok(())
    }

    /// Opens a store from a snapshot written by [`MemoryStore::save_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn load_snapshot(path: &Path) -> StoreResult<Self> {
        let set: SoupSet = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        debug!(path = %path.display(), soups = set.soups.len(), "loaded store snapshot");
        Ok(Self {
            connection: RwLock::new(set),
        })
    }
}

impl StoreReader for MemoryStore {
    fn has_soup(&self, soup: &str) -> bool {
        self.connection.read().has_soup(soup)
    }

    fn index_specs(&self, soup: &str) -> StoreResult<Vec<IndexSpec>> {
        self.connection.read().index_specs(soup)
    }

    fn query(&self, soup: &str, spec: &QuerySpec, page_index: usize) -> StoreResult<Vec<Record>> {
        self.connection.read().query(soup, spec, page_index)
    }

    fn count(&self, soup: &str, filter: &Filter) -> StoreResult<usize> {
        self.connection.read().count(soup, filter)
    }

    fn retrieve(&self, soup: &str, entry_ids: &[EntryId]) -> StoreResult<Vec<Record>> {
        self.connection.read().retrieve(soup, entry_ids)
    }
}

impl LocalStore for MemoryStore {
    fn register_soup(&self, soup: &str, indexes: &[IndexSpec]) -> StoreResult<()> {
        if soup.trim().is_empty() {
            return Err(StoreError::InvalidSoup("empty soup name".into()));
        }
        let mut connection = self.connection.write();
        let entry = connection.soups.entry(soup.to_string()).or_default();
        for spec in indexes {
            if !entry.indexes.iter().any(|s| s.path == spec.path) {
                entry.indexes.push(spec.clone());
            }
        }
        Ok(())
    }

    fn drop_soup(&self, soup: &str) -> StoreResult<()> {
        self.connection
            .write()
            .soups
            .remove(soup)
            .map(|_| ())
            .ok_or_else(|| StoreError::SoupNotFound(soup.to_string()))
    }

    fn transaction(&self, f: &mut TransactionFn<'_>) -> StoreResult<()> {
        let mut connection = self.connection.write();
        let mut staged = connection.clone();
        f(&mut staged)?;
        *connection = staged;
        Ok(())
    }
}
