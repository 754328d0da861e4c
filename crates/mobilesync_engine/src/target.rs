//! Shared plumbing for sync targets.
//!
//! Targets never inherit behavior from each other. Everything they have in
//! common (talking to the server, reading dirty and non-dirty ids, saving
//! cleaned records, ghost set algebra) lives here as free functions.

use crate::error::{SyncError, SyncResult};
use crate::transport::RestClient;
use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE, LOCAL, SYNC_ID};
use mobilesync_protocol::{timestamp, Record, RestRequest, RestResponse};
use mobilesync_store::{entry_id, EntryId, Filter, LocalStore, QuerySpec, StoreReader, StoreWriter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Store, client and API version used by targets while a sync runs.
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
    /// Local store.
    pub store: &'a dyn LocalStore,
    /// REST client.
    pub client: &'a dyn RestClient,
    /// REST API version.
    pub api_version: &'a str,
}

impl fmt::Debug for SyncContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl<'a> SyncContext<'a> {
    /// Creates a context.
    pub fn new(
        store: &'a dyn LocalStore,
        client: &'a dyn RestClient,
        api_version: &'a str,
    ) -> Self {
        Self {
            store,
            client,
            api_version,
        }
    }

    /// Sends a request, turning a non-success status into [`SyncError::Server`].
    pub fn send(&self, request: &RestRequest) -> SyncResult<RestResponse> {
        let response = self.client.send(request)?;
        if !response.is_success() {
            return Err(SyncError::server(&response));
        }
        Ok(response)
    }

    /// Sends a request and returns whatever the server answered.
    pub fn send_unchecked(&self, request: &RestRequest) -> SyncResult<RestResponse> {
        self.client.send(request)
    }

    /// Runs a SOQL query and returns its first page.
    pub fn query(&self, soql: &str, batch_size: Option<usize>) -> SyncResult<QueryPage> {
        let response = self.send(&RestRequest::query(self.api_version, soql, batch_size))?;
        QueryPage::from_response(&response)
    }

    /// Follows a `nextRecordsUrl`.
    pub fn query_next(&self, next_records_url: &str) -> SyncResult<QueryPage> {
        let response = self.send(&RestRequest::query_next(next_records_url))?;
        QueryPage::from_response(&response)
    }

    /// Runs a SOQL query and follows every page.
    pub fn query_all(&self, soql: &str) -> SyncResult<Vec<Record>> {
        let mut page = self.query(soql, None)?;
        let mut records = std::mem::take(&mut page.records);
        while let Some(url) = page.next_records_url.take() {
            page = self.query_next(&url)?;
            records.append(&mut page.records);
        }
        Ok(records)
    }
}

/// One page of a SOQL query response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPage {
    /// Records in this page.
    pub records: Vec<Record>,
    /// Total number of matching records.
    pub total_size: i64,
    /// URL of the next page, if any.
    pub next_records_url: Option<String>,
}

impl QueryPage {
    /// Parses a query response body.
    pub fn from_response(response: &RestResponse) -> SyncResult<Self> {
        let body = response.as_object()?;
        let records = body
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::Protocol("query response without records".into()))?
            .iter()
            .filter_map(|v| Record::from_value(v.clone()))
            .collect::<Vec<_>>();
        let total_size = body
            .get("totalSize")
            .and_then(Value::as_i64)
            .unwrap_or(records.len() as i64);
        let next_records_url = body
            .get("nextRecordsUrl")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(Self {
            records,
            total_size,
            next_records_url,
        })
    }
}

fn default_id_field_name() -> String {
    ID.to_string()
}

fn default_modification_date_field_name() -> String {
    LAST_MODIFIED_DATE.to_string()
}

/// Id and modification date field names of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFields {
    /// Id field name.
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    /// Modification date field name.
    #[serde(default = "default_modification_date_field_name")]
    pub modification_date_field_name: String,
}

impl Default for TargetFields {
    fn default() -> Self {
        Self {
            id_field_name: default_id_field_name(),
            modification_date_field_name: default_modification_date_field_name(),
        }
    }
}

impl TargetFields {
    /// Creates field names.
    pub fn new(
        id_field_name: impl Into<String>,
        modification_date_field_name: impl Into<String>,
    ) -> Self {
        Self {
            id_field_name: id_field_name.into(),
            modification_date_field_name: modification_date_field_name.into(),
        }
    }
}

/// Matches records with a pending local mutation.
pub fn dirty_filter() -> Filter {
    Filter::eq(LOCAL, true)
}

/// Restricts a query to records written by `sync_id`, when the soup indexes
/// the sync id. Without the index every record is in scope.
pub fn sync_scope(store: &dyn LocalStore, soup: &str, sync_id: Option<i64>) -> SyncResult<Filter> {
    Ok(match sync_id {
        Some(id) if store.has_index(soup, SYNC_ID)? => Filter::eq(SYNC_ID, id),
        _ => Filter::All,
    })
}

/// Ids found in the id field of `records`.
pub fn record_ids<'r, I>(records: I, id_field_name: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'r Record>,
{
    records
        .into_iter()
        .filter_map(|r| r.id(id_field_name).map(str::to_string))
        .collect()
}

/// Ids of locally modified records.
pub fn dirty_record_ids(
    store: &dyn LocalStore,
    soup: &str,
    id_field_name: &str,
) -> SyncResult<BTreeSet<String>> {
    let records = store.query_all(soup, &QuerySpec::matching(dirty_filter()))?;
    Ok(record_ids(&records, id_field_name))
}

/// Ids of unmodified records matching `scope`.
pub fn non_dirty_record_ids(
    store: &dyn LocalStore,
    soup: &str,
    id_field_name: &str,
    scope: Filter,
) -> SyncResult<BTreeSet<String>> {
    let filter = dirty_filter().not().and(scope);
    let records = store.query_all(soup, &QuerySpec::matching(filter))?;
    Ok(record_ids(&records, id_field_name))
}

/// Entry ids of locally modified records, oldest entry first.
pub fn dirty_entry_ids(store: &dyn LocalStore, soup: &str) -> SyncResult<Vec<EntryId>> {
    let records = store.query_all(soup, &QuerySpec::matching(dirty_filter()))?;
    Ok(records.iter().filter_map(entry_id).collect())
}

/// Local ids absent from the remote set.
pub fn ghost_ids(local: &BTreeSet<String>, remote: &BTreeSet<String>) -> BTreeSet<String> {
    local.difference(remote).cloned().collect()
}

/// Deletes records by id and returns how many were removed.
pub fn delete_records_by_id(
    store: &dyn LocalStore,
    soup: &str,
    id_field_name: &str,
    ids: &BTreeSet<String>,
) -> SyncResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let filter = Filter::is_in(id_field_name, ids.iter().cloned());
    let mut removed = 0;
    store.transaction(&mut |writer| {
        removed = writer.delete_by_query(soup, &filter)?;
        Ok(())
    })?;
    debug!(soup, removed, "deleted records");
    Ok(removed)
}

/// Cleans a server record and tags it with the sync that fetched it.
pub fn prepare_for_save(record: Record, sync_id: Option<i64>) -> Record {
    let cleaned = record.cleaned();
    match sync_id {
        Some(id) => cleaned.with(SYNC_ID, id),
        None => cleaned,
    }
}

/// Upserts one server record matched on its id field.
pub fn save_record(
    writer: &mut dyn StoreWriter,
    soup: &str,
    id_field_name: &str,
    record: Record,
    sync_id: Option<i64>,
) -> SyncResult<Record> {
    Ok(writer.upsert(soup, prepare_for_save(record, sync_id), Some(id_field_name))?)
}

/// Saves a page of server records in one transaction.
pub fn save_records(
    store: &dyn LocalStore,
    soup: &str,
    id_field_name: &str,
    records: Vec<Record>,
    sync_id: Option<i64>,
) -> SyncResult<usize> {
    let count = records.len();
    let mut pending = Some(records);
    store.transaction(&mut |writer| {
        for record in pending.take().unwrap_or_default() {
            writer.upsert(soup, prepare_for_save(record, sync_id), Some(id_field_name))?;
        }
        Ok(())
    })?;
    debug!(soup, count, "saved records");
    Ok(count)
}

/// Latest modification time among `records`, or -1 when none has one.
pub fn latest_modification_timestamp<'r, I>(records: I, modification_date_field_name: &str) -> i64
where
    I: IntoIterator<Item = &'r Record>,
{
    records
        .into_iter()
        .filter_map(|r| r.get_str(modification_date_field_name))
        .filter_map(|ts| timestamp::parse_millis(ts).ok())
        .max()
        .unwrap_or(-1)
}

/// What reconciliation decided for one local record.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// Write the record back.
    Save(Record),
    /// Remove the record.
    Purge(Record),
}

/// Applies reconciliation results in one transaction.
///
/// Records are addressed by entry id, falling back to the id field for
/// records that never reached the store.
pub fn apply_changes(
    store: &dyn LocalStore,
    soup: &str,
    id_field_name: &str,
    changes: Vec<LocalChange>,
) -> SyncResult<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let mut pending = Some(changes);
    store.transaction(&mut |writer| {
        for change in pending.take().unwrap_or_default() {
            apply_change(writer, soup, id_field_name, change)?;
        }
        Ok(())
    })?;
    Ok(())
}

pub(crate) fn apply_change(
    writer: &mut dyn StoreWriter,
    soup: &str,
    id_field_name: &str,
    change: LocalChange,
) -> mobilesync_store::StoreResult<()> {
    match change {
        LocalChange::Save(record) => {
            writer.upsert(soup, record, Some(id_field_name))?;
        }
        LocalChange::Purge(record) => match (entry_id(&record), record.id(id_field_name)) {
            (Some(id), _) => writer.delete(soup, &[id])?,
            (None, Some(id)) => {
                writer.delete_by_query(soup, &Filter::eq(id_field_name, id))?;
            }
            (None, None) => {}
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilesync_protocol::DirtyState;
    use mobilesync_store::{IndexSpec, MemoryStore};
    use proptest::prelude::*;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .register_soup("accounts", &[IndexSpec::string(ID), IndexSpec::integer(SYNC_ID)])
            .unwrap();
        store
    }

    fn account(id: &str) -> Record {
        Record::new().with_object_type("Account").with(ID, id)
    }

    #[test]
    fn query_page_parsing() {
        let response = RestResponse::new(
            200,
            json!({ "totalSize": 3, "done": false, "nextRecordsUrl": "/next",
                    "records": [{ "Id": "1" }, { "Id": "2" }] }),
        );
        let page = QueryPage::from_response(&response).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_size, 3);
        assert_eq!(page.next_records_url.as_deref(), Some("/next"));

        let bad = RestResponse::new(200, json!({ "totalSize": 0 }));
        assert!(QueryPage::from_response(&bad).is_err());
    }

    #[test]
    fn dirty_and_non_dirty_ids() {
        let store = store();
        save_records(&store, "accounts", ID, vec![account("A"), account("B")], Some(1)).unwrap();
        let updated = DirtyState { updated: true, ..DirtyState::CLEAN };
        let dirty = account("C").with_dirty_state(updated);
        store.upsert_one("accounts", dirty, Some(ID)).unwrap();

        let dirty_ids = dirty_record_ids(&store, "accounts", ID).unwrap();
        assert_eq!(dirty_ids.into_iter().collect::<Vec<_>>(), vec!["C"]);
        let clean = non_dirty_record_ids(&store, "accounts", ID, Filter::All).unwrap();
        assert_eq!(clean.len(), 2);
        assert_eq!(dirty_entry_ids(&store, "accounts").unwrap(), vec![3]);
    }

    #[test]
    fn sync_scope_needs_index() {
        let store = store();
        assert_eq!(sync_scope(&store, "accounts", Some(4)).unwrap(), Filter::eq(SYNC_ID, 4));
        assert_eq!(sync_scope(&store, "accounts", None).unwrap(), Filter::All);
        store.register_soup("plain", &[]).unwrap();
        assert_eq!(sync_scope(&store, "plain", Some(4)).unwrap(), Filter::All);
    }

    #[test]
    fn saved_records_are_clean_and_tagged() {
        let store = store();
        save_records(&store, "accounts", ID, vec![account("A")], Some(9)).unwrap();
        let saved = store.query_all("accounts", &QuerySpec::all()).unwrap();
        assert!(saved[0].is_clean());
        assert_eq!(saved[0].get(SYNC_ID), Some(&json!(9)));

        // Same id replaces, never duplicates.
        let renamed = account("A").with("Name", "x");
        save_records(&store, "accounts", ID, vec![renamed], Some(9)).unwrap();
        assert_eq!(store.count("accounts", &Filter::All).unwrap(), 1);
    }

    #[test]
    fn latest_timestamp() {
        let records = vec![
            account("A").with(LAST_MODIFIED_DATE, "2024-03-01T00:00:00.000Z"),
            account("B").with(LAST_MODIFIED_DATE, "2024-03-02T00:00:00.000+0000"),
            account("C"),
        ];
        assert_eq!(latest_modification_timestamp(&records, LAST_MODIFIED_DATE), 1_709_337_600_000);
        assert_eq!(latest_modification_timestamp(&[account("D")], LAST_MODIFIED_DATE), -1);
    }

    #[test]
    fn apply_changes_saves_and_purges() {
        let store = store();
        save_records(&store, "accounts", ID, vec![account("A"), account("B")], None).unwrap();
        let stored = store.query_all("accounts", &QuerySpec::all()).unwrap();
        let changes = vec![
            LocalChange::Purge(stored[0].clone()),
            LocalChange::Save(stored[1].clone().with_last_error("boom")),
            LocalChange::Purge(account("never-stored")),
        ];
        apply_changes(&store, "accounts", ID, changes).unwrap();
        let left = store.query_all("accounts", &QuerySpec::all()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].last_error(), Some("boom"));
    }

    #[test]
    fn ghost_cleanup_spares_dirty_records() {
        let store = store();
        save_records(&store, "accounts", ID, vec![account("B"), account("C")], None).unwrap();
        let updated = DirtyState { updated: true, ..DirtyState::CLEAN };
        let dirty_a = account("A").with_dirty_state(updated);
        store.upsert_one("accounts", dirty_a, Some(ID)).unwrap();

        let local = non_dirty_record_ids(&store, "accounts", ID, Filter::All).unwrap();
        let remote: BTreeSet<String> = ["C".to_string()].into();
        let ghosts = ghost_ids(&local, &remote);
        assert_eq!(ghosts.iter().collect::<Vec<_>>(), vec!["B"]);
        delete_records_by_id(&store, "accounts", ID, &ghosts).unwrap();
        let left = record_ids(&store.query_all("accounts", &QuerySpec::all()).unwrap(), ID);
        assert_eq!(left.into_iter().collect::<Vec<_>>(), vec!["A", "C"]);
    }

    proptest! {
        #[test]
        fn ghosts_are_exactly_the_set_difference(
            local in prop::collection::btree_set("[A-F]", 0..6),
            remote in prop::collection::btree_set("[A-F]", 0..6),
        ) {
            let ghosts = ghost_ids(&local, &remote);
            for id in &ghosts {
                prop_assert!(local.contains(id) && !remote.contains(id));
            }
            for id in &local {
                prop_assert_eq!(ghosts.contains(id), !remote.contains(id));
            }
        }
    }
}
