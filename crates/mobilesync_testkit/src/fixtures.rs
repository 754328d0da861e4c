//! Test fixtures and store helpers.
//!
//! Provides record builders, canned server responses, seeded stores and a
//! [`SyncHarness`] wiring a [`MemoryStore`] and a [`FakeServer`] to a
//! [`SyncRunner`].

use crate::fake_server::FakeServer;
use mobilesync_engine::{MockRestClient, RestClient, SyncConfig, SyncRunner};
use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
use mobilesync_protocol::{create_local_id, DirtyState, Record, RestResponse};
use mobilesync_store::{
    Filter, IndexSpec, LocalStore, MemoryStore, QuerySpec, SortOrder, StoreReader, SOUP_ENTRY_ID,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// A clean `Account` as fetched from the server.
pub fn account(id: &str, name: &str) -> Record {
    Record::new()
        .with_object_type("Account")
        .with(ID, id)
        .with("Name", name)
        .with(LAST_MODIFIED_DATE, "2024-01-01T00:00:00.000Z")
        .cleaned()
}

/// A record created locally, with a local id and the created flag set.
pub fn created(object_type: &str, fields: Value) -> Record {
    let mut record = Record::from_value(fields).unwrap_or_default();
    record.insert(ID, create_local_id());
    record
        .with_object_type(object_type)
        .with_dirty_state(DirtyState {
            created: true,
            ..DirtyState::CLEAN
        })
}

/// `record` with the updated flag set and `fields` applied.
pub fn updated(record: Record, fields: Value) -> Record {
    let mut record = record;
    if let Value::Object(fields) = fields {
        for (field, value) in fields {
            record.insert(field, value);
        }
    }
    let state = record.dirty_state().touched();
    record.with_dirty_state(state)
}

/// `record` with the deleted flag set.
pub fn deleted(record: Record) -> Record {
    let state = DirtyState {
        deleted: true,
        ..record.dirty_state()
    };
    record.with_dirty_state(state)
}

/// An in-memory store with `soups` registered and indexed on `Id`.
pub fn memory_store(soups: &[&str]) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for soup in soups {
        store
            .register_soup(soup, &[IndexSpec::string(ID)])
            .expect("Failed to register soup");
    }
    Arc::new(store)
}

/// Saves `records` into `soup` and returns them as stored.
pub fn seed(store: &dyn LocalStore, soup: &str, records: Vec<Record>) -> Vec<Record> {
    records
        .into_iter()
        .map(|record| {
            store
                .upsert_one(soup, record, None)
                .expect("Failed to seed record")
        })
        .collect()
}

/// Every record of `soup` in insertion order.
pub fn soup_records(store: &dyn LocalStore, soup: &str) -> Vec<Record> {
    store
        .query_all(soup, &QuerySpec::all().order_by(SOUP_ENTRY_ID, SortOrder::Ascending))
        .expect("Failed to query soup")
}

/// Record of `soup` whose `Id` is `id`.
pub fn find_by_id(store: &dyn LocalStore, soup: &str, id: &str) -> Option<Record> {
    store
        .query_all(soup, &QuerySpec::matching(Filter::eq(ID, id)))
        .expect("Failed to query soup")
        .into_iter()
        .next()
}

/// Number of dirty records in `soup`.
pub fn dirty_count(store: &dyn LocalStore, soup: &str) -> usize {
    soup_records(store, soup)
        .iter()
        .filter(|r| r.is_dirty())
        .count()
}

/// A query response body holding `records`.
pub fn query_response(records: &[Record], next_records_url: Option<&str>) -> RestResponse {
    let mut body = json!({
        "totalSize": records.len(),
        "done": next_records_url.is_none(),
        "records": records.iter().map(|r| r.clone().into_value()).collect::<Vec<_>>(),
    });
    if let Some(url) = next_records_url {
        body["nextRecordsUrl"] = Value::from(url);
    }
    RestResponse::new(200, body)
}

/// A composite response from `(reference id, status, body)` triples.
pub fn composite_response(subs: &[(&str, u16, Value)]) -> RestResponse {
    let subs: Vec<Value> = subs
        .iter()
        .map(|(reference_id, status, body)| {
            json!({
                "body": body,
                "httpHeaders": {},
                "httpStatusCode": status,
                "referenceId": reference_id,
            })
        })
        .collect();
    RestResponse::new(200, json!({ "compositeResponse": subs }))
}

/// A client answering with `responses` in order, then with 500.
pub fn scripted(responses: Vec<RestResponse>) -> MockRestClient {
    let queue = Mutex::new(VecDeque::from(responses));
    MockRestClient::new(move |_| {
        queue.lock().pop_front().unwrap_or_else(|| {
            RestResponse::new(
                500,
                json!([{ "errorCode": "UNSCRIPTED", "message": "no response left" }]),
            )
        })
    })
}

/// A store, a fake server and a runner wired together.
pub struct SyncHarness {
    /// The local store.
    pub store: Arc<MemoryStore>,
    /// The fake server.
    pub server: Arc<FakeServer>,
    /// The runner under test.
    pub runner: SyncRunner,
}

impl SyncHarness {
    /// Creates a harness with `soups` registered and an empty server.
    pub fn new(soups: &[&str]) -> Self {
        Self::with_server(FakeServer::new(), soups)
    }

    /// Creates a harness around `server`.
    pub fn with_server(server: FakeServer, soups: &[&str]) -> Self {
        let store = memory_store(soups);
        let server = Arc::new(server);
        let runner = SyncRunner::new(
            SyncConfig::default(),
            store.clone() as Arc<dyn LocalStore>,
            server.clone() as Arc<dyn RestClient>,
        )
        .expect("Failed to create runner");
        Self {
            store,
            server,
            runner,
        }
    }

    /// Every record of `soup` in insertion order.
    pub fn records(&self, soup: &str) -> Vec<Record> {
        soup_records(self.store.as_ref(), soup)
    }

    /// Saves `records` into `soup`.
    pub fn seed(&self, soup: &str, records: Vec<Record>) -> Vec<Record> {
        seed(self.store.as_ref(), soup, records)
    }

    /// Record of `soup` whose `Id` is `id`.
    pub fn find(&self, soup: &str, id: &str) -> Option<Record> {
        find_by_id(self.store.as_ref(), soup, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilesync_protocol::is_local_id;

    #[test]
    fn created_records_are_dirty_with_local_ids() {
        let record = created("Account", json!({ "Name": "Acme" }));
        assert!(record.is_locally_created());
        assert!(is_local_id(record.id(ID).unwrap()));
        assert_eq!(record.object_type(), Some("Account"));
    }

    #[test]
    fn updated_and_deleted_keep_existing_flags() {
        let record = updated(account("001", "Acme"), json!({ "Name": "Acme 2" }));
        assert_eq!(record.get_str("Name"), Some("Acme 2"));
        let record = deleted(record);
        let state = record.dirty_state();
        assert!(state.updated && state.deleted && !state.created);
    }

    #[test]
    fn scripted_client_runs_out() {
        use mobilesync_engine::RestClient;
        use mobilesync_protocol::RestRequest;

        let client = scripted(vec![RestResponse::new(200, json!({}))]);
        let request = RestRequest::describe("v60.0", "Account");
        assert_eq!(client.send(&request).unwrap().status, 200);
        assert_eq!(client.send(&request).unwrap().status, 500);
    }

    #[test]
    fn harness_seeds_and_reads_back() {
        let harness = SyncHarness::new(&["accounts"]);
        harness.seed("accounts", vec![account("001", "Acme"), account("002", "Globex")]);
        assert_eq!(harness.records("accounts").len(), 2);
        assert!(harness.find("accounts", "002").is_some());
        assert_eq!(dirty_count(harness.store.as_ref(), "accounts"), 0);
    }
}
