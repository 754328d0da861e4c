//! Collection sync-up: one request per operation kind.

use super::batch::sync_up_batch;
use super::{are_newer_by_query, UpTarget, UpTargetConfig};
use crate::config::SyncOptions;
use crate::error::SyncResult;
use crate::registry::{self, UP_DISCRIMINATOR};
use crate::target::{SyncContext, TargetFields};
use mobilesync_protocol::{
    collection_request, parse_collection_response, Record, RecordRequest, RecordResponse,
    RequestType, RestRequest, MAX_RECORDS_SOBJECT_COLLECTION_API,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Implementation name persisted in the target configuration.
pub const COLLECTION_IMPLEMENTATION: &str = "collection";

fn default_max_batch_size() -> usize {
    MAX_RECORDS_SOBJECT_COLLECTION_API
}

/// Uploads up to 200 records, grouped by operation kind.
///
/// Creates, updates, upserts and deletes each travel in their own request,
/// in that order. Responses are matched to records by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSyncUpTarget {
    #[serde(flatten)]
    config: UpTargetConfig,
    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,
}

impl Default for CollectionSyncUpTarget {
    fn default() -> Self {
        Self::new(UpTargetConfig::default())
    }
}

impl CollectionSyncUpTarget {
    /// Creates a target with the collection maximum batch size.
    pub fn new(config: UpTargetConfig) -> Self {
        Self {
            config,
            max_batch_size: MAX_RECORDS_SOBJECT_COLLECTION_API,
        }
    }

    /// Sets the batch size, clamped to the collection maximum.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.clamp(1, MAX_RECORDS_SOBJECT_COLLECTION_API);
        self
    }

    /// Shared configuration.
    pub fn config(&self) -> &UpTargetConfig {
        &self.config
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        let target: Self = serde_json::from_value(value.clone())?;
        let max = target.max_batch_size;
        Ok(target.with_max_batch_size(max))
    }
}

impl UpTarget for CollectionSyncUpTarget {
    fn fields(&self) -> &TargetFields {
        &self.config.fields
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, UP_DISCRIMINATOR, COLLECTION_IMPLEMENTATION)
    }

    fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        options: &SyncOptions,
        records: Vec<Record>,
    ) -> SyncResult<()> {
        sync_up_batch(ctx, soup, options, &self.config, self.max_batch_size, records, |requests| {
            send_collections(ctx, requests)
        })
    }

    fn are_newer_than_server(
        &self,
        ctx: &SyncContext<'_>,
        records: &[Record],
    ) -> SyncResult<Vec<bool>> {
        are_newer_by_query(ctx, &self.config.fields, records)
    }
}

/// Encodes every group before sending anything, so a mixed upsert group
/// fails without a network call.
fn send_collections(
    ctx: &SyncContext<'_>,
    requests: &[RecordRequest],
) -> SyncResult<HashMap<String, RecordResponse>> {
    let mut groups: Vec<(RequestType, Vec<&RecordRequest>, RestRequest)> = Vec::new();
    for request_type in RequestType::ALL {
        let group: Vec<RecordRequest> = requests
            .iter()
            .filter(|r| r.request_type == request_type)
            .cloned()
            .collect();
        if group.is_empty() {
            continue;
        }
        let rest = collection_request(ctx.api_version, false, request_type, &group)?;
        let refs = requests.iter().filter(|r| r.request_type == request_type).collect();
        groups.push((request_type, refs, rest));
    }

    let mut responses = HashMap::with_capacity(requests.len());
    for (request_type, group, rest) in groups {
        let response = ctx.send(&rest)?;
        let parsed = parse_collection_response(request_type, &response, group.len())?;
        for (request, parsed) in group.into_iter().zip(parsed) {
            responses.insert(request.reference_id.clone(), parsed);
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::record::ID;
    use mobilesync_protocol::{DirtyState, RestMethod, RestResponse};
    use mobilesync_store::{LocalStore, MemoryStore, QuerySpec, StoreReader};
    use serde_json::json;

    fn dirty(id: &str, state: DirtyState) -> Record {
        Record::new()
            .with_object_type("Account")
            .with(ID, id)
            .with("Name", format!("name {id}"))
            .with_dirty_state(state)
    }

    fn setup(records: Vec<Record>) -> MemoryStore {
        let store = MemoryStore::new();
        store.register_soup("accounts", &[]).unwrap();
        for record in records {
            store.upsert_one("accounts", record, None).unwrap();
        }
        store
    }

    fn target() -> CollectionSyncUpTarget {
        CollectionSyncUpTarget::new(
            UpTargetConfig::new()
                .with_create_fieldlist(["Name"])
                .with_update_fieldlist(["Name"]),
        )
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(CollectionSyncUpTarget::default().max_batch_size(), 200);
        assert_eq!(target().with_max_batch_size(500).max_batch_size(), 200);
    }

    #[test]
    fn groups_by_kind_and_matches_by_position() {
        let store = setup(vec![
            dirty("001", DirtyState { updated: true, ..DirtyState::CLEAN }),
            dirty("local_1", DirtyState { created: true, ..DirtyState::CLEAN }),
            dirty("local_2", DirtyState { created: true, ..DirtyState::CLEAN }),
            dirty("002", DirtyState { deleted: true, ..DirtyState::CLEAN }),
        ]);
        let client = MockRestClient::new(|request| match request.method {
            RestMethod::Post => RestResponse::new(
                200,
                json!([{ "id": "001A", "success": true }, { "id": "001B", "success": true }]),
            ),
            RestMethod::Patch => RestResponse::new(200, json!([{ "id": "001", "success": true }])),
            _ => RestResponse::new(200, json!([{ "id": "002", "success": true }])),
        });
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let records = store.query_all("accounts", &QuerySpec::all()).unwrap();
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), records)
            .unwrap();

        let methods: Vec<RestMethod> = client.requests().iter().map(|r| r.method).collect();
        assert_eq!(methods, vec![RestMethod::Post, RestMethod::Patch, RestMethod::Delete]);

        let saved = store.query_all("accounts", &QuerySpec::all()).unwrap();
        let mut ids: Vec<&str> = saved.iter().filter_map(|r| r.id(ID)).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["001", "001A", "001B"]);
        assert!(saved.iter().all(Record::is_clean));
    }

    #[test]
    fn failed_top_level_response_is_an_error() {
        let store = setup(vec![dirty("001", DirtyState { updated: true, ..DirtyState::CLEAN })]);
        let client = MockRestClient::always(RestResponse::new(500, json!("down")));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let records = store.query_all("accounts", &QuerySpec::all()).unwrap();
        let err = target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), records)
            .unwrap_err();
        assert!(err.is_retryable());
        let saved = store.query_all("accounts", &QuerySpec::all()).unwrap();
        assert!(saved[0].is_dirty());
    }

    #[test]
    fn mixed_upserts_fail_before_sending() {
        let store = setup(vec![]);
        let client = MockRestClient::always(RestResponse::new(200, json!([])));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target = CollectionSyncUpTarget::new(
            UpTargetConfig::new()
                .with_create_fieldlist(["Name"])
                .with_external_id_field_name("Ext__c"),
        );
        let created = DirtyState { created: true, ..DirtyState::CLEAN };
        let records = vec![
            dirty("local_1", created).with("Ext__c", "E1"),
            dirty("local_2", created).with("Ext__c", "E2").with_object_type("Contact"),
        ];
        let err = target
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), records)
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn entity_deleted_on_update_recreates() {
        let store = setup(vec![dirty("001", DirtyState { updated: true, ..DirtyState::CLEAN })]);
        let client = MockRestClient::new(|request| match request.method {
            RestMethod::Patch => RestResponse::new(
                200,
                json!([{
                    "success": false,
                    "errors": [{ "statusCode": "ENTITY_IS_DELETED", "message": "deleted" }]
                }]),
            ),
            _ => RestResponse::new(200, json!([{ "id": "001Z", "success": true }])),
        });
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let records = store.query_all("accounts", &QuerySpec::all()).unwrap();
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), records)
            .unwrap();
        assert_eq!(client.request_count(), 2);
        let saved = store.query_all("accounts", &QuerySpec::all()).unwrap();
        assert_eq!(saved[0].id(ID), Some("001Z"));
    }
}
