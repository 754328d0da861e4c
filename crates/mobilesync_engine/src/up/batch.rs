//! Composite batch sync-up.

use super::{
    are_newer_by_query, build_request, ensure_local_id, reconcile, Reconciled, UpTarget,
    UpTargetConfig,
};
use crate::config::SyncOptions;
use crate::error::{SyncError, SyncResult};
use crate::registry::{self, UP_DISCRIMINATOR};
use crate::target::{apply_changes, LocalChange, SyncContext, TargetFields};
use mobilesync_protocol::{
    composite_request, parse_composite_response, parse_ids_from_responses, Record, RecordRequest,
    RecordResponse, MAX_SUB_REQUESTS_COMPOSITE_API,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Implementation name persisted in the target configuration.
pub const BATCH_IMPLEMENTATION: &str = "batch";

fn default_max_batch_size() -> usize {
    MAX_SUB_REQUESTS_COMPOSITE_API
}

/// Uploads up to 25 records per composite request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncUpTarget {
    #[serde(flatten)]
    config: UpTargetConfig,
    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,
}

impl Default for BatchSyncUpTarget {
    fn default() -> Self {
        Self::new(UpTargetConfig::default())
    }
}

impl BatchSyncUpTarget {
    /// Creates a target with the composite maximum batch size.
    pub fn new(config: UpTargetConfig) -> Self {
        Self {
            config,
            max_batch_size: MAX_SUB_REQUESTS_COMPOSITE_API,
        }
    }

    /// Sets the batch size, clamped to the composite maximum.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.clamp(1, MAX_SUB_REQUESTS_COMPOSITE_API);
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

impl UpTarget for BatchSyncUpTarget {
    fn fields(&self) -> &TargetFields {
        &self.config.fields
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, UP_DISCRIMINATOR, BATCH_IMPLEMENTATION)
    }

    fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        options: &SyncOptions,
        records: Vec<Record>,
    ) -> SyncResult<()> {
        sync_up_batch(ctx, soup, options, &self.config, self.max_batch_size, records, |requests| {
            let request = composite_request(ctx.api_version, false, requests)?;
            let response = ctx.send(&request)?;
            Ok(parse_composite_response(&response)?)
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

/// Builds, sends and reconciles one batch, re-running once for records the
/// server no longer has.
///
/// `send` receives the requests of one pass and returns responses keyed by
/// reference id.
pub(crate) fn sync_up_batch<F>(
    ctx: &SyncContext<'_>,
    soup: &str,
    options: &SyncOptions,
    config: &UpTargetConfig,
    max_batch_size: usize,
    records: Vec<Record>,
    send: F,
) -> SyncResult<()>
where
    F: Fn(&[RecordRequest]) -> SyncResult<HashMap<String, RecordResponse>>,
{
    if records.len() > max_batch_size {
        return Err(SyncError::config(format!(
            "{} records exceed the maximum batch size of {max_batch_size}",
            records.len()
        )));
    }
    if records.is_empty() {
        return Ok(());
    }
    let id_field = config.fields.id_field_name.as_str();
    let builder = config.request_builder(options);
    let mut records: Vec<Record> = records
        .into_iter()
        .map(|r| ensure_local_id(r, id_field))
        .collect();
    let mut is_rerun = false;

    loop {
        let mut requests = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(request) = build_request(&builder, record)? {
                requests.push(request);
            }
        }
        let responses = if requests.is_empty() {
            HashMap::new()
        } else {
            debug!(soup, requests = requests.len(), is_rerun, "sending batch");
            send(&requests)?
        };
        let server_ids = parse_ids_from_responses(&responses);

        let mut changes = Vec::with_capacity(records.len());
        let mut rerun = Vec::new();
        for record in records {
            let response = record.id(id_field).and_then(|id| responses.get(id)).cloned();
            let reconciled = reconcile(
                record,
                response.as_ref(),
                &server_ids,
                id_field,
                options.merge_mode,
                is_rerun,
            );
            match reconciled {
                Reconciled::Change(change) => {
                    if let LocalChange::Save(saved) = &change {
                        if let Some(error) = saved.last_error() {
                            warn!(soup, id = saved.id(id_field), error, "record not synced");
                        }
                    }
                    changes.push(change);
                }
                Reconciled::Rerun(record) => rerun.push(record),
                Reconciled::Untouched => {}
            }
        }
        apply_changes(ctx.store, soup, id_field, changes)?;

        if rerun.is_empty() || is_rerun {
            return Ok(());
        }
        info!(soup, count = rerun.len(), "re-running batch for records deleted on the server");
        records = rerun;
        is_rerun = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeMode;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::record::ID;
    use mobilesync_protocol::{DirtyState, RestResponse};
    use mobilesync_store::{LocalStore, MemoryStore, QuerySpec, StoreReader};
    use serde_json::json;

    const CREATED: DirtyState = DirtyState { created: true, updated: false, deleted: false };
    const UPDATED: DirtyState = DirtyState { created: false, updated: true, deleted: false };
    const DELETED: DirtyState = DirtyState { created: false, updated: false, deleted: true };

    fn store_with(records: Vec<Record>) -> MemoryStore {
        let store = MemoryStore::new();
        store.register_soup("accounts", &[]).unwrap();
        for record in records {
            store.upsert_one("accounts", record, None).unwrap();
        }
        store
    }

    fn dirty(id: &str, state: DirtyState) -> Record {
        Record::new()
            .with_object_type("Account")
            .with(ID, id)
            .with("Name", format!("name {id}"))
            .with_dirty_state(state)
    }

    fn target() -> BatchSyncUpTarget {
        BatchSyncUpTarget::new(
            UpTargetConfig::new()
                .with_create_fieldlist(["Name"])
                .with_update_fieldlist(["Name"]),
        )
    }

    fn stored(store: &MemoryStore) -> Vec<Record> {
        store.query_all("accounts", &QuerySpec::all()).unwrap()
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(BatchSyncUpTarget::default().with_max_batch_size(100).max_batch_size(), 25);
        let target = BatchSyncUpTarget::from_config(&json!({ "maxBatchSize": 40 })).unwrap();
        assert_eq!(target.max_batch_size(), 25);
        let target = BatchSyncUpTarget::from_config(&json!({ "maxBatchSize": 5 })).unwrap();
        assert_eq!(target.max_batch_size(), 5);
    }

    #[test]
    fn config_round_trip() {
        let target = target().with_max_batch_size(10);
        let config = target.to_config().unwrap();
        assert_eq!(config[UP_DISCRIMINATOR], BATCH_IMPLEMENTATION);
        assert_eq!(config["maxBatchSize"], 10);
        assert_eq!(config["createFieldlist"], json!(["Name"]));
        assert_eq!(config["idFieldName"], "Id");
        assert_eq!(BatchSyncUpTarget::from_config(&config).unwrap(), target);
    }

    #[test]
    fn oversized_batch_fails_without_network() {
        let store = store_with(vec![]);
        let client = MockRestClient::always(RestResponse::new(200, json!({})));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let records: Vec<Record> = (0..26)
            .map(|i| dirty(&format!("00{i}"), UPDATED))
            .collect();
        let err = target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), records)
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn created_record_gets_server_id() {
        let store = store_with(vec![dirty("local_1", CREATED)]);
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "compositeResponse": [
                { "referenceId": "local_1", "httpStatusCode": 201,
                  "body": { "id": "001NEW", "success": true } }
            ]}),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), stored(&store))
            .unwrap();
        let saved = stored(&store);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id(ID), Some("001NEW"));
        assert!(saved[0].is_clean());
        let body = client.requests()[0].body.clone().unwrap();
        assert_eq!(body["compositeRequest"][0]["referenceId"], "local_1");
        assert_eq!(body["compositeRequest"][0]["body"], json!({ "Name": "name local_1" }));
    }

    #[test]
    fn missing_record_is_recreated_once() {
        let store = store_with(vec![dirty("001", UPDATED)]);
        let client = MockRestClient::new(|request| {
            let sub = &request.body.as_ref().unwrap()["compositeRequest"][0];
            if sub["method"] == "PATCH" {
                RestResponse::new(
                    200,
                    json!({ "compositeResponse": [
                        { "referenceId": "001", "httpStatusCode": 404,
                          "body": [{ "errorCode": "NOT_FOUND", "message": "gone" }] }
                    ]}),
                )
            } else {
                RestResponse::new(
                    200,
                    json!({ "compositeResponse": [
                        { "referenceId": "001", "httpStatusCode": 201, "body": { "id": "001B" } }
                    ]}),
                )
            }
        });
        let ctx = SyncContext::new(&store, &client, "v60.0");
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), stored(&store))
            .unwrap();
        assert_eq!(client.request_count(), 2);
        let saved = stored(&store);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id(ID), Some("001B"));
        assert!(saved[0].is_clean());
    }

    #[test]
    fn server_that_always_404s_is_asked_twice() {
        let store = store_with(vec![dirty("001", UPDATED)]);
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "compositeResponse": [
                { "referenceId": "001", "httpStatusCode": 404,
                  "body": [{ "errorCode": "NOT_FOUND", "message": "gone" }] }
            ]}),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), stored(&store))
            .unwrap();
        assert_eq!(client.request_count(), 2);
        let saved = stored(&store);
        assert!(saved[0].is_dirty());
        assert!(saved[0].last_error().is_some());
    }

    #[test]
    fn leave_if_changed_does_not_rerun() {
        let store = store_with(vec![dirty("001", UPDATED)]);
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "compositeResponse": [
                { "referenceId": "001", "httpStatusCode": 404,
                  "body": [{ "errorCode": "NOT_FOUND", "message": "gone" }] }
            ]}),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let options = SyncOptions::new().with_merge_mode(MergeMode::LeaveIfChanged);
        target().sync_up_records(&ctx, "accounts", &options, stored(&store)).unwrap();
        assert_eq!(client.request_count(), 1);
        assert!(!stored(&store)[0].is_locally_created());
    }

    #[test]
    fn local_only_records_are_purged_without_network() {
        let store = store_with(vec![dirty(
            "local_9",
            DirtyState { created: true, updated: false, deleted: true },
        )]);
        let client = MockRestClient::always(RestResponse::new(200, json!({})));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), stored(&store))
            .unwrap();
        assert_eq!(client.request_count(), 0);
        assert!(stored(&store).is_empty());
    }

    #[test]
    fn failed_delete_keeps_the_record() {
        let store = store_with(vec![dirty("001", DELETED)]);
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "compositeResponse": [
                { "referenceId": "001", "httpStatusCode": 400,
                  "body": [{ "errorCode": "DELETE_FAILED", "message": "locked" }] }
            ]}),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        target()
            .sync_up_records(&ctx, "accounts", &SyncOptions::new(), stored(&store))
            .unwrap();
        let saved = stored(&store);
        assert_eq!(saved.len(), 1);
        assert!(saved[0].is_locally_deleted());
        assert!(saved[0].last_error().unwrap().contains("locked"));
    }
}
