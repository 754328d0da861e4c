//! SOQL sync-down.

use super::{DownTarget, FetchCursor, FetchPage};
use crate::error::SyncResult;
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{record_ids, SyncContext, TargetFields};
use mobilesync_protocol::soql::{add_filter_for_resync, ensure_sync_fields};
use mobilesync_protocol::SoqlMutator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Discriminator persisted in the target configuration.
pub const SOQL_TYPE: &str = "soql";

/// Fetches the records returned by a SOQL query.
///
/// The query is completed on construction so it always selects the id and
/// modification date fields and has an ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoqlSyncDownTarget {
    #[serde(flatten)]
    fields: TargetFields,
    query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_batch_size: Option<usize>,
}

impl SoqlSyncDownTarget {
    /// Creates a target with default field names.
    pub fn new(query: &str) -> SyncResult<Self> {
        Self::with_fields(query, TargetFields::default())
    }

    /// Creates a target with custom field names.
    pub fn with_fields(query: &str, fields: TargetFields) -> SyncResult<Self> {
        let query =
            ensure_sync_fields(query, &fields.id_field_name, &fields.modification_date_field_name)?;
        Ok(Self {
            fields,
            query,
            max_batch_size: None,
        })
    }

    /// Sets the page size hint sent with the query.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    /// The completed query.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        let target: Self = serde_json::from_value(value.clone())?;
        let completed = Self::with_fields(&target.query, target.fields)?;
        Ok(Self {
            max_batch_size: target.max_batch_size,
            ..completed
        })
    }
}

impl DownTarget for SoqlSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, SOQL_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        let query = add_filter_for_resync(
            &self.query,
            &self.fields.modification_date_field_name,
            max_timestamp,
        )?;
        Ok(FetchPage::from_query(ctx.query(&query, self.max_batch_size)?))
    }

    fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        cursor: &FetchCursor,
    ) -> SyncResult<Option<FetchPage>> {
        match cursor {
            FetchCursor::Url(url) => Ok(Some(FetchPage::from_query(ctx.query_next(url)?))),
            _ => Ok(None),
        }
    }

    fn remote_ids(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>> {
        if local_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut mutator = SoqlMutator::new(&self.query)?;
        mutator.replace_select_fields(&[self.fields.id_field_name.as_str()]);
        mutator.clear_order_by();
        let records = ctx.query_all(&mutator.build())?;
        Ok(record_ids(&records, &self.fields.id_field_name))
    }

    fn is_sorted_by_modification_date(&self) -> bool {
        SoqlMutator::new(&self.query)
            .map(|m| m.is_ordering_by(&self.fields.modification_date_field_name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::{timestamp, RestResponse};
    use mobilesync_store::MemoryStore;
    use serde_json::json;

    #[test]
    fn query_is_completed() {
        let target = SoqlSyncDownTarget::new("SELECT Name FROM Account").unwrap();
        assert_eq!(
            target.query(),
            "SELECT Name, Id, LastModifiedDate FROM Account ORDER BY LastModifiedDate ASC"
        );
        assert!(target.is_sorted_by_modification_date());

        let by_name_query = "SELECT Id, LastModifiedDate FROM Account ORDER BY Name";
        let by_name = SoqlSyncDownTarget::new(by_name_query).unwrap();
        assert_eq!(by_name.query(), "SELECT Id, LastModifiedDate FROM Account ORDER BY Name");
        assert!(!by_name.is_sorted_by_modification_date());

        assert!(SoqlSyncDownTarget::new("DELETE everything").unwrap_err().is_config());
    }

    #[test]
    fn config_round_trip() {
        let target = SoqlSyncDownTarget::new("SELECT Name FROM Account")
            .unwrap()
            .with_max_batch_size(500);
        let config = target.to_config().unwrap();
        assert_eq!(config["type"], SOQL_TYPE);
        assert_eq!(config["maxBatchSize"], 500);
        assert_eq!(SoqlSyncDownTarget::from_config(&config).unwrap(), target);

        let raw = SoqlSyncDownTarget::from_config(
            &json!({ "type": "soql", "query": "SELECT Name FROM Contact" }),
        )
        .unwrap();
        assert!(raw.query().contains("ORDER BY LastModifiedDate ASC"));
    }

    #[test]
    fn fetch_pages_follow_next_url() {
        let store = MemoryStore::new();
        let client = MockRestClient::new(|request| {
            if request.path.contains("/query/01g-2000") {
                RestResponse::new(
                    200,
                    json!({ "totalSize": 3, "done": true, "records": [{ "Id": "003" }] }),
                )
            } else {
                RestResponse::new(
                    200,
                    json!({
                        "totalSize": 3, "done": false,
                        "nextRecordsUrl": "/services/data/v60.0/query/01g-2000",
                        "records": [{ "Id": "001" }, { "Id": "002" }]
                    }),
                )
            }
        });
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target = SoqlSyncDownTarget::new("SELECT Name FROM Account")
            .unwrap()
            .with_max_batch_size(2);
        let first = target.start_fetch(&ctx, "accounts", 0).unwrap();
        assert_eq!(first.total_size, 3);
        assert_eq!(first.records.len(), 2);
        let cursor = first.cursor.unwrap();
        let second = target.continue_fetch(&ctx, "accounts", &cursor).unwrap().unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.cursor.is_none());
        assert_eq!(
            client.requests()[0].headers.get("Sforce-Query-Options").map(String::as_str),
            Some("batchSize=2")
        );
    }

    #[test]
    fn resync_adds_modification_filter() {
        let store = MemoryStore::new();
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "totalSize": 0, "done": true, "records": [] }),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target =
            SoqlSyncDownTarget::new("SELECT Name FROM Account WHERE Industry = 'Tech'").unwrap();
        let ts = timestamp::parse_millis("2024-02-01T00:00:00.000Z").unwrap();
        target.start_fetch(&ctx, "accounts", ts).unwrap();
        assert_eq!(
            client.requests()[0].query_param("q").unwrap(),
            "SELECT Name, Id, LastModifiedDate FROM Account \
             WHERE LastModifiedDate > 2024-02-01T00:00:00.000Z AND (Industry = 'Tech') \
             ORDER BY LastModifiedDate ASC"
        );
    }

    #[test]
    fn remote_ids_select_only_ids() {
        let store = MemoryStore::new();
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "totalSize": 1, "done": true, "records": [{ "Id": "001" }] }),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target =
            SoqlSyncDownTarget::new("SELECT Name FROM Account WHERE Industry = 'Tech'").unwrap();
        let local: BTreeSet<String> = ["001".to_string(), "002".to_string()].into();
        let remote = target.remote_ids(&ctx, "accounts", &local).unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(
            client.requests()[0].query_param("q").unwrap(),
            "SELECT Id FROM Account WHERE Industry = 'Tech'"
        );
    }
}
