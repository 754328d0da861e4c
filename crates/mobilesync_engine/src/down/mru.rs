//! Most recently used sync-down.

use super::{with_sync_fields, DownTarget, FetchCursor, FetchPage};
use crate::error::SyncResult;
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{record_ids, SyncContext, TargetFields};
use mobilesync_protocol::soql::{in_predicate, SoqlBuilder};
use mobilesync_protocol::{is_local_id, RestRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Discriminator persisted in the target configuration.
pub const MRU_TYPE: &str = "mru";

const MAX_IDS_PER_QUERY: usize = 500;

/// Fetches the records of an object type the user viewed recently.
///
/// The object metadata lists recent item ids; their fields are then read
/// with one SOQL query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MruSyncDownTarget {
    #[serde(flatten)]
    fields: TargetFields,
    fieldlist: Vec<String>,
    sobject_type: String,
}

impl MruSyncDownTarget {
    /// Creates a target.
    pub fn new<I, S>(fieldlist: I, sobject_type: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: TargetFields::default(),
            fieldlist: fieldlist.into_iter().map(Into::into).collect(),
            sobject_type: sobject_type.into(),
        }
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    fn recent_ids(&self, ctx: &SyncContext<'_>) -> SyncResult<Vec<String>> {
        let response = ctx.send(&RestRequest::metadata(ctx.api_version, &self.sobject_type))?;
        let items = response
            .body
            .get("recentItems")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| item.get(&self.fields.id_field_name).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

impl DownTarget for MruSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, MRU_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        _max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        let ids = self.recent_ids(ctx)?;
        if ids.is_empty() {
            return Ok(FetchPage::complete(Vec::new()));
        }
        let soql = SoqlBuilder::with_fields(with_sync_fields(&self.fieldlist, &self.fields))
            .from(&self.sobject_type)
            .where_clause(in_predicate(&self.fields.id_field_name, &ids))
            .build()?;
        Ok(FetchPage::complete(ctx.query_all(&soql)?))
    }

    fn continue_fetch(
        &self,
        _ctx: &SyncContext<'_>,
        _soup: &str,
        _cursor: &FetchCursor,
    ) -> SyncResult<Option<FetchPage>> {
        Ok(None)
    }

    fn remote_ids(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>> {
        let ids: Vec<&str> = local_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !is_local_id(id))
            .collect();
        let mut remote = BTreeSet::new();
        for slice in ids.chunks(MAX_IDS_PER_QUERY) {
            let soql = SoqlBuilder::with_fields([self.fields.id_field_name.as_str()])
                .from(&self.sobject_type)
                .where_clause(in_predicate(&self.fields.id_field_name, slice))
                .build()?;
            remote.extend(record_ids(&ctx.query_all(&soql)?, &self.fields.id_field_name));
        }
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::RestResponse;
    use mobilesync_store::MemoryStore;
    use serde_json::json;

    #[test]
    fn recent_items_are_fetched_by_id() {
        let store = MemoryStore::new();
        let client = MockRestClient::new(|request| {
            if request.path_only().ends_with("/sobjects/Account/") {
                RestResponse::new(200, json!({ "recentItems": [{ "Id": "001" }, { "Id": "002" }] }))
            } else {
                RestResponse::new(
                    200,
                    json!({
                        "totalSize": 2, "done": true,
                        "records": [{ "Id": "001" }, { "Id": "002" }]
                    }),
                )
            }
        });
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target = MruSyncDownTarget::new(["Name"], "Account");
        let page = target.start_fetch(&ctx, "accounts", 0).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_size, 2);
        assert!(page.cursor.is_none());
        assert_eq!(
            client.requests()[1].query_param("q").unwrap(),
            "SELECT Id, LastModifiedDate, Name FROM Account WHERE Id IN ('001', '002')"
        );
    }

    #[test]
    fn no_recent_items_means_no_query() {
        let store = MemoryStore::new();
        let client = MockRestClient::always(RestResponse::new(200, json!({ "recentItems": [] })));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let page = MruSyncDownTarget::new(["Name"], "Account")
            .start_fetch(&ctx, "accounts", 0)
            .unwrap();
        assert!(page.records.is_empty());
        assert_eq!(client.request_count(), 1);
    }
}
