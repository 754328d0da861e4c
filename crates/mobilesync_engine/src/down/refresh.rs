//! Refresh sync-down: re-fetches the records already in a soup.

use super::{with_sync_fields, DownTarget, FetchCursor, FetchPage};
use crate::error::SyncResult;
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{latest_modification_timestamp, record_ids, SyncContext, TargetFields};
use mobilesync_protocol::soql::{in_predicate, modification_date_filter, SoqlBuilder};
use mobilesync_protocol::{is_local_id, Record};
use mobilesync_store::{Filter, QuerySpec, SortOrder, StoreReader};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

/// Discriminator persisted in the target configuration.
pub const REFRESH_TYPE: &str = "refresh";

/// Ids per `IN (...)` clause, bounded by URL length.
pub const DEFAULT_COUNT_IDS_PER_SOQL: usize = 500;

fn default_count_ids_per_soql() -> usize {
    DEFAULT_COUNT_IDS_PER_SOQL
}

/// Re-fetches, page by page, the records whose ids are already stored.
///
/// Each page reads a slice of local ids ordered by id and fetches them with
/// one `IN (...)` query. On a re-sync the modification filter comes from
/// the local page itself, since those records may have been written
/// outside this sync.
///
/// The total size reported is the soup's record count even on a re-sync,
/// when only some of them may come back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSyncDownTarget {
    #[serde(flatten)]
    fields: TargetFields,
    fieldlist: Vec<String>,
    sobject_type: String,
    soup_name: String,
    #[serde(default = "default_count_ids_per_soql")]
    count_ids_per_soql: usize,
}

impl RefreshSyncDownTarget {
    /// Creates a target.
    pub fn new<I, S>(
        fieldlist: I,
        sobject_type: impl Into<String>,
        soup_name: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: TargetFields::default(),
            fieldlist: fieldlist.into_iter().map(Into::into).collect(),
            sobject_type: sobject_type.into(),
            soup_name: soup_name.into(),
            count_ids_per_soql: DEFAULT_COUNT_IDS_PER_SOQL,
        }
    }

    /// Sets the number of ids per query.
    pub fn with_count_ids_per_soql(mut self, count: usize) -> Self {
        self.count_ids_per_soql = count.max(1);
        self
    }

    /// Soup whose records are refreshed.
    pub fn soup_name(&self) -> &str {
        &self.soup_name
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        let target: Self = serde_json::from_value(value.clone())?;
        let count = target.count_ids_per_soql;
        Ok(target.with_count_ids_per_soql(count))
    }

    fn local_page(&self, ctx: &SyncContext<'_>, index: usize) -> SyncResult<Vec<Record>> {
        let spec = QuerySpec::all()
            .order_by(&self.fields.id_field_name, SortOrder::Ascending)
            .with_page_size(self.count_ids_per_soql);
        Ok(ctx.store.query(&self.soup_name, &spec, index)?)
    }

    fn fetch_page(
        &self,
        ctx: &SyncContext<'_>,
        index: usize,
        max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        let local = self.local_page(ctx, index)?;
        let is_last = local.len() < self.count_ids_per_soql;
        let resync_timestamp = if max_timestamp > 0 {
            latest_modification_timestamp(&local, &self.fields.modification_date_field_name)
        } else {
            max_timestamp
        };
        let ids: Vec<&str> = local
            .iter()
            .filter_map(|r| r.id(&self.fields.id_field_name))
            .filter(|id| !is_local_id(id))
            .collect();

        let records = if ids.is_empty() {
            Vec::new()
        } else {
            let mut predicate = in_predicate(&self.fields.id_field_name, &ids);
            if resync_timestamp > 0 {
                predicate.push_str(" AND ");
                predicate.push_str(&modification_date_filter(
                    &self.fields.modification_date_field_name,
                    resync_timestamp,
                )?);
            }
            let soql = SoqlBuilder::with_fields(with_sync_fields(&self.fieldlist, &self.fields))
                .from(&self.sobject_type)
                .where_clause(predicate)
                .build()?;
            ctx.query_all(&soql)?
        };
        debug!(soup = self.soup_name.as_str(), index, fetched = records.len(), "refreshed page");

        let total_size = ctx.store.count(&self.soup_name, &Filter::All)? as i64;
        Ok(FetchPage {
            records,
            total_size,
            cursor: (!is_last).then_some(FetchCursor::Page {
                index: index + 1,
                max_timestamp,
            }),
        })
    }
}

impl DownTarget for RefreshSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, REFRESH_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        self.fetch_page(ctx, 0, max_timestamp)
    }

    fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        cursor: &FetchCursor,
    ) -> SyncResult<Option<FetchPage>> {
        match cursor {
            FetchCursor::Page { index, max_timestamp } => {
                Ok(Some(self.fetch_page(ctx, *index, *max_timestamp)?))
            }
            _ => Ok(None),
        }
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
        for slice in ids.chunks(self.count_ids_per_soql) {
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
    use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
    use mobilesync_protocol::RestResponse;
    use mobilesync_store::{LocalStore, MemoryStore};
    use serde_json::json;

    fn store_with(ids: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        store.register_soup("accounts", &[]).unwrap();
        for (i, id) in ids.iter().enumerate() {
            let record = Record::new()
                .with(ID, *id)
                .with(LAST_MODIFIED_DATE, format!("2024-01-0{}T00:00:00.000Z", i + 1))
                .cleaned();
            store.upsert_one("accounts", record, None).unwrap();
        }
        store
    }

    fn empty_query() -> RestResponse {
        RestResponse::new(200, json!({ "totalSize": 0, "done": true, "records": [] }))
    }

    #[test]
    fn pages_through_local_ids() {
        let store = store_with(&["001", "002", "003", "local_4"]);
        let client = MockRestClient::always(empty_query());
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target =
            RefreshSyncDownTarget::new(["Name"], "Account", "accounts").with_count_ids_per_soql(2);

        let first = target.start_fetch(&ctx, "accounts", 0).unwrap();
        assert_eq!(first.total_size, 4);
        let cursor = first.cursor.unwrap();
        assert_eq!(cursor, FetchCursor::Page { index: 1, max_timestamp: 0 });
        let second = target.continue_fetch(&ctx, "accounts", &cursor).unwrap().unwrap();
        assert_eq!(second.cursor, Some(FetchCursor::Page { index: 2, max_timestamp: 0 }));
        let third = target
            .continue_fetch(&ctx, "accounts", &second.cursor.unwrap())
            .unwrap()
            .unwrap();
        assert!(third.cursor.is_none());

        let queries: Vec<String> = client
            .requests()
            .iter()
            .filter_map(|r| r.query_param("q"))
            .collect();
        assert_eq!(
            queries,
            vec![
                "SELECT Id, LastModifiedDate, Name FROM Account WHERE Id IN ('001', '002')",
                "SELECT Id, LastModifiedDate, Name FROM Account WHERE Id IN ('003')",
            ]
        );
    }

    #[test]
    fn resync_uses_local_timestamps() {
        let store = store_with(&["001", "002"]);
        let client = MockRestClient::always(empty_query());
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target = RefreshSyncDownTarget::new(["Name"], "Account", "accounts");
        target.start_fetch(&ctx, "accounts", 1).unwrap();
        assert_eq!(
            client.requests()[0].query_param("q").unwrap(),
            "SELECT Id, LastModifiedDate, Name FROM Account \
             WHERE Id IN ('001', '002') AND LastModifiedDate > 2024-01-02T00:00:00.000Z"
        );
    }

    #[test]
    fn remote_ids_in_slices() {
        let store = store_with(&[]);
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "totalSize": 1, "done": true, "records": [{ "Id": "001" }] }),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target =
            RefreshSyncDownTarget::new(["Name"], "Account", "accounts").with_count_ids_per_soql(2);
        let local: BTreeSet<String> = ["001", "002", "003"].iter().map(|s| s.to_string()).collect();
        let remote = target.remote_ids(&ctx, "accounts", &local).unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(client.request_count(), 2);
    }

    #[test]
    fn config_keys() {
        let config = RefreshSyncDownTarget::new(["Name"], "Account", "accounts")
            .to_config()
            .unwrap();
        assert_eq!(
            config,
            json!({
                "type": "refresh", "idFieldName": "Id",
                "modificationDateFieldName": "LastModifiedDate",
                "fieldlist": ["Name"], "sobjectType": "Account", "soupName": "accounts",
                "countIdsPerSoql": 500
            })
        );
    }
}
