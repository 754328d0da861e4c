//! SOSL sync-down.

use super::{DownTarget, FetchCursor, FetchPage};
use crate::error::{SyncError, SyncResult};
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{record_ids, SyncContext, TargetFields};
use mobilesync_protocol::{Record, RestRequest, RestResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Discriminator persisted in the target configuration.
pub const SOSL_TYPE: &str = "sosl";

/// Fetches the records matched by a SOSL search, in a single page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoslSyncDownTarget {
    #[serde(flatten)]
    fields: TargetFields,
    query: String,
}

impl SoslSyncDownTarget {
    /// Creates a target.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            fields: TargetFields::default(),
            query: query.into(),
        }
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    fn search(&self, ctx: &SyncContext<'_>) -> SyncResult<Vec<Record>> {
        let response = ctx.send(&RestRequest::search(ctx.api_version, &self.query))?;
        search_records(&response)
    }
}

/// Records of a search response: a bare array, or `searchRecords`.
fn search_records(response: &RestResponse) -> SyncResult<Vec<Record>> {
    let items = match &response.body {
        Value::Array(items) => items,
        Value::Object(body) => body
            .get("searchRecords")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::Protocol("search response without searchRecords".into()))?,
        _ => return Err(SyncError::Protocol("unexpected search response".into())),
    };
    Ok(items.iter().filter_map(|v| Record::from_value(v.clone())).collect())
}

impl DownTarget for SoslSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, SOSL_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        _max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        Ok(FetchPage::complete(self.search(ctx)?))
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
        _local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>> {
        Ok(record_ids(&self.search(ctx)?, &self.fields.id_field_name))
    }
}
