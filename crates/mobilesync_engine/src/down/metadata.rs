//! Object metadata sync-down.

use super::{DownTarget, FetchCursor, FetchPage};
use crate::error::{SyncError, SyncResult};
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{SyncContext, TargetFields};
use mobilesync_protocol::{Record, RestRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Discriminator persisted in the target configuration.
pub const METADATA_TYPE: &str = "metadata";

/// Fetches an object description as a single record whose id is the object
/// type. Descriptions are never ghosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSyncDownTarget {
    #[serde(flatten)]
    fields: TargetFields,
    sobject_type: String,
}

impl MetadataSyncDownTarget {
    /// Creates a target.
    pub fn new(sobject_type: impl Into<String>) -> Self {
        Self {
            fields: TargetFields::default(),
            sobject_type: sobject_type.into(),
        }
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

impl DownTarget for MetadataSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, METADATA_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        _max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        let response = ctx.send(&RestRequest::describe(ctx.api_version, &self.sobject_type))?;
        let record = Record::from_value(response.body)
            .ok_or_else(|| SyncError::Protocol("describe response is not an object".into()))?
            .with(&self.fields.id_field_name, self.sobject_type.clone());
        Ok(FetchPage::complete(vec![record]))
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
        _ctx: &SyncContext<'_>,
        _soup: &str,
        local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>> {
        Ok(local_ids.clone())
    }

    fn clean_ghosts(
        &self,
        _ctx: &SyncContext<'_>,
        _soup: &str,
        _sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        Ok(0)
    }
}
