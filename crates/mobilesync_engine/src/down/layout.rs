//! UI layout sync-down.

use super::{DownTarget, FetchCursor, FetchPage};
use crate::error::{SyncError, SyncResult};
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{SyncContext, TargetFields};
use mobilesync_protocol::{Record, RestRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Discriminator persisted in the target configuration.
pub const LAYOUT_TYPE: &str = "layout";

/// Fetches one UI layout as a single record. Layouts are never ghosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSyncDownTarget {
    #[serde(flatten)]
    fields: TargetFields,
    object_api_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    form_factor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    layout_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record_type_id: Option<String>,
}

impl LayoutSyncDownTarget {
    /// Creates a target for an object's default layout.
    pub fn new(object_api_name: impl Into<String>) -> Self {
        Self {
            fields: TargetFields::default(),
            object_api_name: object_api_name.into(),
            form_factor: None,
            layout_type: None,
            mode: None,
            record_type_id: None,
        }
    }

    /// Sets the form factor, e.g. `Medium`.
    pub fn with_form_factor(mut self, form_factor: impl Into<String>) -> Self {
        self.form_factor = Some(form_factor.into());
        self
    }

    /// Sets the layout type, e.g. `Full` or `Compact`.
    pub fn with_layout_type(mut self, layout_type: impl Into<String>) -> Self {
        self.layout_type = Some(layout_type.into());
        self
    }

    /// Sets the mode, e.g. `View` or `Edit`.
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Sets the record type id.
    pub fn with_record_type_id(mut self, record_type_id: impl Into<String>) -> Self {
        self.record_type_id = Some(record_type_id.into());
        self
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Local id of the layout: the present parts joined with `-`.
    pub fn layout_id(&self) -> String {
        [
            Some(self.object_api_name.as_str()),
            self.form_factor.as_deref(),
            self.layout_type.as_deref(),
            self.mode.as_deref(),
            self.record_type_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("-")
    }
}

impl DownTarget for LayoutSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, LAYOUT_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        _max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        let request = RestRequest::layout(
            ctx.api_version,
            &self.object_api_name,
            self.form_factor.as_deref(),
            self.layout_type.as_deref(),
            self.mode.as_deref(),
            self.record_type_id.as_deref(),
        );
        let response = ctx.send(&request)?;
        let record = Record::from_value(response.body)
            .ok_or_else(|| SyncError::Protocol("layout response is not an object".into()))?
            .with(&self.fields.id_field_name, self.layout_id());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::record::ID;
    use mobilesync_protocol::RestResponse;
    use mobilesync_store::MemoryStore;
    use serde_json::json;

    #[test]
    fn layout_id_skips_missing_parts() {
        assert_eq!(LayoutSyncDownTarget::new("Account").layout_id(), "Account");
        let full = LayoutSyncDownTarget::new("Account")
            .with_form_factor("Medium")
            .with_layout_type("Compact")
            .with_mode("Edit")
            .with_record_type_id("012");
        assert_eq!(full.layout_id(), "Account-Medium-Compact-Edit-012");
        let partial = LayoutSyncDownTarget::new("Account").with_mode("View");
        assert_eq!(partial.layout_id(), "Account-View");
    }

    #[test]
    fn fetches_one_layout() {
        let store = MemoryStore::new();
        let client = MockRestClient::always(RestResponse::new(200, json!({ "sections": [] })));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target = LayoutSyncDownTarget::new("Account").with_layout_type("Full");
        let page = target.start_fetch(&ctx, "layouts", 0).unwrap();
        assert_eq!(page.records[0].id(ID), Some("Account-Full"));
        let request = &client.requests()[0];
        assert_eq!(request.path_only(), "/services/data/v60.0/ui-api/layout/Account");
        assert_eq!(request.query_param("layoutType").as_deref(), Some("Full"));
    }
}
