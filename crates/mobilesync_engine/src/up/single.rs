//! Record by record sync-up over the plain REST endpoints.

use super::{build_request, ensure_local_id, UpTarget, UpTargetConfig};
use crate::config::{MergeMode, SyncOptions};
use crate::error::{SyncError, SyncResult};
use crate::registry::{self, UP_DISCRIMINATOR};
use crate::target::{apply_changes, LocalChange, SyncContext, TargetFields};
use mobilesync_protocol::{
    Record, RecordModDate, RecordResponse, RequestBuilder, RequestType, RestRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Implementation name persisted in the target configuration.
pub const SINGLE_IMPLEMENTATION: &str = "single";

/// Uploads one record per REST call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSyncUpTarget {
    #[serde(flatten)]
    config: UpTargetConfig,
}

impl SingleSyncUpTarget {
    /// Creates a target.
    pub fn new(config: UpTargetConfig) -> Self {
        Self { config }
    }

    /// Shared configuration.
    pub fn config(&self) -> &UpTargetConfig {
        &self.config
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    fn send(
        &self,
        ctx: &SyncContext<'_>,
        builder: &RequestBuilder<'_>,
        record: &Record,
    ) -> SyncResult<Option<(RequestType, RecordResponse)>> {
        let Some(request) = build_request(builder, record)? else {
            return Ok(None);
        };
        let response = ctx.send_unchecked(&request.as_rest_request(ctx.api_version))?;
        debug!(
            id = request.reference_id.as_str(),
            kind = ?request.request_type,
            status = response.status,
            "sent record"
        );
        Ok(Some((request.request_type, RecordResponse::from_rest_response(&response))))
    }

    fn sync_up_record(
        &self,
        ctx: &SyncContext<'_>,
        options: &SyncOptions,
        record: Record,
    ) -> SyncResult<Option<LocalChange>> {
        let id_field = self.config.fields.id_field_name.as_str();
        let builder = self.config.request_builder(options);
        let record = ensure_local_id(record, id_field);
        if !record.is_dirty() {
            return Ok(None);
        }
        if record.dirty_state().is_local_only() {
            return Ok(Some(LocalChange::Purge(record)));
        }

        let Some((request_type, response)) = self.send(ctx, &builder, &record)? else {
            return Ok(None);
        };
        let change = match request_type {
            RequestType::Delete if response.success || response.record_does_not_exist => {
                LocalChange::Purge(record)
            }
            RequestType::Update
                if response.record_does_not_exist && options.merge_mode == MergeMode::Overwrite =>
            {
                let state = record.dirty_state().recreated();
                let recreated = record.with_dirty_state(state);
                match self.send(ctx, &builder, &recreated)? {
                    Some((_, created)) if created.success => {
                        LocalChange::Save(with_server_id(recreated, id_field, &created).cleaned())
                    }
                    Some((_, created)) => {
                        LocalChange::Save(recreated.with_last_error(created.error_message()))
                    }
                    None => return Ok(None),
                }
            }
            _ if response.success => {
                LocalChange::Save(with_server_id(record, id_field, &response).cleaned())
            }
            _ => LocalChange::Save(record.with_last_error(response.error_message())),
        };
        if let LocalChange::Save(saved) = &change {
            if let Some(error) = saved.last_error() {
                warn!(id = saved.id(id_field), error, "record not synced");
            }
        }
        Ok(Some(change))
    }
}

fn with_server_id(record: Record, id_field: &str, response: &RecordResponse) -> Record {
    match &response.id {
        Some(id) => record.with(id_field, id.clone()),
        None => record,
    }
}

impl UpTarget for SingleSyncUpTarget {
    fn fields(&self) -> &TargetFields {
        &self.config.fields
    }

    fn max_batch_size(&self) -> usize {
        1
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, UP_DISCRIMINATOR, SINGLE_IMPLEMENTATION)
    }

    fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        options: &SyncOptions,
        records: Vec<Record>,
    ) -> SyncResult<()> {
        let id_field = self.config.fields.id_field_name.as_str();
        for record in records {
            if let Some(change) = self.sync_up_record(ctx, options, record)? {
                apply_changes(ctx.store, soup, id_field, vec![change])?;
            }
        }
        Ok(())
    }

    fn are_newer_than_server(
        &self,
        ctx: &SyncContext<'_>,
        records: &[Record],
    ) -> SyncResult<Vec<bool>> {
        let fields = &self.config.fields;
        let mut result = Vec::with_capacity(records.len());
        for record in records {
            if record.is_locally_created() {
                result.push(true);
                continue;
            }
            let id = record.id(&fields.id_field_name);
            let (Some(object_type), Some(id)) = (record.object_type(), id) else {
                result.push(true);
                continue;
            };
            let request = RestRequest::retrieve(
                ctx.api_version,
                object_type,
                id,
                &[fields.id_field_name.clone(), fields.modification_date_field_name.clone()],
            );
            let response = ctx.send_unchecked(&request)?;
            let remote = match response.status {
                404 => RecordModDate::new(None, true),
                _ if response.is_success() => RecordModDate::new(
                    response
                        .body
                        .get(&fields.modification_date_field_name)
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    false,
                ),
                _ => return Err(SyncError::server(&response)),
            };
            result.push(
                record
                    .mod_date(&fields.modification_date_field_name)
                    .is_newer_than(&remote),
            );
        }
        Ok(result)
    }
}
