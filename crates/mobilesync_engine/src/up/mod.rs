//! Sync-up targets.
//!
//! A sync-up target receives locally dirty records, turns them into record
//! requests, sends them and reconciles the answers back into the store. The
//! concrete kinds differ only in how requests travel:
//!
//! - [`SingleSyncUpTarget`] - one REST call per record
//! - [`BatchSyncUpTarget`] - composite requests of up to 25 records
//! - [`CollectionSyncUpTarget`] - collection requests of up to 200 records
//! - [`ParentChildrenSyncUpTarget`] - one parent and its children per
//!   composite request

mod batch;
mod collection;
mod parent_children;
mod single;

pub use batch::{BatchSyncUpTarget, BATCH_IMPLEMENTATION};
pub use collection::{CollectionSyncUpTarget, COLLECTION_IMPLEMENTATION};
pub use parent_children::{ParentChildrenSyncUpTarget, PARENT_CHILDREN_IMPLEMENTATION};
pub use single::{SingleSyncUpTarget, SINGLE_IMPLEMENTATION};

use crate::config::{MergeMode, SyncOptions};
use crate::error::{SyncError, SyncResult};
use crate::target::{self, LocalChange, SyncContext, TargetFields};
use mobilesync_protocol::soql::{in_predicate, SoqlBuilder};
use mobilesync_protocol::{
    create_local_id, is_local_id, update_references, Record, RecordModDate, RecordRequest,
    RecordResponse, RequestBuilder, RequestType,
};
use mobilesync_store::EntryId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Ids per freshness query.
const MAX_IDS_PER_FRESHNESS_QUERY: usize = 200;

/// Behavior shared by every sync-up target.
pub trait UpTarget: Send + Sync + fmt::Debug {
    /// Id and modification date field names.
    fn fields(&self) -> &TargetFields;

    /// Maximum records handed to [`UpTarget::sync_up_records`] at once.
    fn max_batch_size(&self) -> usize;

    /// Persisted configuration, discriminator included.
    fn to_config(&self) -> SyncResult<Value>;

    /// Uploads records and reconciles the outcome into `soup`.
    ///
    /// # Errors
    ///
    /// Configuration errors (too many records, missing field list) are
    /// raised before any request is sent. Per-record server errors are
    /// stored on the records instead of being returned.
    fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        options: &SyncOptions,
        records: Vec<Record>,
    ) -> SyncResult<()>;

    /// For each record, whether the local copy is at least as recent as the
    /// server's.
    fn are_newer_than_server(
        &self,
        ctx: &SyncContext<'_>,
        records: &[Record],
    ) -> SyncResult<Vec<bool>>;

    /// Whether the local copy of one record is at least as recent as the
    /// server's.
    fn is_newer_than_server(&self, ctx: &SyncContext<'_>, record: &Record) -> SyncResult<bool> {
        Ok(self
            .are_newer_than_server(ctx, std::slice::from_ref(record))?
            .first()
            .copied()
            .unwrap_or(true))
    }

    /// Entry ids of the records to upload, in upload order.
    fn dirty_entry_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> SyncResult<Vec<EntryId>> {
        target::dirty_entry_ids(ctx.store, soup)
    }
}

/// Any sync-up target.
#[derive(Debug, Clone)]
pub enum SyncUpTarget {
    /// One REST call per record.
    Single(SingleSyncUpTarget),
    /// Composite requests.
    Batch(BatchSyncUpTarget),
    /// Collection requests.
    Collection(CollectionSyncUpTarget),
    /// Parent with children.
    ParentChildren(ParentChildrenSyncUpTarget),
    /// Application supplied target.
    Custom(Arc<dyn UpTarget>),
}

impl SyncUpTarget {
    /// The target behind the variant.
    pub fn as_target(&self) -> &dyn UpTarget {
        match self {
            SyncUpTarget::Single(t) => t,
            SyncUpTarget::Batch(t) => t,
            SyncUpTarget::Collection(t) => t,
            SyncUpTarget::ParentChildren(t) => t,
            SyncUpTarget::Custom(t) => t.as_ref(),
        }
    }
}

impl From<SingleSyncUpTarget> for SyncUpTarget {
    fn from(target: SingleSyncUpTarget) -> Self {
        SyncUpTarget::Single(target)
    }
}

impl From<BatchSyncUpTarget> for SyncUpTarget {
    fn from(target: BatchSyncUpTarget) -> Self {
        SyncUpTarget::Batch(target)
    }
}

impl From<CollectionSyncUpTarget> for SyncUpTarget {
    fn from(target: CollectionSyncUpTarget) -> Self {
        SyncUpTarget::Collection(target)
    }
}

impl From<ParentChildrenSyncUpTarget> for SyncUpTarget {
    fn from(target: ParentChildrenSyncUpTarget) -> Self {
        SyncUpTarget::ParentChildren(target)
    }
}

/// Configuration shared by the record based sync-up targets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpTargetConfig {
    /// Id and modification date field names.
    #[serde(flatten)]
    pub fields: TargetFields,
    /// Fields sent on create; the sync's field list when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_fieldlist: Option<Vec<String>>,
    /// Fields sent on update; the sync's field list when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_fieldlist: Option<Vec<String>>,
    /// Field holding an external id; creates become upserts when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
}

impl UpTargetConfig {
    /// Creates a configuration with default field names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the id and modification date field names.
    pub fn with_fields(mut self, fields: TargetFields) -> Self {
        self.fields = fields;
        self
    }

    /// Sets the fields sent on create.
    pub fn with_create_fieldlist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.create_fieldlist = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the fields sent on update.
    pub fn with_update_fieldlist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_fieldlist = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the external id field.
    pub fn with_external_id_field_name(mut self, field: impl Into<String>) -> Self {
        self.external_id_field_name = Some(field.into());
        self
    }

    pub(crate) fn request_builder<'a>(&'a self, options: &'a SyncOptions) -> RequestBuilder<'a> {
        RequestBuilder {
            id_field_name: &self.fields.id_field_name,
            modification_date_field_name: &self.fields.modification_date_field_name,
            external_id_field_name: self.external_id_field_name.as_deref(),
            create_fieldlist: self.create_fieldlist.as_deref().unwrap_or(&options.fieldlist),
            update_fieldlist: self.update_fieldlist.as_deref().unwrap_or(&options.fieldlist),
        }
    }
}

/// Builds the request for a record, rejecting creates and updates that
/// would carry no field list.
pub(crate) fn build_request(
    builder: &RequestBuilder<'_>,
    record: &Record,
) -> SyncResult<Option<RecordRequest>> {
    let request = builder.build(record)?;
    if let Some(req) = &request {
        let fieldlist = match req.request_type {
            RequestType::Create | RequestType::Upsert => builder.create_fieldlist,
            RequestType::Update => builder.update_fieldlist,
            RequestType::Delete => return Ok(request),
        };
        if fieldlist.is_empty() {
            return Err(SyncError::config(format!(
                "no field list for {:?} of {}",
                req.request_type, req.reference_id
            )));
        }
    }
    Ok(request)
}

/// Gives a local id to a record that has none yet.
pub(crate) fn ensure_local_id(record: Record, id_field_name: &str) -> Record {
    if record.id(id_field_name).is_some() {
        record
    } else {
        record.with(id_field_name, create_local_id())
    }
}

/// Outcome of reconciling one record with its response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reconciled {
    /// Persist a change now.
    Change(LocalChange),
    /// Marked for creation; send again in the re-run.
    Rerun(Record),
    /// Nothing was sent for this record.
    Untouched,
}

/// Decides the local fate of a record from its response.
pub(crate) fn reconcile(
    record: Record,
    response: Option<&RecordResponse>,
    server_ids: &HashMap<String, String>,
    id_field_name: &str,
    merge_mode: MergeMode,
    is_rerun: bool,
) -> Reconciled {
    let state = record.dirty_state();
    if !record.is_dirty() {
        return Reconciled::Untouched;
    }
    if state.deleted {
        let gone = state.created
            || response.is_some_and(|r| r.success || r.record_does_not_exist);
        return if gone {
            Reconciled::Change(LocalChange::Purge(record))
        } else {
            let error = response.map(RecordResponse::error_message).unwrap_or_default();
            Reconciled::Change(LocalChange::Save(record.with_last_error(error)))
        };
    }
    match response {
        Some(r) if r.success => Reconciled::Change(LocalChange::Save(
            update_references(record, id_field_name, server_ids).cleaned(),
        )),
        Some(r) if r.record_does_not_exist && merge_mode == MergeMode::Overwrite && !is_rerun => {
            Reconciled::Rerun(record.with_dirty_state(state.recreated()))
        }
        Some(r) => Reconciled::Change(LocalChange::Save(record.with_last_error(r.error_message()))),
        None => Reconciled::Change(LocalChange::Save(
            record.with_last_error("no response for record"),
        )),
    }
}

/// Remote modification dates of `records`, one query per object type.
pub(crate) fn fetch_last_modified_dates(
    ctx: &SyncContext<'_>,
    fields: &TargetFields,
    records: &[Record],
) -> SyncResult<HashMap<String, RecordModDate>> {
    let mut ids_by_type: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.is_locally_created()) {
        let id = record.id(&fields.id_field_name);
        if let (Some(object_type), Some(id)) = (record.object_type(), id) {
            if !is_local_id(id) {
                ids_by_type.entry(object_type).or_default().push(id);
            }
        }
    }
    let mut dates = HashMap::new();
    for (object_type, ids) in ids_by_type {
        for chunk in ids.chunks(MAX_IDS_PER_FRESHNESS_QUERY) {
            let soql = SoqlBuilder::with_fields([
                fields.id_field_name.as_str(),
                fields.modification_date_field_name.as_str(),
            ])
            .from(object_type)
            .where_clause(in_predicate(&fields.id_field_name, chunk))
            .build()?;
            for remote in ctx.query_all(&soql)? {
                if let Some(id) = remote.id(&fields.id_field_name) {
                    let ts = remote
                        .get_str(&fields.modification_date_field_name)
                        .map(str::to_string);
                    dates.insert(id.to_string(), RecordModDate::new(ts, false));
                }
            }
        }
    }
    Ok(dates)
}

/// Freshness by query: locally created records always pass; records the
/// server no longer has count as deleted remotely.
pub(crate) fn are_newer_by_query(
    ctx: &SyncContext<'_>,
    fields: &TargetFields,
    records: &[Record],
) -> SyncResult<Vec<bool>> {
    let remote = fetch_last_modified_dates(ctx, fields, records)?;
    let deleted = RecordModDate::new(None, true);
    Ok(records
        .iter()
        .map(|record| {
            if record.is_locally_created() {
                return true;
            }
            let remote_date = record
                .id(&fields.id_field_name)
                .and_then(|id| remote.get(id))
                .unwrap_or(&deleted);
            record
                .mod_date(&fields.modification_date_field_name)
                .is_newer_than(remote_date)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
    use mobilesync_protocol::{DirtyState, RestResponse};
    use mobilesync_store::MemoryStore;
    use serde_json::json;

    const CREATED: DirtyState = DirtyState { created: true, updated: false, deleted: false };
    const DELETED: DirtyState = DirtyState { created: false, updated: false, deleted: true };

    fn updated(id: &str) -> Record {
        Record::new()
            .with_object_type("Account")
            .with(ID, id)
            .with_dirty_state(DirtyState { updated: true, ..DirtyState::CLEAN })
    }

    #[test]
    fn reconcile_success_resolves_reference() {
        let record = updated("local_1").with_dirty_state(CREATED);
        let mut ids = HashMap::new();
        ids.insert("local_1".to_string(), "001A".to_string());
        let response = RecordResponse::succeeded(Some("001A".into()));
        match reconcile(record, Some(&response), &ids, ID, MergeMode::Overwrite, false) {
            Reconciled::Change(LocalChange::Save(saved)) => {
                assert_eq!(saved.id(ID), Some("001A"));
                assert!(saved.is_clean());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reconcile_missing_record() {
        let gone = RecordResponse {
            record_does_not_exist: true,
            error: Some(json!("gone")),
            ..RecordResponse::default()
        };
        let ids = HashMap::new();
        match reconcile(updated("001"), Some(&gone), &ids, ID, MergeMode::Overwrite, false) {
            Reconciled::Rerun(r) => assert!(r.is_locally_created()),
            other => panic!("unexpected {other:?}"),
        }
        match reconcile(updated("001"), Some(&gone), &ids, ID, MergeMode::Overwrite, true) {
            Reconciled::Change(LocalChange::Save(r)) => assert_eq!(r.last_error(), Some("gone")),
            other => panic!("unexpected {other:?}"),
        }
        match reconcile(updated("001"), Some(&gone), &ids, ID, MergeMode::LeaveIfChanged, false) {
            Reconciled::Change(LocalChange::Save(r)) => assert!(r.is_dirty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reconcile_deletes() {
        let ids = HashMap::new();
        let deleted = updated("001").with_dirty_state(DELETED);
        let ok = RecordResponse::succeeded(None);
        assert!(matches!(
            reconcile(deleted.clone(), Some(&ok), &ids, ID, MergeMode::Overwrite, false),
            Reconciled::Change(LocalChange::Purge(_))
        ));
        let failed = RecordResponse::failed(json!("locked"));
        match reconcile(deleted, Some(&failed), &ids, ID, MergeMode::Overwrite, false) {
            Reconciled::Change(LocalChange::Save(r)) => {
                assert_eq!(r.last_error(), Some("locked"));
                assert!(r.is_locally_deleted());
            }
            other => panic!("unexpected {other:?}"),
        }
        let local_only = updated("local_1").with_dirty_state(DirtyState {
            created: true,
            updated: false,
            deleted: true,
        });
        assert!(matches!(
            reconcile(local_only, None, &ids, ID, MergeMode::Overwrite, false),
            Reconciled::Change(LocalChange::Purge(_))
        ));
    }

    #[test]
    fn clean_records_are_untouched() {
        let clean = Record::new().with(ID, "001").cleaned();
        assert_eq!(
            reconcile(clean, None, &HashMap::new(), ID, MergeMode::Overwrite, false),
            Reconciled::Untouched
        );
    }

    #[test]
    fn missing_field_list_is_a_config_error() {
        let config = UpTargetConfig::new();
        let options = SyncOptions::new();
        let builder = config.request_builder(&options);
        let err = build_request(&builder, &updated("001")).unwrap_err();
        assert!(err.is_config());

        let deleted = updated("001").with_dirty_state(DELETED);
        assert!(build_request(&builder, &deleted).unwrap().is_some());
    }

    #[test]
    fn local_ids_are_assigned_once() {
        let record = ensure_local_id(Record::new(), ID);
        let id = record.id(ID).unwrap().to_string();
        assert!(is_local_id(&id));
        assert_eq!(ensure_local_id(record, ID).id(ID), Some(id.as_str()));
    }

    #[test]
    fn freshness_by_query() {
        let store = MemoryStore::new();
        let client = MockRestClient::new(|_| {
            RestResponse::new(
                200,
                json!({ "totalSize": 1, "done": true, "records": [
                    { "Id": "001", "LastModifiedDate": "2024-03-02T00:00:00.000Z" }
                ]}),
            )
        });
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let fields = TargetFields::default();
        let stale = updated("001").with(LAST_MODIFIED_DATE, "2024-03-01T00:00:00.000Z");
        let fresh = updated("001").with(LAST_MODIFIED_DATE, "2024-03-03T00:00:00.000Z");
        let gone = updated("002").with(LAST_MODIFIED_DATE, "2024-03-01T00:00:00.000Z");
        let created = updated("local_5").with_dirty_state(CREATED);
        let result = are_newer_by_query(&ctx, &fields, &[stale, fresh, gone, created]).unwrap();
        assert_eq!(result, vec![false, true, true, true]);
        assert_eq!(client.request_count(), 1);
        let soql = client.requests()[0].query_param("q").unwrap();
        assert_eq!(
            soql,
            "SELECT Id, LastModifiedDate FROM Account WHERE Id IN ('001', '001', '002')"
        );
    }
}
