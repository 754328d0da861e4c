//! Briefcase sync-down.
//!
//! The priming records index lists, across object types, the ids a user
//! should have offline. Each page of ids is then read with collection
//! retrieves per object type, and every record lands in the soup of its
//! type.

use super::{with_sync_fields, DownTarget, FetchCursor, FetchPage};
use crate::error::{SyncError, SyncResult};
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{self, prepare_for_save, SyncContext, TargetFields};
use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
use mobilesync_protocol::{timestamp, Record, RestRequest, RestResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Discriminator persisted in the target configuration.
pub const BRIEFCASE_TYPE: &str = "briefcase";

/// Default number of ids per collection retrieve.
pub const DEFAULT_COUNT_IDS_PER_RETRIEVE: usize = 500;

/// Upper bound accepted by the collection retrieve endpoint.
pub const MAX_COUNT_IDS_PER_RETRIEVE: usize = 2000;

fn default_count_ids_per_retrieve() -> usize {
    DEFAULT_COUNT_IDS_PER_RETRIEVE
}

fn default_id_field_name() -> String {
    ID.to_string()
}

fn default_modification_date_field_name() -> String {
    LAST_MODIFIED_DATE.to_string()
}

/// One object type of a briefcase and the soup it is stored in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefcaseObjectInfo {
    /// Local soup.
    pub soup_name: String,
    /// Server object type.
    pub sobject_type: String,
    /// Fields to fetch.
    pub fieldlist: Vec<String>,
    /// Id field name.
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    /// Modification date field name.
    #[serde(default = "default_modification_date_field_name")]
    pub modification_date_field_name: String,
}

impl BriefcaseObjectInfo {
    /// Creates object info with default field names.
    pub fn new<I, S>(
        soup_name: impl Into<String>,
        sobject_type: impl Into<String>,
        fieldlist: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            soup_name: soup_name.into(),
            sobject_type: sobject_type.into(),
            fieldlist: fieldlist.into_iter().map(Into::into).collect(),
            id_field_name: default_id_field_name(),
            modification_date_field_name: default_modification_date_field_name(),
        }
    }

    fn fields(&self) -> TargetFields {
        TargetFields::new(&self.id_field_name, &self.modification_date_field_name)
    }
}

/// One page of the priming index.
#[derive(Debug, Default)]
struct PrimingPage {
    ids: BTreeMap<String, Vec<String>>,
    relay_token: Option<String>,
}

impl PrimingPage {
    fn parse(response: &RestResponse) -> SyncResult<Self> {
        let body = response.as_object()?;
        let mut ids: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let briefcases = body
            .get("primingRecords")
            .and_then(Value::as_object)
            .ok_or_else(|| SyncError::Protocol("priming response without primingRecords".into()))?;
        for by_type in briefcases.values().filter_map(Value::as_object) {
            for (object_type, entries) in by_type {
                let entries = entries.as_array().map(Vec::as_slice).unwrap_or_default();
                ids.entry(object_type.clone()).or_default().extend(
                    entries
                        .iter()
                        .filter_map(|e| e.get("id").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
        }
        let relay_token = body
            .get("relayToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(Self { ids, relay_token })
    }
}

/// Fetches the records listed by the briefcase priming index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefcaseSyncDownTarget {
    infos: Vec<BriefcaseObjectInfo>,
    #[serde(default = "default_count_ids_per_retrieve")]
    count_ids_per_retrieve: usize,
    #[serde(skip)]
    fields: TargetFields,
}

impl BriefcaseSyncDownTarget {
    /// Creates a target.
    pub fn new(infos: Vec<BriefcaseObjectInfo>) -> Self {
        Self {
            infos,
            count_ids_per_retrieve: DEFAULT_COUNT_IDS_PER_RETRIEVE,
            fields: TargetFields::default(),
        }
    }

    /// Sets the number of ids per collection retrieve, at most 2000.
    pub fn with_count_ids_per_retrieve(mut self, count: usize) -> Self {
        self.count_ids_per_retrieve = count.clamp(1, MAX_COUNT_IDS_PER_RETRIEVE);
        self
    }

    /// Object types of the briefcase.
    pub fn infos(&self) -> &[BriefcaseObjectInfo] {
        &self.infos
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        let target: Self = serde_json::from_value(value.clone())?;
        let count = target.count_ids_per_retrieve;
        Ok(target.with_count_ids_per_retrieve(count))
    }

    fn info_for(&self, object_type: &str) -> Option<&BriefcaseObjectInfo> {
        self.infos.iter().find(|i| i.sobject_type == object_type)
    }

    fn priming_page(
        &self,
        ctx: &SyncContext<'_>,
        relay_token: Option<&str>,
        changed_after: i64,
    ) -> SyncResult<PrimingPage> {
        let request = RestRequest::priming_records(
            ctx.api_version,
            relay_token,
            (changed_after > 0).then_some(changed_after),
        );
        PrimingPage::parse(&ctx.send(&request)?)
    }

    fn retrieve(
        &self,
        ctx: &SyncContext<'_>,
        info: &BriefcaseObjectInfo,
        ids: &[String],
    ) -> SyncResult<Vec<Record>> {
        let fields = with_sync_fields(&info.fieldlist, &info.fields());
        let mut records = Vec::with_capacity(ids.len());
        for slice in ids.chunks(self.count_ids_per_retrieve) {
            let request = RestRequest::collection_retrieve(
                ctx.api_version,
                &info.sobject_type,
                slice,
                &fields,
            );
            let response = ctx.send(&request)?;
            records.extend(
                response
                    .as_array()?
                    .iter()
                    .filter_map(|v| Record::from_value(v.clone()))
                    .map(|r| r.with_object_type(&info.sobject_type)),
            );
        }
        Ok(records)
    }

    fn fetch(
        &self,
        ctx: &SyncContext<'_>,
        relay_token: Option<&str>,
        changed_after: i64,
    ) -> SyncResult<FetchPage> {
        let page = self.priming_page(ctx, relay_token, changed_after)?;
        let mut records = Vec::new();
        for info in &self.infos {
            if let Some(ids) = page.ids.get(&info.sobject_type).filter(|ids| !ids.is_empty()) {
                records.extend(self.retrieve(ctx, info, ids)?);
            }
        }
        debug!(
            fetched = records.len(),
            more = page.relay_token.is_some(),
            "fetched briefcase page"
        );
        Ok(FetchPage {
            records,
            total_size: -1,
            cursor: page.relay_token.map(|token| FetchCursor::Relay { token, changed_after }),
        })
    }

    /// Every id of the index, by object type.
    fn all_remote_ids(
        &self,
        ctx: &SyncContext<'_>,
    ) -> SyncResult<BTreeMap<String, BTreeSet<String>>> {
        let mut remote: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut relay_token: Option<String> = None;
        loop {
            let page = self.priming_page(ctx, relay_token.as_deref(), 0)?;
            for (object_type, ids) in page.ids {
                remote.entry(object_type).or_default().extend(ids);
            }
            match page.relay_token {
                Some(token) => relay_token = Some(token),
                None => return Ok(remote),
            }
        }
    }
}

impl DownTarget for BriefcaseSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, BRIEFCASE_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        self.fetch(ctx, None, max_timestamp)
    }

    fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        cursor: &FetchCursor,
    ) -> SyncResult<Option<FetchPage>> {
        match cursor {
            FetchCursor::Relay {
                token,
                changed_after,
            } => Ok(Some(self.fetch(ctx, Some(token), *changed_after)?)),
            _ => Ok(None),
        }
    }

    fn remote_ids(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        _local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>> {
        Ok(self.all_remote_ids(ctx)?.into_values().flatten().collect())
    }

    /// Runs the whole index once, then removes ghosts soup by soup.
    fn clean_ghosts(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        let remote = self.all_remote_ids(ctx)?;
        let empty = BTreeSet::new();
        let mut removed = 0;
        for info in &self.infos {
            let scope = target::sync_scope(ctx.store, &info.soup_name, sync_id)?;
            let (soup, id_field) = (info.soup_name.as_str(), info.id_field_name.as_str());
            let local = target::non_dirty_record_ids(ctx.store, soup, id_field, scope)?;
            let remote_ids = remote.get(&info.sobject_type).unwrap_or(&empty);
            let ghosts = target::ghost_ids(&local, remote_ids);
            let count = target::delete_records_by_id(ctx.store, soup, id_field, &ghosts)?;
            if count > 0 {
                info!(soup = info.soup_name.as_str(), removed = count, "removed ghosts");
            }
            removed += count;
        }
        Ok(removed)
    }

    /// Saves each record into the soup of its object type, in one
    /// transaction.
    fn save_records(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        records: Vec<Record>,
        sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        let mut routed = Vec::with_capacity(records.len());
        for record in records {
            match record.object_type().and_then(|t| self.info_for(t)) {
                Some(info) => routed.push((info, record)),
                None => {
                    warn!(object_type = ?record.object_type(), "no soup for record type, skipped")
                }
            }
        }
        let count = routed.len();
        let mut pending = Some(routed);
        ctx.store.transaction(&mut |writer| {
            for (info, record) in pending.take().unwrap_or_default() {
                let record = prepare_for_save(record, sync_id);
                writer.upsert(&info.soup_name, record, Some(&info.id_field_name))?;
            }
            Ok(())
        })?;
        debug!(count, "saved briefcase records");
        Ok(count)
    }

    fn latest_modification_timestamp(&self, records: &[Record]) -> i64 {
        records
            .iter()
            .filter_map(|r| {
                let info = self.info_for(r.object_type()?)?;
                timestamp::parse_millis(r.get_str(&info.modification_date_field_name)?).ok()
            })
            .max()
            .unwrap_or(-1)
    }

    fn dirty_record_ids(&self, ctx: &SyncContext<'_>, _soup: &str) -> SyncResult<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for info in &self.infos {
            ids.extend(target::dirty_record_ids(ctx.store, &info.soup_name, &info.id_field_name)?);
        }
        Ok(ids)
    }

    fn record_id<'r>(&self, record: &'r Record) -> Option<&'r str> {
        let info = self.info_for(record.object_type()?)?;
        record.id(&info.id_field_name)
    }
}
