//! Sync-down targets.
//!
//! A sync-down target pulls remote records page by page and later finds
//! local records the server no longer has (ghosts). Every fetch starts with
//! [`DownTarget::start_fetch`], which takes the latest modification time
//! already seen (0 or less for a full fetch), and continues with
//! [`DownTarget::continue_fetch`] until the returned page has no cursor.

mod briefcase;
mod layout;
mod metadata;
mod mru;
mod parent_children;
mod refresh;
mod soql;
mod sosl;

pub use briefcase::{BriefcaseObjectInfo, BriefcaseSyncDownTarget, BRIEFCASE_TYPE};
pub use layout::{LayoutSyncDownTarget, LAYOUT_TYPE};
pub use metadata::{MetadataSyncDownTarget, METADATA_TYPE};
pub use mru::{MruSyncDownTarget, MRU_TYPE};
pub use parent_children::{ParentChildrenSyncDownTarget, PARENT_CHILDREN_TYPE};
pub use refresh::{RefreshSyncDownTarget, REFRESH_TYPE};
pub use soql::{SoqlSyncDownTarget, SOQL_TYPE};
pub use sosl::{SoslSyncDownTarget, SOSL_TYPE};

use crate::error::SyncResult;
use crate::target::{self, QueryPage, SyncContext, TargetFields};
use mobilesync_protocol::Record;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Where a fetch resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCursor {
    /// Server supplied URL of the next query page.
    Url(String),
    /// Next page of locally known ids.
    Page {
        /// Zero based page index.
        index: usize,
        /// Modification time filter, 0 or less for none.
        max_timestamp: i64,
    },
    /// Continuation token of an index API.
    Relay {
        /// Token returned with the previous page.
        token: String,
        /// Modification time filter in epoch milliseconds, 0 or less for none.
        changed_after: i64,
    },
}

/// One page of fetched records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchPage {
    /// Records of this page.
    pub records: Vec<Record>,
    /// Total records of the fetch, -1 when unknown.
    pub total_size: i64,
    /// Where the next page starts; `None` on the last page.
    pub cursor: Option<FetchCursor>,
}

impl FetchPage {
    /// A single page holding every record.
    pub fn complete(records: Vec<Record>) -> Self {
        Self {
            total_size: records.len() as i64,
            records,
            cursor: None,
        }
    }

    /// A SOQL query page, continued through its next records URL.
    pub fn from_query(page: QueryPage) -> Self {
        Self {
            records: page.records,
            total_size: page.total_size,
            cursor: page.next_records_url.map(FetchCursor::Url),
        }
    }
}

/// Behavior shared by every sync-down target.
pub trait DownTarget: Send + Sync + fmt::Debug {
    /// Id and modification date field names.
    fn fields(&self) -> &TargetFields;

    /// Persisted configuration, discriminator included.
    fn to_config(&self) -> SyncResult<Value>;

    /// Fetches the first page; `max_timestamp > 0` restricts the fetch to
    /// records modified after it.
    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        max_timestamp: i64,
    ) -> SyncResult<FetchPage>;

    /// Fetches the page at `cursor`, or `None` when the fetch is over.
    fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        cursor: &FetchCursor,
    ) -> SyncResult<Option<FetchPage>>;

    /// Which of `local_ids` still exist on the server.
    fn remote_ids(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>>;

    /// Deletes local records the server no longer has and returns how many
    /// were removed. Locally modified records are never candidates.
    fn clean_ghosts(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        let id_field = self.fields().id_field_name.as_str();
        let scope = target::sync_scope(ctx.store, soup, sync_id)?;
        let local = target::non_dirty_record_ids(ctx.store, soup, id_field, scope)?;
        if local.is_empty() {
            return Ok(0);
        }
        let remote = self.remote_ids(ctx, soup, &local)?;
        let ghosts = target::ghost_ids(&local, &remote);
        let removed = target::delete_records_by_id(ctx.store, soup, id_field, &ghosts)?;
        if removed > 0 {
            info!(soup, removed, "removed ghosts");
        }
        Ok(removed)
    }

    /// Saves a fetched page in one transaction.
    fn save_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        records: Vec<Record>,
        sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        target::save_records(ctx.store, soup, &self.fields().id_field_name, records, sync_id)
    }

    /// Latest modification time of `records`, -1 when none has one.
    fn latest_modification_timestamp(&self, records: &[Record]) -> i64 {
        target::latest_modification_timestamp(records, &self.fields().modification_date_field_name)
    }

    /// Whether pages arrive ordered by modification date, which lets the
    /// runner checkpoint after every page.
    fn is_sorted_by_modification_date(&self) -> bool {
        false
    }

    /// Ids of locally modified records, left alone under merge mode
    /// leave-if-changed.
    fn dirty_record_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> SyncResult<BTreeSet<String>> {
        target::dirty_record_ids(ctx.store, soup, &self.fields().id_field_name)
    }

    /// Id of a fetched record, used to skip locally modified ones.
    fn record_id<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record.id(&self.fields().id_field_name)
    }
}

/// Any sync-down target.
#[derive(Debug, Clone)]
pub enum SyncDownTarget {
    /// SOQL query.
    Soql(SoqlSyncDownTarget),
    /// Re-fetch of locally known records.
    Refresh(RefreshSyncDownTarget),
    /// Recently viewed records.
    Mru(MruSyncDownTarget),
    /// SOSL search.
    Sosl(SoslSyncDownTarget),
    /// Parent with children.
    ParentChildren(ParentChildrenSyncDownTarget),
    /// Object description.
    Metadata(MetadataSyncDownTarget),
    /// UI layout.
    Layout(LayoutSyncDownTarget),
    /// Priming records index.
    Briefcase(BriefcaseSyncDownTarget),
    /// Application supplied target.
    Custom(Arc<dyn DownTarget>),
}

impl SyncDownTarget {
    /// The target behind the variant.
    pub fn as_target(&self) -> &dyn DownTarget {
        match self {
            SyncDownTarget::Soql(t) => t,
            SyncDownTarget::Refresh(t) => t,
            SyncDownTarget::Mru(t) => t,
            SyncDownTarget::Sosl(t) => t,
            SyncDownTarget::ParentChildren(t) => t,
            SyncDownTarget::Metadata(t) => t,
            SyncDownTarget::Layout(t) => t,
            SyncDownTarget::Briefcase(t) => t,
            SyncDownTarget::Custom(t) => t.as_ref(),
        }
    }
}

macro_rules! impl_from_target {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SyncDownTarget {
                fn from(target: $ty) -> Self {
                    SyncDownTarget::$variant(target)
                }
            }
        )*
    };
}

impl_from_target! {
    Soql => SoqlSyncDownTarget,
    Refresh => RefreshSyncDownTarget,
    Mru => MruSyncDownTarget,
    Sosl => SoslSyncDownTarget,
    ParentChildren => ParentChildrenSyncDownTarget,
    Metadata => MetadataSyncDownTarget,
    Layout => LayoutSyncDownTarget,
    Briefcase => BriefcaseSyncDownTarget,
}

/// Fields to select: `fieldlist` plus the id and modification date fields
/// when missing.
pub(crate) fn with_sync_fields(fieldlist: &[String], fields: &TargetFields) -> Vec<String> {
    let mut selected: Vec<String> = [&fields.id_field_name, &fields.modification_date_field_name]
        .into_iter()
        .filter(|required| !fieldlist.iter().any(|f| f.eq_ignore_ascii_case(required)))
        .cloned()
        .collect();
    selected.extend(fieldlist.iter().cloned());
    selected
}
