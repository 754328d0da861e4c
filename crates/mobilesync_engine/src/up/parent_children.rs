//! Parent with children sync-up.
//!
//! One parent and its children travel in a single composite request. The
//! parent goes first so children can point at the id it is about to get
//! through a reference placeholder; on delete it goes last.

use super::{build_request, ensure_local_id, UpTarget};
use crate::config::{MergeMode, SyncOptions};
use crate::error::{SyncError, SyncResult};
use crate::parent_children::{children_of, ChildrenInfo, ParentInfo, RelationshipType};
use crate::registry::{self, UP_DISCRIMINATOR};
use crate::target::{apply_change, dirty_filter, LocalChange, SyncContext, TargetFields};
use mobilesync_protocol::soql::{quote, SoqlBuilder};
use mobilesync_protocol::{
    composite_request, parse_composite_response, parse_ids_from_responses, reference_placeholder,
    update_references, Record, RecordModDate, RecordResponse, RequestBuilder,
};
use mobilesync_store::{entry_id, EntryId, Filter, QuerySpec, StoreReader};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Implementation name persisted in the target configuration.
pub const PARENT_CHILDREN_IMPLEMENTATION: &str = "parent_children";

/// Uploads one parent with its children per composite request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChildrenSyncUpTarget {
    parent: ParentInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_create_fieldlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_update_fieldlist: Option<Vec<String>>,
    children: ChildrenInfo,
    #[serde(default)]
    children_create_fieldlist: Vec<String>,
    #[serde(default)]
    children_update_fieldlist: Vec<String>,
    relationship_type: RelationshipType,
    #[serde(skip)]
    fields: TargetFields,
}

/// Where a reconciled record goes.
enum Outcome {
    Change(LocalChange),
    Rerun(Record),
}

impl ParentChildrenSyncUpTarget {
    /// Creates a target; the parent field lists default to the sync's.
    pub fn new(
        parent: ParentInfo,
        children: ChildrenInfo,
        children_fieldlist: Vec<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        let fields = parent.fields();
        Self {
            parent,
            parent_create_fieldlist: None,
            parent_update_fieldlist: None,
            children,
            children_create_fieldlist: children_fieldlist.clone(),
            children_update_fieldlist: children_fieldlist,
            relationship_type,
            fields,
        }
    }

    /// Sets the parent field lists.
    pub fn with_parent_fieldlists(mut self, create: Vec<String>, update: Vec<String>) -> Self {
        self.parent_create_fieldlist = Some(create);
        self.parent_update_fieldlist = Some(update);
        self
    }

    /// Sets the children field lists.
    pub fn with_children_fieldlists(mut self, create: Vec<String>, update: Vec<String>) -> Self {
        self.children_create_fieldlist = create;
        self.children_update_fieldlist = update;
        self
    }

    /// Parent description.
    pub fn parent(&self) -> &ParentInfo {
        &self.parent
    }

    /// Children description.
    pub fn children(&self) -> &ChildrenInfo {
        &self.children
    }

    /// Relationship between parent and children.
    pub fn relationship_type(&self) -> RelationshipType {
        self.relationship_type
    }

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        let mut target: Self = serde_json::from_value(value.clone())?;
        target.fields = target.parent.fields();
        Ok(target)
    }

    fn parent_builder<'a>(&'a self, options: &'a SyncOptions) -> RequestBuilder<'a> {
        RequestBuilder {
            id_field_name: &self.parent.id_field_name,
            modification_date_field_name: &self.parent.modification_date_field_name,
            external_id_field_name: self.parent.external_id_field_name.as_deref(),
            create_fieldlist: self.parent_create_fieldlist.as_deref().unwrap_or(&options.fieldlist),
            update_fieldlist: self.parent_update_fieldlist.as_deref().unwrap_or(&options.fieldlist),
        }
    }

    fn children_builder(&self) -> RequestBuilder<'_> {
        RequestBuilder {
            id_field_name: &self.children.id_field_name,
            modification_date_field_name: &self.children.modification_date_field_name,
            external_id_field_name: self.children.external_id_field_name.as_deref(),
            create_fieldlist: &self.children_create_fieldlist,
            update_fieldlist: &self.children_update_fieldlist,
        }
    }

    fn is_master_detail(&self) -> bool {
        self.relationship_type == RelationshipType::MasterDetail
    }

    fn sync_up_record(
        &self,
        ctx: &SyncContext<'_>,
        options: &SyncOptions,
        parent: Record,
        is_rerun: bool,
    ) -> SyncResult<()> {
        let parent_id_field = self.parent.id_field_name.as_str();
        let child_id_field = self.children.id_field_name.as_str();
        let parent = ensure_local_id(parent, parent_id_field);
        let parent_state = parent.dirty_state();

        let children = if self.is_master_detail() && parent_state.deleted {
            Vec::new()
        } else {
            children_of(ctx.store, &self.parent, &self.children, &parent)?
                .into_iter()
                .map(|c| ensure_local_id(c, child_id_field))
                .map(|c| {
                    if parent_state.created {
                        let state = c.dirty_state().touched();
                        c.with_dirty_state(state)
                    } else {
                        c
                    }
                })
                .collect()
        };
        if !parent.is_dirty() && !children.iter().any(Record::is_dirty) {
            return Ok(());
        }

        let parent_ref = parent.id(parent_id_field).unwrap_or_default().to_string();
        let parent_builder = self.parent_builder(options);
        let children_builder = self.children_builder();
        let parent_request = build_request(&parent_builder, &parent)?;
        let mut child_requests = Vec::new();
        for child in children.iter().filter(|c| c.is_dirty()) {
            if let Some(mut request) = build_request(&children_builder, child)? {
                if let Some(fields) = request.fields.as_mut() {
                    let parent_value = if parent_state.created {
                        reference_placeholder(&parent_ref)
                    } else {
                        parent_ref.clone()
                    };
                    fields.insert(
                        self.children.parent_id_field_name.clone(),
                        Value::from(parent_value),
                    );
                }
                child_requests.push(request);
            }
        }

        let mut requests = Vec::with_capacity(child_requests.len() + 1);
        if parent_state.deleted {
            requests.extend(child_requests);
            requests.extend(parent_request);
        } else {
            requests.extend(parent_request);
            requests.extend(child_requests);
        }

        let responses = if requests.is_empty() {
            HashMap::new()
        } else {
            debug!(
                parent = parent_ref.as_str(),
                requests = requests.len(),
                is_rerun,
                "sending record tree"
            );
            let request = composite_request(ctx.api_version, false, &requests)?;
            parse_composite_response(&ctx.send(&request)?)?
        };
        let server_ids = parse_ids_from_responses(&responses);
        let can_rerun = options.merge_mode == MergeMode::Overwrite && !is_rerun;

        let mut parent_rerun = false;
        let mut children_rerun = false;
        let mut purge_children_of = None;
        let parent_outcome = {
            let response = responses.get(&parent_ref);
            if parent_state.deleted {
                let gone = response.is_some_and(|r| r.success || r.record_does_not_exist);
                if parent_state.created || gone {
                    if self.is_master_detail() {
                        purge_children_of = Some(parent_ref.clone());
                    }
                    Outcome::Change(LocalChange::Purge(parent))
                } else {
                    Outcome::Change(LocalChange::Save(with_error(parent, response)))
                }
            } else {
                match response {
                    Some(r) if r.success => Outcome::Change(LocalChange::Save(
                        update_references(parent, parent_id_field, &server_ids).cleaned(),
                    )),
                    Some(r) if r.record_does_not_exist && can_rerun => {
                        parent_rerun = true;
                        Outcome::Rerun(parent)
                    }
                    None if !parent.is_dirty() => Outcome::Change(LocalChange::Save(parent)),
                    other => Outcome::Change(LocalChange::Save(with_error(parent, other))),
                }
            }
        };

        let mut child_outcomes = Vec::with_capacity(children.len());
        for child in children {
            let child = update_references(child, &self.children.parent_id_field_name, &server_ids);
            if !child.is_dirty() {
                child_outcomes.push(Outcome::Change(LocalChange::Save(child)));
                continue;
            }
            let state = child.dirty_state();
            let response = child.id(child_id_field).and_then(|id| responses.get(id));
            let outcome = if state.deleted {
                if state.created || response.is_some_and(|r| r.success || r.record_does_not_exist) {
                    Outcome::Change(LocalChange::Purge(child))
                } else {
                    Outcome::Change(LocalChange::Save(with_error(child, response)))
                }
            } else {
                match response {
                    Some(r) if r.success => {
                        let child = update_references(child, child_id_field, &server_ids);
                        Outcome::Change(LocalChange::Save(child.cleaned()))
                    }
                    Some(r) if r.record_does_not_exist && can_rerun => {
                        children_rerun = true;
                        Outcome::Rerun(child.with_dirty_state(state.recreated()))
                    }
                    Some(r) if r.related_record_does_not_exist && can_rerun => {
                        parent_rerun = true;
                        Outcome::Rerun(child)
                    }
                    other => Outcome::Change(LocalChange::Save(with_error(child, other))),
                }
            };
            child_outcomes.push(outcome);
        }

        // Parent recreation drags the children along: recreated under
        // master-detail, updated under lookup.
        let parent_change = match parent_outcome {
            Outcome::Rerun(p) | Outcome::Change(LocalChange::Save(p)) if parent_rerun => {
                let state = p.dirty_state().recreated();
                LocalChange::Save(p.with_dirty_state(state))
            }
            Outcome::Change(change) => change,
            Outcome::Rerun(p) => LocalChange::Save(p),
        };
        let child_changes: Vec<LocalChange> = child_outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Outcome::Change(LocalChange::Save(c)) | Outcome::Rerun(c) if parent_rerun => {
                    let state = if self.is_master_detail() {
                        c.dirty_state().recreated()
                    } else {
                        c.dirty_state().touched()
                    };
                    LocalChange::Save(c.with_dirty_state(state))
                }
                Outcome::Change(change) => change,
                Outcome::Rerun(c) => LocalChange::Save(c),
            })
            .collect();

        let failed = std::iter::once((&parent_change, parent_id_field))
            .chain(child_changes.iter().map(|change| (change, child_id_field)));
        for (change, id_field) in failed {
            if let LocalChange::Save(saved) = change {
                if let Some(error) = saved.last_error() {
                    warn!(id = saved.id(id_field), error, "record not synced");
                }
            }
        }

        let rerun_parent = match &parent_change {
            LocalChange::Save(p) if parent_rerun || children_rerun => Some(p.clone()),
            _ => None,
        };
        let mut pending = Some((parent_change, child_changes));
        ctx.store.transaction(&mut |writer| {
            let Some((parent_change, child_changes)) = pending.take() else {
                return Ok(());
            };
            apply_change(writer, &self.parent.soup_name, parent_id_field, parent_change)?;
            for change in child_changes {
                apply_change(writer, &self.children.soup_name, child_id_field, change)?;
            }
            if let Some(parent_id) = &purge_children_of {
                writer.delete_by_query(
                    &self.children.soup_name,
                    &Filter::eq(&self.children.parent_id_field_name, parent_id.as_str()),
                )?;
            }
            Ok(())
        })?;

        match rerun_parent {
            Some(parent) if !is_rerun => {
                info!(
                    parent = parent_ref.as_str(),
                    "re-running record tree for records deleted on the server"
                );
                self.sync_up_record(ctx, options, parent, true)
            }
            _ => Ok(()),
        }
    }

    fn remote_tree(&self, ctx: &SyncContext<'_>, parent_id: &str) -> SyncResult<Option<Record>> {
        let parent_fields = [
            self.parent.id_field_name.as_str(),
            self.parent.modification_date_field_name.as_str(),
        ];
        let subquery = self.children.subquery(
            &[
                self.children.id_field_name.as_str(),
                self.children.modification_date_field_name.as_str(),
            ],
            None,
        );
        let fields = parent_fields.iter().copied().chain([subquery.as_str()]);
        let soql = SoqlBuilder::with_fields(fields)
            .from(&self.parent.sobject_type)
            .where_clause(format!("{} = {}", self.parent.id_field_name, quote(parent_id)))
            .build()?;
        Ok(ctx.query(&soql, None)?.records.into_iter().next())
    }

    fn is_tree_newer_than_server(
        &self,
        ctx: &SyncContext<'_>,
        parent: &Record,
    ) -> SyncResult<bool> {
        if parent.is_locally_created() {
            return Ok(true);
        }
        let Some(parent_id) = parent.id(&self.parent.id_field_name) else {
            return Ok(true);
        };
        let deleted = RecordModDate::new(None, true);
        let tree = self.remote_tree(ctx, parent_id)?;
        let remote_parent = tree
            .as_ref()
            .map(|t| remote_date(t, &self.parent.modification_date_field_name))
            .unwrap_or_else(|| deleted.clone());
        if !parent
            .mod_date(&self.parent.modification_date_field_name)
            .is_newer_than(&remote_parent)
        {
            return Ok(false);
        }

        let remote_children: HashMap<String, RecordModDate> = tree
            .as_ref()
            .map(|t| crate::parent_children::children_from_tree(t, &self.children))
            .unwrap_or_default()
            .iter()
            .filter_map(|c| {
                c.id(&self.children.id_field_name).map(|id| {
                    (id.to_string(), remote_date(c, &self.children.modification_date_field_name))
                })
            })
            .collect();
        for child in children_of(ctx.store, &self.parent, &self.children, parent)? {
            if child.is_locally_created() {
                continue;
            }
            let remote = child
                .id(&self.children.id_field_name)
                .and_then(|id| remote_children.get(id))
                .unwrap_or(&deleted);
            if !child
                .mod_date(&self.children.modification_date_field_name)
                .is_newer_than(remote)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn remote_date(record: &Record, modification_date_field_name: &str) -> RecordModDate {
    RecordModDate::new(
        record.get_str(modification_date_field_name).map(str::to_string),
        false,
    )
}

fn with_error(record: Record, response: Option<&RecordResponse>) -> Record {
    let error = response
        .map(RecordResponse::error_message)
        .unwrap_or_else(|| "no response for record".to_string());
    record.with_last_error(error)
}

impl UpTarget for ParentChildrenSyncUpTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn max_batch_size(&self) -> usize {
        1
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, UP_DISCRIMINATOR, PARENT_CHILDREN_IMPLEMENTATION)
    }

    fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        options: &SyncOptions,
        records: Vec<Record>,
    ) -> SyncResult<()> {
        if records.len() > 1 {
            return Err(SyncError::config(format!(
                "{} parents in one call; parent with children syncs one tree at a time",
                records.len()
            )));
        }
        match records.into_iter().next() {
            Some(parent) => self.sync_up_record(ctx, options, parent, false),
            None => Ok(()),
        }
    }

    fn are_newer_than_server(
        &self,
        ctx: &SyncContext<'_>,
        records: &[Record],
    ) -> SyncResult<Vec<bool>> {
        records
            .iter()
            .map(|parent| self.is_tree_newer_than_server(ctx, parent))
            .collect()
    }

    /// Parents that are dirty themselves or have a dirty child.
    fn dirty_entry_ids(&self, ctx: &SyncContext<'_>, _soup: &str) -> SyncResult<Vec<EntryId>> {
        let store = ctx.store;
        let dirty_children =
            store.query_all(&self.children.soup_name, &QuerySpec::matching(dirty_filter()))?;
        let parent_ids: BTreeSet<String> = dirty_children
            .iter()
            .filter_map(|c| c.get_str(&self.children.parent_id_field_name).map(str::to_string))
            .collect();
        let filter = if parent_ids.is_empty() {
            dirty_filter()
        } else {
            dirty_filter()
                .not()
                .and(Filter::is_in(&self.parent.id_field_name, parent_ids).not())
                .not()
        };
        let parents = store.query_all(&self.parent.soup_name, &QuerySpec::matching(filter))?;
        let ids: BTreeSet<EntryId> = parents.iter().filter_map(entry_id).collect();
        Ok(ids.into_iter().collect())
    }
}
