//! Parent with children sync-down.
//!
//! Parents are fetched with their children nested through a subquery on the
//! child relationship. A re-sync picks parents that changed themselves or
//! have a child that changed.

use super::{with_sync_fields, DownTarget, FetchCursor, FetchPage};
use crate::error::SyncResult;
use crate::parent_children::{
    children_from_tree, delete_children, save_record_trees, ChildrenInfo, ParentInfo,
    RelationshipType,
};
use crate::registry::{self, DOWN_DISCRIMINATOR};
use crate::target::{self, dirty_filter, record_ids, SyncContext, TargetFields};
use mobilesync_protocol::soql::{modification_date_filter, SoqlBuilder};
use mobilesync_protocol::Record;
use mobilesync_store::{Filter, QuerySpec, StoreReader};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::info;

/// Discriminator persisted in the target configuration.
pub const PARENT_CHILDREN_TYPE: &str = "parent_children";

/// Fetches parents with their children into two soups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChildrenSyncDownTarget {
    parent: ParentInfo,
    parent_fieldlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_soql_filter: Option<String>,
    children: ChildrenInfo,
    children_fieldlist: Vec<String>,
    relationship_type: RelationshipType,
    #[serde(skip)]
    fields: TargetFields,
}

impl ParentChildrenSyncDownTarget {
    /// Creates a target.
    pub fn new(
        parent: ParentInfo,
        parent_fieldlist: Vec<String>,
        children: ChildrenInfo,
        children_fieldlist: Vec<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        let fields = parent.fields();
        Self {
            parent,
            parent_fieldlist,
            parent_soql_filter: None,
            children,
            children_fieldlist,
            relationship_type,
            fields,
        }
    }

    /// Restricts the parents fetched with a SOQL predicate.
    pub fn with_parent_soql_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.parent_soql_filter = (!filter.trim().is_empty()).then_some(filter);
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

    /// Reads a persisted configuration.
    pub fn from_config(value: &Value) -> SyncResult<Self> {
        let mut target: Self = serde_json::from_value(value.clone())?;
        target.fields = target.parent.fields();
        Ok(target)
    }

    fn parent_where(&self, max_timestamp: i64) -> SyncResult<Option<String>> {
        let filter = self.parent_soql_filter.as_deref();
        if max_timestamp <= 0 {
            return Ok(filter.map(str::to_string));
        }
        let changed = format!(
            "({} OR {} IN (SELECT {} FROM {} WHERE {}))",
            modification_date_filter(&self.parent.modification_date_field_name, max_timestamp)?,
            self.parent.id_field_name,
            self.children.parent_id_field_name,
            self.children.sobject_type,
            modification_date_filter(&self.children.modification_date_field_name, max_timestamp)?,
        );
        Ok(Some(match filter {
            Some(filter) => format!("{changed} AND ({filter})"),
            None => changed,
        }))
    }

    /// Query returning parent trees modified after `max_timestamp`.
    pub fn query(&self, max_timestamp: i64) -> SyncResult<String> {
        let children_fields = with_sync_fields(&self.children_fieldlist, &self.children.fields());
        let children_fields: Vec<&str> = children_fields.iter().map(String::as_str).collect();
        let mut fields = with_sync_fields(&self.parent_fieldlist, &self.fields);
        fields.push(self.children.subquery(&children_fields, None));
        let mut builder = SoqlBuilder::with_fields(fields)
            .from(&self.parent.sobject_type)
            .order_by(format!("{} ASC", self.parent.modification_date_field_name));
        if let Some(predicate) = self.parent_where(max_timestamp)? {
            builder = builder.where_clause(predicate);
        }
        Ok(builder.build()?)
    }

    fn remote_trees(&self, ctx: &SyncContext<'_>) -> SyncResult<Vec<Record>> {
        let subquery = self.children.subquery(&[self.children.id_field_name.as_str()], None);
        let mut builder = SoqlBuilder::with_fields([self.parent.id_field_name.clone(), subquery])
            .from(&self.parent.sobject_type);
        if let Some(filter) = &self.parent_soql_filter {
            builder = builder.where_clause(filter.clone());
        }
        ctx.query_all(&builder.build()?)
    }

    fn clean_children_ghosts(
        &self,
        ctx: &SyncContext<'_>,
        parent_ids: &BTreeSet<String>,
        remote_trees: &[Record],
    ) -> SyncResult<usize> {
        if parent_ids.is_empty() {
            return Ok(0);
        }
        let remote: BTreeSet<String> = remote_trees
            .iter()
            .flat_map(|tree| children_from_tree(tree, &self.children))
            .filter_map(|c| c.id(&self.children.id_field_name).map(str::to_string))
            .collect();
        let scope = Filter::is_in(&self.children.parent_id_field_name, parent_ids.iter().cloned());
        let local = target::non_dirty_record_ids(
            ctx.store,
            &self.children.soup_name,
            &self.children.id_field_name,
            scope,
        )?;
        let ghosts = target::ghost_ids(&local, &remote);
        target::delete_records_by_id(
            ctx.store,
            &self.children.soup_name,
            &self.children.id_field_name,
            &ghosts,
        )
    }
}

impl DownTarget for ParentChildrenSyncDownTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn to_config(&self) -> SyncResult<Value> {
        registry::tagged(self, DOWN_DISCRIMINATOR, PARENT_CHILDREN_TYPE)
    }

    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        max_timestamp: i64,
    ) -> SyncResult<FetchPage> {
        Ok(FetchPage::from_query(ctx.query(&self.query(max_timestamp)?, None)?))
    }

    fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        cursor: &FetchCursor,
    ) -> SyncResult<Option<FetchPage>> {
        match cursor {
            FetchCursor::Url(url) => Ok(Some(FetchPage::from_query(ctx.query_next(url)?))),
            _ => Ok(None),
        }
    }

    fn remote_ids(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        local_ids: &BTreeSet<String>,
    ) -> SyncResult<BTreeSet<String>> {
        if local_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(record_ids(&self.remote_trees(ctx)?, &self.parent.id_field_name))
    }

    /// Removes parents the server no longer has, their children under a
    /// master-detail relationship, then children missing from the
    /// remaining parents.
    fn clean_ghosts(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        let soup = self.parent.soup_name.as_str();
        let id_field = self.parent.id_field_name.as_str();
        let scope = target::sync_scope(ctx.store, soup, sync_id)?;
        let local = target::non_dirty_record_ids(ctx.store, soup, id_field, scope)?;
        if local.is_empty() {
            return Ok(0);
        }
        let trees = self.remote_trees(ctx)?;
        let remote = record_ids(&trees, id_field);
        let ghosts = target::ghost_ids(&local, &remote);

        let mut removed = target::delete_records_by_id(ctx.store, soup, id_field, &ghosts)?;
        if self.relationship_type == RelationshipType::MasterDetail {
            removed += delete_children(ctx.store, &self.children, &ghosts)?;
        }
        let kept: BTreeSet<String> = local.intersection(&remote).cloned().collect();
        removed += self.clean_children_ghosts(ctx, &kept, &trees)?;
        if removed > 0 {
            info!(soup, removed, "removed ghosts");
        }
        Ok(removed)
    }

    fn save_records(
        &self,
        ctx: &SyncContext<'_>,
        _soup: &str,
        records: Vec<Record>,
        sync_id: Option<i64>,
    ) -> SyncResult<usize> {
        save_record_trees(ctx.store, &self.parent, &self.children, records, sync_id)
    }

    /// Latest modification time across parents and their nested children.
    fn latest_modification_timestamp(&self, records: &[Record]) -> i64 {
        let parents = target::latest_modification_timestamp(
            records,
            &self.parent.modification_date_field_name,
        );
        let children: Vec<Record> = records
            .iter()
            .flat_map(|tree| children_from_tree(tree, &self.children))
            .collect();
        let children = target::latest_modification_timestamp(
            &children,
            &self.children.modification_date_field_name,
        );
        parents.max(children)
    }

    /// Parents that are dirty themselves or have a dirty child.
    fn dirty_record_ids(&self, ctx: &SyncContext<'_>, _soup: &str) -> SyncResult<BTreeSet<String>> {
        let mut ids = target::dirty_record_ids(
            ctx.store,
            &self.parent.soup_name,
            &self.parent.id_field_name,
        )?;
        let dirty_children = ctx
            .store
            .query_all(&self.children.soup_name, &QuerySpec::matching(dirty_filter()))?;
        ids.extend(
            dirty_children
                .iter()
                .filter_map(|c| c.get_str(&self.children.parent_id_field_name).map(str::to_string)),
        );
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRestClient;
    use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
    use mobilesync_protocol::{timestamp, DirtyState, RestResponse};
    use mobilesync_store::{LocalStore, MemoryStore};
    use serde_json::json;

    fn target(relationship: RelationshipType) -> ParentChildrenSyncDownTarget {
        ParentChildrenSyncDownTarget::new(
            ParentInfo::new("Account", "accounts"),
            vec!["Name".into()],
            ChildrenInfo::new("Contact", "Contacts", "contacts", "AccountId"),
            vec!["LastName".into()],
            relationship,
        )
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.register_soup("accounts", &[]).unwrap();
        store.register_soup("contacts", &[]).unwrap();
        store
    }

    fn tree(id: &str, modified: &str, children: Value) -> Record {
        Record::new()
            .with(ID, id)
            .with(LAST_MODIFIED_DATE, modified)
            .with("Contacts", children)
    }

    #[test]
    fn full_and_resync_queries() {
        let target = target(RelationshipType::Lookup);
        assert_eq!(
            target.query(0).unwrap(),
            "SELECT Id, LastModifiedDate, Name, \
             (SELECT Id, LastModifiedDate, LastName FROM Contacts) \
             FROM Account ORDER BY LastModifiedDate ASC"
        );
        let ts = timestamp::parse_millis("2024-01-01T00:00:00.000Z").unwrap();
        let filtered = target.with_parent_soql_filter("Industry = 'Tech'");
        assert_eq!(
            filtered.query(ts).unwrap(),
            "SELECT Id, LastModifiedDate, Name, \
             (SELECT Id, LastModifiedDate, LastName FROM Contacts) \
             FROM Account WHERE (LastModifiedDate > 2024-01-01T00:00:00.000Z OR Id IN \
             (SELECT AccountId FROM Contact WHERE LastModifiedDate > 2024-01-01T00:00:00.000Z)) \
             AND (Industry = 'Tech') ORDER BY LastModifiedDate ASC"
        );
    }

    #[test]
    fn trees_are_split_into_two_soups() {
        let store = store();
        let client = MockRestClient::always(RestResponse::new(200, json!({})));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let target = target(RelationshipType::Lookup);
        let trees = vec![tree(
            "001",
            "2024-01-01T00:00:00.000Z",
            json!({ "records": [
                { "Id": "003a", "LastModifiedDate": "2024-02-01T00:00:00.000Z" },
                { "Id": "003b", "LastModifiedDate": "2024-01-15T00:00:00.000Z" }
            ] }),
        )];
        assert_eq!(
            target.latest_modification_timestamp(&trees),
            timestamp::parse_millis("2024-02-01T00:00:00.000Z").unwrap()
        );
        assert_eq!(target.save_records(&ctx, "accounts", trees, Some(7)).unwrap(), 1);

        let accounts = store.query_all("accounts", &QuerySpec::all()).unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].get("Contacts").is_none());
        let contacts = store.query_all("contacts", &QuerySpec::all()).unwrap();
        assert_eq!(contacts.len(), 2);
        assert!(contacts.iter().all(|c| c.get_str("AccountId") == Some("001")));
    }

    #[test]
    fn dirty_children_mark_their_parent() {
        let store = store();
        store.upsert_one("accounts", Record::new().with(ID, "001").cleaned(), None).unwrap();
        let child = Record::new()
            .with(ID, "003")
            .with("AccountId", "002")
            .with_dirty_state(DirtyState { updated: true, ..DirtyState::CLEAN });
        store.upsert_one("contacts", child, None).unwrap();
        let client = MockRestClient::always(RestResponse::new(200, json!({})));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let ids = target(RelationshipType::Lookup).dirty_record_ids(&ctx, "accounts").unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["002".to_string()]);
    }

    #[test]
    fn ghost_parents_take_children_under_master_detail() {
        let store = store();
        for id in ["001", "002"] {
            store.upsert_one("accounts", Record::new().with(ID, id).cleaned(), None).unwrap();
        }
        for (id, parent) in [("003a", "001"), ("003b", "001"), ("003c", "002")] {
            let contact = Record::new().with(ID, id).with("AccountId", parent).cleaned();
            store.upsert_one("contacts", contact, None).unwrap();
        }
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "totalSize": 1, "done": true, "records": [
                { "Id": "001", "Contacts": { "records": [{ "Id": "003a" }] } }
            ] }),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let removed = target(RelationshipType::MasterDetail)
            .clean_ghosts(&ctx, "accounts", None)
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            record_ids(&store.query_all("accounts", &QuerySpec::all()).unwrap(), ID),
            BTreeSet::from(["001".to_string()])
        );
        assert_eq!(
            record_ids(&store.query_all("contacts", &QuerySpec::all()).unwrap(), ID),
            BTreeSet::from(["003a".to_string()])
        );
        assert_eq!(
            client.requests()[0].query_param("q").as_deref(),
            Some("SELECT Id, (SELECT Id FROM Contacts) FROM Account")
        );
    }

    #[test]
    fn lookup_ghost_parents_leave_children() {
        let store = store();
        store.upsert_one("accounts", Record::new().with(ID, "002").cleaned(), None).unwrap();
        let contact = Record::new().with(ID, "003c").with("AccountId", "002").cleaned();
        store.upsert_one("contacts", contact, None).unwrap();
        let client = MockRestClient::always(RestResponse::new(
            200,
            json!({ "totalSize": 0, "done": true, "records": [] }),
        ));
        let ctx = SyncContext::new(&store, &client, "v60.0");
        let removed = target(RelationshipType::Lookup)
            .clean_ghosts(&ctx, "accounts", None)
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("contacts", &Filter::All).unwrap(), 1);
    }

    #[test]
    fn config_round_trip() {
        let target =
            target(RelationshipType::MasterDetail).with_parent_soql_filter("Industry = 'Tech'");
        let config = target.to_config().unwrap();
        assert_eq!(config["type"], PARENT_CHILDREN_TYPE);
        assert_eq!(config["relationshipType"], "MASTER_DETAIL");
        assert_eq!(ParentChildrenSyncDownTarget::from_config(&config).unwrap(), target);
    }
}
