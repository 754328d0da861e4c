//! Parent with children aggregates.
//!
//! A parent record lives in one soup and its children in another, linked
//! by a parent id field on each child. On the server the children come
//! back nested under the parent, in a field named after the plural of the
//! child object type.

use crate::error::SyncResult;
use crate::target::{prepare_for_save, TargetFields};
use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
use mobilesync_protocol::Record;
use mobilesync_store::{Filter, LocalStore, QuerySpec, StoreReader};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

fn default_id_field_name() -> String {
    ID.to_string()
}

fn default_modification_date_field_name() -> String {
    LAST_MODIFIED_DATE.to_string()
}

/// How children depend on their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Deleting the parent deletes the children on the server.
    MasterDetail,
    /// Children outlive their parent.
    Lookup,
}

/// Where parents live, locally and on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentInfo {
    /// Server object type.
    pub sobject_type: String,
    /// Local soup.
    pub soup_name: String,
    /// Id field name.
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    /// Modification date field name.
    #[serde(default = "default_modification_date_field_name")]
    pub modification_date_field_name: String,
    /// External id field name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
}

impl ParentInfo {
    /// Creates parent info with default field names.
    pub fn new(sobject_type: impl Into<String>, soup_name: impl Into<String>) -> Self {
        Self {
            sobject_type: sobject_type.into(),
            soup_name: soup_name.into(),
            id_field_name: default_id_field_name(),
            modification_date_field_name: default_modification_date_field_name(),
            external_id_field_name: None,
        }
    }

    /// Id and modification date field names.
    pub fn fields(&self) -> TargetFields {
        TargetFields::new(&self.id_field_name, &self.modification_date_field_name)
    }
}

/// Where children live, and how they point at their parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildrenInfo {
    /// Server object type.
    pub sobject_type: String,
    /// Relationship name the children are nested under, e.g. `Contacts`.
    pub sobject_type_plural: String,
    /// Local soup.
    pub soup_name: String,
    /// Field holding the parent id.
    pub parent_id_field_name: String,
    /// Id field name.
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    /// Modification date field name.
    #[serde(default = "default_modification_date_field_name")]
    pub modification_date_field_name: String,
    /// External id field name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
}

impl ChildrenInfo {
    /// Creates children info with default field names.
    pub fn new(
        sobject_type: impl Into<String>,
        sobject_type_plural: impl Into<String>,
        soup_name: impl Into<String>,
        parent_id_field_name: impl Into<String>,
    ) -> Self {
        Self {
            sobject_type: sobject_type.into(),
            sobject_type_plural: sobject_type_plural.into(),
            soup_name: soup_name.into(),
            parent_id_field_name: parent_id_field_name.into(),
            id_field_name: default_id_field_name(),
            modification_date_field_name: default_modification_date_field_name(),
            external_id_field_name: None,
        }
    }

    /// Id and modification date field names.
    pub fn fields(&self) -> TargetFields {
        TargetFields::new(&self.id_field_name, &self.modification_date_field_name)
    }

    /// Nested subquery selecting `fields` of the children.
    pub fn subquery(&self, fields: &[&str], where_clause: Option<&str>) -> String {
        let mut query = format!("(SELECT {} FROM {}", fields.join(", "), self.sobject_type_plural);
        if let Some(predicate) = where_clause.filter(|p| !p.trim().is_empty()) {
            query.push_str(" WHERE ");
            query.push_str(predicate);
        }
        query.push(')');
        query
    }
}

/// Local children of one parent.
pub fn children_of(
    store: &dyn LocalStore,
    parent_info: &ParentInfo,
    children_info: &ChildrenInfo,
    parent: &Record,
) -> SyncResult<Vec<Record>> {
    let Some(parent_id) = parent.id(&parent_info.id_field_name) else {
        return Ok(Vec::new());
    };
    let filter = Filter::eq(&children_info.parent_id_field_name, parent_id);
    Ok(store.query_all(&children_info.soup_name, &QuerySpec::matching(filter))?)
}

/// Deletes the local children of the given parents.
pub fn delete_children(
    store: &dyn LocalStore,
    children_info: &ChildrenInfo,
    parent_ids: &BTreeSet<String>,
) -> SyncResult<usize> {
    if parent_ids.is_empty() {
        return Ok(0);
    }
    let filter = Filter::is_in(&children_info.parent_id_field_name, parent_ids.iter().cloned());
    let mut removed = 0;
    store.transaction(&mut |writer| {
        removed = writer.delete_by_query(&children_info.soup_name, &filter)?;
        Ok(())
    })?;
    debug!(soup = children_info.soup_name.as_str(), removed, "deleted children");
    Ok(removed)
}

/// Children nested in a server record tree.
///
/// The relationship field holds either an array or a query result object
/// with a `records` array.
pub fn children_from_tree(tree: &Record, children_info: &ChildrenInfo) -> Vec<Record> {
    let nested = match tree.get(&children_info.sobject_type_plural) {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Object(result)) => match result.get("records") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    nested
        .iter()
        .filter_map(|v| Record::from_value(v.clone()))
        .collect()
}

/// Saves server record trees: each parent into the parent soup, each child
/// into the children soup with its parent id field set. One transaction.
pub fn save_record_trees(
    store: &dyn LocalStore,
    parent_info: &ParentInfo,
    children_info: &ChildrenInfo,
    trees: Vec<Record>,
    sync_id: Option<i64>,
) -> SyncResult<usize> {
    let mut split = Vec::with_capacity(trees.len());
    for mut tree in trees {
        let children = children_from_tree(&tree, children_info);
        tree.remove(&children_info.sobject_type_plural);
        split.push((tree, children));
    }
    let count = split.len();
    let mut pending = Some(split);
    store.transaction(&mut |writer| {
        for (parent, children) in pending.take().unwrap_or_default() {
            let parent_id = parent.id(&parent_info.id_field_name).map(str::to_string);
            writer.upsert(
                &parent_info.soup_name,
                prepare_for_save(parent, sync_id),
                Some(&parent_info.id_field_name),
            )?;
            for child in children {
                let child = match &parent_id {
                    Some(id) => child.with(&children_info.parent_id_field_name, id.clone()),
                    None => child,
                };
                writer.upsert(
                    &children_info.soup_name,
                    prepare_for_save(child, sync_id),
                    Some(&children_info.id_field_name),
                )?;
            }
        }
        Ok(())
    })?;
    debug!(soup = parent_info.soup_name.as_str(), count, "saved record trees");
    Ok(count)
}
