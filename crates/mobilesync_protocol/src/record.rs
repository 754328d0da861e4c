//! Records and their local bookkeeping.
//!
//! A [`Record`] is a JSON object describing one remote business object plus
//! a handful of bookkeeping fields the sync layer maintains locally. The
//! bookkeeping is read as a [`DirtyState`] snapshot and written back as a
//! whole, so reconciliation never flips individual flags in place.

use crate::timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default id field name.
pub const ID: &str = "Id";
/// Default modification date field name.
pub const LAST_MODIFIED_DATE: &str = "LastModifiedDate";
/// True if any local mutation is pending.
pub const LOCAL: &str = "__local__";
/// True if the record was created locally.
pub const LOCALLY_CREATED: &str = "__locally_created__";
/// True if the record was updated locally.
pub const LOCALLY_UPDATED: &str = "__locally_updated__";
/// True if the record was deleted locally.
pub const LOCALLY_DELETED: &str = "__locally_deleted__";
/// Last server error seen while syncing the record up.
pub const LAST_ERROR: &str = "__last_error__";
/// Id of the sync that last wrote the record.
pub const SYNC_ID: &str = "__sync_id__";
/// Key holding the record's object metadata.
pub const ATTRIBUTES: &str = "attributes";
/// Path of the object type inside a record.
pub const ATTRIBUTES_TYPE: &str = "attributes.type";
/// Prefix of ids synthesized for records that have no server identity.
pub const LOCAL_ID_PREFIX: &str = "local_";

static LAST_LOCAL_ID: AtomicU64 = AtomicU64::new(0);

/// Creates an id for a record that has not reached the server yet.
///
/// Ids are `local_` followed by a nanosecond counter that strictly increases
/// within the process, even when the clock does not.
pub fn create_local_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut previous = LAST_LOCAL_ID.load(Ordering::SeqCst);
    loop {
        let next = now.max(previous + 1);
        match LAST_LOCAL_ID.compare_exchange(previous, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return format!("{LOCAL_ID_PREFIX}{next}"),
            Err(actual) => previous = actual,
        }
    }
}

/// Returns true for ids produced by [`create_local_id`].
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Pending local mutations of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyState {
    /// Created locally.
    pub created: bool,
    /// Updated locally.
    pub updated: bool,
    /// Deleted locally.
    pub deleted: bool,
}

impl DirtyState {
    /// No pending mutation.
    pub const CLEAN: DirtyState = DirtyState {
        created: false,
        updated: false,
        deleted: false,
    };

    /// Reads the flags of a record.
    pub fn of(record: &Record) -> Self {
        Self {
            created: record.flag(LOCALLY_CREATED),
            updated: record.flag(LOCALLY_UPDATED),
            deleted: record.flag(LOCALLY_DELETED),
        }
    }

    /// Returns true if any mutation is pending.
    pub fn is_dirty(&self) -> bool {
        self.created || self.updated || self.deleted
    }

    /// Created then deleted before ever reaching the server.
    pub fn is_local_only(&self) -> bool {
        self.created && self.deleted
    }

    /// The same state, marked for creation on the next pass.
    pub fn recreated(self) -> Self {
        Self {
            created: true,
            ..self
        }
    }

    /// The same state, marked as updated.
    pub fn touched(self) -> Self {
        Self {
            updated: true,
            ..self
        }
    }
}

/// Local and remote freshness of a record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordModDate {
    /// Modification timestamp, if known.
    pub timestamp: Option<String>,
    /// Whether the record is deleted on that side.
    pub is_deleted: bool,
}

impl RecordModDate {
    /// Creates a modification date.
    pub fn new(timestamp: Option<String>, is_deleted: bool) -> Self {
        Self {
            timestamp,
            is_deleted,
        }
    }

    /// Returns true if `self` (local) should win against `remote`.
    ///
    /// A missing timestamp on either side counts as newer so an unsynced
    /// local record is never dropped silently.
    pub fn is_newer_than(&self, remote: &RecordModDate) -> bool {
        match (&self.timestamp, &remote.timestamp) {
            (None, _) | (_, None) => true,
            (Some(local), Some(server)) => {
                timestamp::compare(local, server) != CmpOrdering::Less
                    || (self.is_deleted && remote.is_deleted)
            }
        }
    }
}

/// A semi-structured record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wraps a JSON value, returning `None` if it is not an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Borrows the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Unwraps into the underlying JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Converts into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Returns a top level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns a top level field as a non-empty string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Resolves a dotted path such as `attributes.type` or `Owner.Name`.
    ///
    /// Nulls are reported as absent.
    pub fn project(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        (!current.is_null()).then_some(current)
    }

    /// Returns the value of the id field, if set.
    pub fn id(&self, id_field: &str) -> Option<&str> {
        self.get_str(id_field)
    }

    /// Returns the object type from `attributes.type`.
    pub fn object_type(&self) -> Option<&str> {
        self.project(ATTRIBUTES_TYPE).and_then(Value::as_str)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns the record with a field set.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Returns the record tagged with an object type.
    pub fn with_object_type(self, object_type: &str) -> Self {
        self.with(ATTRIBUTES, serde_json::json!({ "type": object_type }))
    }

    fn flag(&self, field: &str) -> bool {
        match self.0.get(field) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }

    /// Current dirty state.
    pub fn dirty_state(&self) -> DirtyState {
        DirtyState::of(self)
    }

    /// Returns true if a local mutation is pending.
    pub fn is_dirty(&self) -> bool {
        self.flag(LOCAL) || self.dirty_state().is_dirty()
    }

    /// Returns true if the record was created locally.
    pub fn is_locally_created(&self) -> bool {
        self.flag(LOCALLY_CREATED)
    }

    /// Returns true if the record was deleted locally.
    pub fn is_locally_deleted(&self) -> bool {
        self.flag(LOCALLY_DELETED)
    }

    /// Returns the record with all four bookkeeping flags set from `state`.
    pub fn with_dirty_state(mut self, state: DirtyState) -> Self {
        self.insert(LOCAL, state.is_dirty());
        self.insert(LOCALLY_CREATED, state.created);
        self.insert(LOCALLY_UPDATED, state.updated);
        self.insert(LOCALLY_DELETED, state.deleted);
        self
    }

    /// Returns the record with flags reset and the last error cleared.
    pub fn cleaned(self) -> Self {
        self.with_dirty_state(DirtyState::CLEAN)
            .with(LAST_ERROR, Value::Null)
    }

    /// Returns true if cleaning would not change the record.
    pub fn is_clean(&self) -> bool {
        let flags_clean = [LOCAL, LOCALLY_CREATED, LOCALLY_UPDATED, LOCALLY_DELETED]
            .iter()
            .all(|f| self.0.get(*f) == Some(&Value::Bool(false)));
        flags_clean && self.0.get(LAST_ERROR) == Some(&Value::Null)
    }

    /// Returns the record with a last error attached.
    pub fn with_last_error(self, error: impl Into<String>) -> Self {
        self.with(LAST_ERROR, error.into())
    }

    /// Last sync-up error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.get_str(LAST_ERROR)
    }

    /// Local modification date for freshness checks.
    pub fn mod_date(&self, mod_date_field: &str) -> RecordModDate {
        RecordModDate::new(
            self.get_str(mod_date_field).map(str::to_string),
            self.is_locally_deleted(),
        )
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn local_ids_are_unique_and_prefixed() {
        let a = create_local_id();
        let b = create_local_id();
        assert!(is_local_id(&a));
        assert!(is_local_id(&b));
        assert_ne!(a, b);
        assert!(!is_local_id("001000000000001AAA"));
    }

    #[test]
    fn dirty_state_round_trip() {
        let state = DirtyState {
            created: true,
            updated: false,
            deleted: true,
        };
        let rec = Record::new().with_dirty_state(state);
        assert_eq!(rec.dirty_state(), state);
        assert!(rec.is_dirty());
        assert!(rec.dirty_state().is_local_only());
        assert_eq!(rec.get(LOCAL), Some(&Value::Bool(true)));
    }

    #[test]
    fn string_flags_are_read() {
        let rec = record(json!({ LOCAL: "true", LOCALLY_UPDATED: "true" }));
        assert!(rec.is_dirty());
        assert!(rec.dirty_state().updated);
    }

    #[test]
    fn cleaning_is_idempotent() {
        let rec = record(json!({
            "Id": "001",
            LOCAL: true,
            LOCALLY_UPDATED: true,
            LAST_ERROR: "boom",
        }));
        let once = rec.cleaned();
        assert!(once.is_clean());
        let twice = once.clone().cleaned();
        assert_eq!(once, twice);
    }

    #[test]
    fn projection_handles_paths_and_nulls() {
        let rec = record(json!({
            "attributes": { "type": "Account" },
            "Owner": { "Name": "Ada" },
            "Phone": null,
        }));
        assert_eq!(rec.object_type(), Some("Account"));
        assert_eq!(rec.project("Owner.Name"), Some(&json!("Ada")));
        assert_eq!(rec.project("Phone"), None);
        assert_eq!(rec.project("Owner.Title"), None);
        assert_eq!(rec.project("Missing.Path"), None);
    }

    #[test]
    fn mod_date_comparison() {
        let newer = RecordModDate::new(Some("2024-03-02T00:00:00.000Z".into()), false);
        let older = RecordModDate::new(Some("2024-03-01T00:00:00.000+0000".into()), false);
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(older.is_newer_than(&older.clone()));
    }

    #[test]
    fn missing_timestamps_are_newer() {
        let known = RecordModDate::new(Some("2024-03-01T00:00:00.000Z".into()), false);
        let unknown = RecordModDate::new(None, false);
        assert!(unknown.is_newer_than(&known));
        assert!(known.is_newer_than(&RecordModDate::new(None, true)));
    }

    #[test]
    fn both_deleted_is_newer() {
        let local = RecordModDate::new(Some("2024-03-01T00:00:00.000Z".into()), true);
        let remote = RecordModDate::new(Some("2024-03-05T00:00:00.000Z".into()), true);
        assert!(local.is_newer_than(&remote));
    }
}
