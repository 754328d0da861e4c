//! Per-record requests and normalized responses.
//!
//! A [`RecordRequest`] is built for each dirty record and later encoded
//! either as a composite sub-request or as part of a collection request.
//! Whatever the encoding, the outcome comes back as a [`RecordResponse`]
//! keyed by the request's reference id.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{is_local_id, Record};
use crate::rest::{RestRequest, RestResponse};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Error code reported when an addressed or referenced record was deleted.
pub const ENTITY_IS_DELETED: &str = "ENTITY_IS_DELETED";

/// Kind of a record request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// Create a new record.
    Create,
    /// Update an existing record by id.
    Update,
    /// Create or update by external id.
    Upsert,
    /// Delete by id.
    Delete,
}

impl RequestType {
    /// All kinds, in the order collection requests are dispatched.
    pub const ALL: [RequestType; 4] = [
        RequestType::Create,
        RequestType::Update,
        RequestType::Upsert,
        RequestType::Delete,
    ];
}

/// One create/update/upsert/delete against the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequest {
    /// Request kind.
    pub request_type: RequestType,
    /// Object type, e.g. `Account`.
    pub object_type: String,
    /// Fields to send (none for deletes).
    pub fields: Option<Map<String, Value>>,
    /// Server id (updates and deletes).
    pub id: Option<String>,
    /// External id field name (upserts).
    pub external_id_field_name: Option<String>,
    /// External id value (upserts).
    pub external_id: Option<String>,
    /// Correlation token echoed back with the response.
    pub reference_id: String,
}

impl RecordRequest {
    fn base(request_type: RequestType, object_type: &str) -> Self {
        Self {
            request_type,
            object_type: object_type.to_string(),
            fields: None,
            id: None,
            external_id_field_name: None,
            external_id: None,
            reference_id: String::new(),
        }
    }

    /// Creates a CREATE request.
    pub fn for_create(object_type: &str, fields: Map<String, Value>) -> Self {
        Self {
            fields: Some(fields),
            ..Self::base(RequestType::Create, object_type)
        }
    }

    /// Creates an UPDATE request.
    pub fn for_update(object_type: &str, id: &str, fields: Map<String, Value>) -> Self {
        Self {
            fields: Some(fields),
            id: Some(id.to_string()),
            ..Self::base(RequestType::Update, object_type)
        }
    }

    /// Creates an UPSERT request.
    pub fn for_upsert(
        object_type: &str,
        external_id_field_name: &str,
        external_id: &str,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            fields: Some(fields),
            external_id_field_name: Some(external_id_field_name.to_string()),
            external_id: Some(external_id.to_string()),
            ..Self::base(RequestType::Upsert, object_type)
        }
    }

    /// Creates a DELETE request.
    pub fn for_delete(object_type: &str, id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::base(RequestType::Delete, object_type)
        }
    }

    /// Sets the reference id.
    pub fn with_reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = reference_id.into();
        self
    }

    fn fields_or_empty(&self) -> Map<String, Value> {
        self.fields.clone().unwrap_or_default()
    }

    /// Encodes as a standalone REST request.
    pub fn as_rest_request(&self, api_version: &str) -> RestRequest {
        let id = self.id.as_deref().unwrap_or_default();
        match self.request_type {
            RequestType::Create => {
                RestRequest::create(api_version, &self.object_type, self.fields_or_empty())
            }
            RequestType::Update => {
                RestRequest::update(api_version, &self.object_type, id, self.fields_or_empty())
            }
            RequestType::Upsert => RestRequest::upsert(
                api_version,
                &self.object_type,
                self.external_id_field_name.as_deref().unwrap_or_default(),
                self.external_id.as_deref().unwrap_or_default(),
                self.fields_or_empty(),
            ),
            RequestType::Delete => RestRequest::delete(api_version, &self.object_type, id),
        }
    }
}

/// Normalized outcome of one record request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordResponse {
    /// The server accepted the request.
    pub success: bool,
    /// Server id assigned by a create or upsert.
    pub id: Option<String>,
    /// The addressed record is gone on the server.
    pub record_does_not_exist: bool,
    /// A record referenced by this one is gone on the server.
    pub related_record_does_not_exist: bool,
    /// Raw error payload.
    pub error: Option<Value>,
}

impl RecordResponse {
    /// A successful response.
    pub fn succeeded(id: Option<String>) -> Self {
        Self {
            success: true,
            id,
            ..Self::default()
        }
    }

    /// A failed response carrying an error payload.
    pub fn failed(error: Value) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Error text to persist on the record.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }

    /// Normalizes the response to a standalone REST request.
    pub fn from_rest_response(response: &RestResponse) -> Self {
        if response.is_success() {
            let id = response
                .body
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Self::succeeded(id);
        }
        let error = first_error(&response.body);
        let record_does_not_exist = response.status == 404;
        Self {
            success: false,
            id: None,
            record_does_not_exist,
            related_record_does_not_exist: !record_does_not_exist
                && error_code(error.as_ref()) == Some(ENTITY_IS_DELETED),
            error: error.or_else(|| Some(response.body.clone())),
        }
    }
}

/// First error object of a REST error body (`[{"errorCode": ..}]`).
pub(crate) fn first_error(body: &Value) -> Option<Value> {
    match body {
        Value::Array(errors) => errors.first().cloned(),
        Value::Object(_) => Some(body.clone()),
        _ => None,
    }
}

pub(crate) fn error_code(error: Option<&Value>) -> Option<&str> {
    let error = error?;
    error
        .get("errorCode")
        .or_else(|| error.get("statusCode"))
        .and_then(Value::as_str)
}

/// Builds the field map sent for a record.
///
/// The id and modification date fields are never sent; absent or null
/// source fields are skipped.
pub fn build_fields_map(
    record: &Record,
    fieldlist: &[String],
    id_field_name: &str,
    modification_date_field_name: &str,
) -> Map<String, Value> {
    fieldlist
        .iter()
        .filter(|f| f.as_str() != id_field_name && f.as_str() != modification_date_field_name)
        .filter_map(|f| record.project(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

/// Decides which request, if any, a dirty record needs.
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder<'a> {
    /// Id field name.
    pub id_field_name: &'a str,
    /// Modification date field name.
    pub modification_date_field_name: &'a str,
    /// External id field name used for upserts.
    pub external_id_field_name: Option<&'a str>,
    /// Fields sent on create.
    pub create_fieldlist: &'a [String],
    /// Fields sent on update.
    pub update_fieldlist: &'a [String],
}

impl RequestBuilder<'_> {
    /// Builds the request for a record, or `None` if no server call is needed.
    ///
    /// The reference id is the record's id, which for records that never
    /// reached the server is a synthesized local id.
    pub fn build(&self, record: &Record) -> ProtocolResult<Option<RecordRequest>> {
        let state = record.dirty_state();
        if !record.is_dirty() || state.is_local_only() {
            return Ok(None);
        }
        let id = record.id(self.id_field_name).unwrap_or_default();
        let object_type = record
            .object_type()
            .ok_or_else(|| ProtocolError::MissingObjectType {
                reference: id.to_string(),
            })?;

        let request = if state.deleted {
            RecordRequest::for_delete(object_type, id)
        } else if state.created {
            let mut fields = build_fields_map(
                record,
                self.create_fieldlist,
                self.id_field_name,
                self.modification_date_field_name,
            );
            let external = self.external_id_field_name.and_then(|field| {
                record
                    .get_str(field)
                    .filter(|value| !is_local_id(value))
                    .map(|value| (field, value))
            });
            match external {
                Some((field, value)) => {
                    fields.remove(field);
                    RecordRequest::for_upsert(object_type, field, value, fields)
                }
                None => RecordRequest::for_create(object_type, fields),
            }
        } else {
            let fields = build_fields_map(
                record,
                self.update_fieldlist,
                self.id_field_name,
                self.modification_date_field_name,
            );
            RecordRequest::for_update(object_type, id, fields)
        };
        Ok(Some(request.with_reference_id(id)))
    }
}

/// Reference id to server id, for every response that carried a new id.
pub fn parse_ids_from_responses(
    responses: &HashMap<String, RecordResponse>,
) -> HashMap<String, String> {
    responses
        .iter()
        .filter(|(_, r)| r.success)
        .filter_map(|(ref_id, r)| r.id.as_ref().map(|id| (ref_id.clone(), id.clone())))
        .collect()
}

/// Replaces a reference id held in `field` by the matching server id.
pub fn update_references(
    record: Record,
    field: &str,
    ref_id_to_server_id: &HashMap<String, String>,
) -> Record {
    let server_id = record
        .get_str(field)
        .and_then(|ref_id| ref_id_to_server_id.get(ref_id))
        .cloned();
    match server_id {
        Some(id) => record.with(field, id),
        None => record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DirtyState, ID, LAST_MODIFIED_DATE};
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn account(id: &str, state: DirtyState) -> Record {
        Record::new()
            .with_object_type("Account")
            .with(ID, id)
            .with("Name", "Acme")
            .with("Ext__c", "E-1")
            .with(LAST_MODIFIED_DATE, "2024-03-01T00:00:00.000Z")
            .with_dirty_state(state)
    }

    fn builder<'a>(
        create: &'a [String],
        update: &'a [String],
        ext: Option<&'a str>,
    ) -> RequestBuilder<'a> {
        RequestBuilder {
            id_field_name: ID,
            modification_date_field_name: LAST_MODIFIED_DATE,
            external_id_field_name: ext,
            create_fieldlist: create,
            update_fieldlist: update,
        }
    }

    #[test]
    fn build_rules() {
        let list = fields(&["Id", "Name", "Ext__c", "LastModifiedDate"]);
        let b = builder(&list, &list, None);

        let clean = account("001", DirtyState::CLEAN);
        assert!(b.build(&clean).unwrap().is_none());

        let local_only = account(
            "local_1",
            DirtyState {
                created: true,
                updated: false,
                deleted: true,
            },
        );
        assert!(b.build(&local_only).unwrap().is_none());

        let deleted = account("001", DirtyState { deleted: true, ..DirtyState::CLEAN });
        let req = b.build(&deleted).unwrap().unwrap();
        assert_eq!(req.request_type, RequestType::Delete);
        assert_eq!(req.id.as_deref(), Some("001"));
        assert!(req.fields.is_none());

        let created = account("local_2", DirtyState { created: true, ..DirtyState::CLEAN });
        let req = b.build(&created).unwrap().unwrap();
        assert_eq!(req.request_type, RequestType::Create);
        assert_eq!(req.reference_id, "local_2");
        let sent = req.fields.unwrap();
        assert!(!sent.contains_key("Id"));
        assert!(!sent.contains_key("LastModifiedDate"));
        assert_eq!(sent["Name"], "Acme");

        let updated = account("001", DirtyState { updated: true, ..DirtyState::CLEAN });
        let req = b.build(&updated).unwrap().unwrap();
        assert_eq!(req.request_type, RequestType::Update);
        assert_eq!(req.id.as_deref(), Some("001"));
    }

    #[test]
    fn upsert_when_external_id_is_set() {
        let list = fields(&["Name", "Ext__c"]);
        let b = builder(&list, &list, Some("Ext__c"));
        let created = account("local_3", DirtyState { created: true, ..DirtyState::CLEAN });
        let req = b.build(&created).unwrap().unwrap();
        assert_eq!(req.request_type, RequestType::Upsert);
        assert_eq!(req.external_id.as_deref(), Some("E-1"));
        assert!(!req.fields.unwrap().contains_key("Ext__c"));

        let local_ext = created.with("Ext__c", "local_9");
        let req = b.build(&local_ext).unwrap().unwrap();
        assert_eq!(req.request_type, RequestType::Create);
    }

    #[test]
    fn separate_create_and_update_lists() {
        let create = fields(&["Name", "Ext__c"]);
        let update = fields(&["Name"]);
        let b = builder(&create, &update, None);
        let updated = account("001", DirtyState { updated: true, ..DirtyState::CLEAN });
        let sent = b.build(&updated).unwrap().unwrap().fields.unwrap();
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn missing_object_type_is_an_error() {
        let list = fields(&["Name"]);
        let b = builder(&list, &list, None);
        let rec = Record::new()
            .with(ID, "001")
            .with_dirty_state(DirtyState { updated: true, ..DirtyState::CLEAN });
        assert!(matches!(
            b.build(&rec),
            Err(ProtocolError::MissingObjectType { .. })
        ));
    }

    #[test]
    fn null_fields_are_omitted() {
        let rec = Record::new().with("Name", Value::Null).with("Phone", "555");
        let names = fields(&["Name", "Phone", "Fax"]);
        let map = build_fields_map(&rec, &names, ID, LAST_MODIFIED_DATE);
        assert_eq!(map.len(), 1);
        assert_eq!(map["Phone"], "555");
    }

    #[test]
    fn rest_response_normalization() {
        let created = RestResponse::new(201, json!({"id": "001", "success": true}));
        let ok = RecordResponse::from_rest_response(&created);
        assert!(ok.success);
        assert_eq!(ok.id.as_deref(), Some("001"));

        let gone = RecordResponse::from_rest_response(&RestResponse::new(
            404,
            json!([{"errorCode": "NOT_FOUND", "message": "gone"}]),
        ));
        assert!(gone.record_does_not_exist);
        assert!(!gone.related_record_does_not_exist);
        assert!(gone.error_message().contains("NOT_FOUND"));

        let related = RecordResponse::from_rest_response(&RestResponse::new(
            400,
            json!([{"errorCode": ENTITY_IS_DELETED, "message": "parent deleted"}]),
        ));
        assert!(related.related_record_does_not_exist);
        assert!(!related.record_does_not_exist);
    }

    #[test]
    fn reference_resolution() {
        let mut responses = HashMap::new();
        responses.insert("local_1".to_string(), RecordResponse::succeeded(Some("001A".into())));
        responses.insert("001B".to_string(), RecordResponse::succeeded(None));
        responses.insert("local_2".to_string(), RecordResponse::failed(json!("bad")));
        let ids = parse_ids_from_responses(&responses);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids["local_1"], "001A");

        let rec = Record::new().with(ID, "local_1");
        assert_eq!(update_references(rec, ID, &ids).id(ID), Some("001A"));
        let rec = Record::new().with(ID, "001B");
        assert_eq!(update_references(rec, ID, &ids).id(ID), Some("001B"));
    }
}
