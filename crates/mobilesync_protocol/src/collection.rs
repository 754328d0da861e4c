//! Collection encoding: one request per operation kind.
//!
//! Records of the same kind travel together to a single endpoint and the
//! server answers with an array whose n-th entry matches the n-th record
//! sent. Correlation is therefore positional.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{ATTRIBUTES, ID};
use crate::request::{RecordRequest, RecordResponse, RequestType, ENTITY_IS_DELETED};
use crate::rest::{RestMethod, RestRequest, RestResponse};
use serde_json::{json, Map, Value};

/// Maximum records in one collection request.
pub const MAX_RECORDS_SOBJECT_COLLECTION_API: usize = 200;

fn collection_record(request: &RecordRequest) -> Value {
    let mut record = Map::new();
    record.insert(ATTRIBUTES.into(), json!({ "type": request.object_type }));
    if let Some(fields) = &request.fields {
        record.extend(fields.clone());
    }
    if let Some(id) = &request.id {
        record.insert(ID.into(), Value::from(id.clone()));
    }
    if let (Some(field), Some(value)) = (&request.external_id_field_name, &request.external_id) {
        record.insert(field.clone(), Value::from(value.clone()));
    }
    Value::Object(record)
}

/// Encodes same-kind record requests as one collection request.
///
/// Upserts must share one object type and one external id field.
pub fn collection_request(
    api_version: &str,
    all_or_none: bool,
    request_type: RequestType,
    requests: &[RecordRequest],
) -> ProtocolResult<RestRequest> {
    if requests.len() > MAX_RECORDS_SOBJECT_COLLECTION_API {
        return Err(ProtocolError::BatchTooLarge {
            size: requests.len(),
            max: MAX_RECORDS_SOBJECT_COLLECTION_API,
        });
    }
    if let Some(other) = requests.iter().find(|r| r.request_type != request_type) {
        return Err(ProtocolError::InvalidRecord(format!(
            "{:?} request {} in a {:?} collection",
            other.request_type, other.reference_id, request_type
        )));
    }
    let base = format!("/services/data/{api_version}/composite/sobjects");
    let records = || -> Vec<Value> { requests.iter().map(collection_record).collect() };

    let request = match request_type {
        RequestType::Create => RestRequest::new(
            RestMethod::Post,
            base,
            Some(json!({ "allOrNone": all_or_none, "records": records() })),
        ),
        RequestType::Update => RestRequest::new(
            RestMethod::Patch,
            base,
            Some(json!({ "allOrNone": all_or_none, "records": records() })),
        ),
        RequestType::Upsert => {
            let (object_type, external_field) = upsert_target(requests)?;
            RestRequest::new(
                RestMethod::Patch,
                format!("{base}/{object_type}/{external_field}"),
                Some(json!({ "allOrNone": all_or_none, "records": records() })),
            )
        }
        RequestType::Delete => {
            let ids: Vec<&str> = requests.iter().filter_map(|r| r.id.as_deref()).collect();
            RestRequest::new(
                RestMethod::Delete,
                format!("{base}?ids={}&allOrNone={all_or_none}", ids.join(",")),
                None,
            )
        }
    };
    Ok(request)
}

fn upsert_target(requests: &[RecordRequest]) -> ProtocolResult<(&str, &str)> {
    let first = requests
        .first()
        .ok_or_else(|| ProtocolError::InvalidRecord("empty upsert collection".into()))?;
    let object_type = first.object_type.as_str();
    let external_field = first.external_id_field_name.as_deref().unwrap_or_default();
    for request in requests {
        let field = request.external_id_field_name.as_deref().unwrap_or_default();
        if request.object_type != object_type || field != external_field {
            return Err(ProtocolError::MixedUpsertCollection(format!(
                "{object_type}/{external_field} and {}/{field}",
                request.object_type
            )));
        }
    }
    Ok((object_type, external_field))
}

/// Normalizes one collection sub-response.
///
/// `ENTITY_IS_DELETED` is attributed by request kind: updates and deletes
/// address an existing record, so the record itself is gone; creates and
/// upserts have no server identity yet, so the error is about a record
/// they reference.
pub fn record_response_from_collection_sub_response(
    request_type: RequestType,
    sub: &Value,
) -> RecordResponse {
    let success = sub.get("success").and_then(Value::as_bool).unwrap_or(false);
    if success {
        let id = sub.get("id").and_then(Value::as_str).map(str::to_string);
        return RecordResponse::succeeded(id);
    }
    let errors = sub
        .get("errors")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let entity_deleted = errors
        .iter()
        .any(|e| e.get("statusCode").and_then(Value::as_str) == Some(ENTITY_IS_DELETED));
    let addresses_existing = matches!(request_type, RequestType::Update | RequestType::Delete);
    RecordResponse {
        success: false,
        id: None,
        record_does_not_exist: entity_deleted && addresses_existing,
        related_record_does_not_exist: entity_deleted && !addresses_existing,
        error: errors.first().cloned().or_else(|| Some(sub.clone())),
    }
}

/// Parses a collection response, one entry per request sent.
pub fn parse_collection_response(
    request_type: RequestType,
    response: &RestResponse,
    expected: usize,
) -> ProtocolResult<Vec<RecordResponse>> {
    let subs = response.as_array()?;
    if subs.len() != expected {
        return Err(ProtocolError::invalid_response(format!(
            "collection response has {} entries for {expected} requests",
            subs.len()
        )));
    }
    Ok(subs
        .iter()
        .map(|sub| record_response_from_collection_sub_response(request_type, sub))
        .collect())
}
