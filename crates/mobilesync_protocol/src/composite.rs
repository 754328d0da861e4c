//! Composite encoding: one sub-request per record in a single round trip.
//!
//! Each sub-request carries a caller chosen `referenceId` that the server
//! echoes back, and later sub-requests may point at the id created by an
//! earlier one through an `@{referenceId.id}` placeholder.

use crate::error::{ProtocolError, ProtocolResult};
use crate::request::{error_code, first_error, RecordRequest, RecordResponse, ENTITY_IS_DELETED};
use crate::rest::{is_success_status, RestMethod, RestRequest, RestResponse};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Maximum sub-requests in one composite request.
pub const MAX_SUB_REQUESTS_COMPOSITE_API: usize = 25;

/// Placeholder resolved server side to the id created by `reference_id`.
pub fn reference_placeholder(reference_id: &str) -> String {
    format!("@{{{reference_id}.id}}")
}

fn sub_request(api_version: &str, request: &RecordRequest) -> Value {
    let rest = request.as_rest_request(api_version);
    let mut sub = Map::new();
    sub.insert("method".into(), Value::from(rest.method.as_str()));
    sub.insert("url".into(), Value::from(rest.path));
    sub.insert("referenceId".into(), Value::from(request.reference_id.clone()));
    if let Some(body) = rest.body {
        sub.insert("body".into(), body);
    }
    Value::Object(sub)
}

/// Encodes record requests as one composite request.
pub fn composite_request(
    api_version: &str,
    all_or_none: bool,
    requests: &[RecordRequest],
) -> ProtocolResult<RestRequest> {
    if requests.len() > MAX_SUB_REQUESTS_COMPOSITE_API {
        return Err(ProtocolError::BatchTooLarge {
            size: requests.len(),
            max: MAX_SUB_REQUESTS_COMPOSITE_API,
        });
    }
    let subs: Vec<Value> = requests.iter().map(|r| sub_request(api_version, r)).collect();
    Ok(RestRequest::new(
        RestMethod::Post,
        format!("/services/data/{api_version}/composite"),
        Some(json!({ "allOrNone": all_or_none, "compositeRequest": subs })),
    ))
}

/// Normalizes one composite sub-response.
pub fn record_response_from_sub_response(sub: &Value) -> RecordResponse {
    let status = sub
        .get("httpStatusCode")
        .and_then(Value::as_u64)
        .unwrap_or_default() as u16;
    let body = sub.get("body").cloned().unwrap_or(Value::Null);
    if is_success_status(status) {
        let id = body.get("id").and_then(Value::as_str).map(str::to_string);
        return RecordResponse::succeeded(id);
    }
    let error = first_error(&body);
    let record_does_not_exist = status == 404;
    let related_record_does_not_exist =
        !record_does_not_exist && error_code(error.as_ref()) == Some(ENTITY_IS_DELETED);
    RecordResponse {
        success: false,
        id: None,
        record_does_not_exist,
        related_record_does_not_exist,
        error: error.or(Some(body)),
    }
}

/// Parses a composite response into reference id to response.
pub fn parse_composite_response(
    response: &RestResponse,
) -> ProtocolResult<HashMap<String, RecordResponse>> {
    let subs = response
        .as_object()?
        .get("compositeResponse")
        .and_then(Value::as_array)
        .ok_or_else(|| ProtocolError::invalid_response("missing compositeResponse"))?;
    subs.iter()
        .map(|sub| {
            let reference_id = sub
                .get("referenceId")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProtocolError::invalid_response("sub-response without referenceId")
                })?;
            Ok((reference_id.to_string(), record_response_from_sub_response(sub)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_format() {
        assert_eq!(reference_placeholder("local_1"), "@{local_1.id}");
    }

    #[test]
    fn encodes_sub_requests_in_order() {
        let mut fields = Map::new();
        fields.insert("Name".into(), json!("Acme"));
        let requests = vec![
            RecordRequest::for_create("Account", fields).with_reference_id("local_1"),
            RecordRequest::for_delete("Contact", "003").with_reference_id("003"),
        ];
        let req = composite_request("v60.0", false, &requests).unwrap();
        assert_eq!(req.path, "/services/data/v60.0/composite");
        let body = req.body.unwrap();
        assert_eq!(body["allOrNone"], false);
        let subs = body["compositeRequest"].as_array().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0]["method"], "POST");
        assert_eq!(subs[0]["url"], "/services/data/v60.0/sobjects/Account");
        assert_eq!(subs[0]["referenceId"], "local_1");
        assert_eq!(subs[0]["body"]["Name"], "Acme");
        assert_eq!(subs[1]["method"], "DELETE");
        assert!(subs[1].get("body").is_none());
    }

    #[test]
    fn rejects_oversized_batches() {
        let requests: Vec<RecordRequest> = (0..26)
            .map(|i| {
                let id = i.to_string();
                RecordRequest::for_delete("Account", &id).with_reference_id(id)
            })
            .collect();
        assert!(matches!(
            composite_request("v60.0", false, &requests),
            Err(ProtocolError::BatchTooLarge { size: 26, max: 25 })
        ));
    }

    #[test]
    fn parses_mixed_outcomes() {
        let response = RestResponse::new(
            200,
            json!({ "compositeResponse": [
                { "referenceId": "local_1", "httpStatusCode": 201,
                  "body": { "id": "001A", "success": true } },
                { "referenceId": "001B", "httpStatusCode": 204, "body": null },
                { "referenceId": "001C", "httpStatusCode": 404,
                  "body": [{ "errorCode": "NOT_FOUND", "message": "missing" }] },
                { "referenceId": "003D", "httpStatusCode": 400,
                  "body": [{ "errorCode": "ENTITY_IS_DELETED", "message": "parent deleted" }] },
            ]}),
        );
        let parsed = parse_composite_response(&response).unwrap();
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed["local_1"].id.as_deref(), Some("001A"));
        assert!(parsed["001B"].success);
        assert!(parsed["001B"].id.is_none());
        assert!(parsed["001C"].record_does_not_exist);
        assert!(parsed["003D"].related_record_does_not_exist);
        assert!(!parsed["003D"].record_does_not_exist);
    }

    #[test]
    fn malformed_response() {
        let response = RestResponse::new(200, json!({ "results": [] }));
        assert!(matches!(
            parse_composite_response(&response),
            Err(ProtocolError::InvalidResponse(_))
        ));
    }
}
