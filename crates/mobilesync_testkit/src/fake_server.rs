//! In-memory fake of the REST API.
//!
//! [`FakeServer`] keeps records per object type and answers the endpoints
//! the sync targets use: single record CRUD, composite requests with
//! reference resolution, sObject collections, collection retrieve, object
//! metadata and describe, and paged SOQL queries over flat objects.
//! Unsupported endpoints answer 404.

use crate::soql::SoqlQuery;
use mobilesync_engine::{RestClient, SyncError, SyncResult, DEFAULT_API_VERSION};
use mobilesync_protocol::record::{ATTRIBUTES, ID, LAST_MODIFIED_DATE};
use mobilesync_protocol::rest::QUERY_OPTIONS_HEADER;
use mobilesync_protocol::{timestamp, Record, RestMethod, RestRequest, RestResponse};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Default number of records per query page.
pub const DEFAULT_QUERY_PAGE_SIZE: usize = 2000;

/// Server clock start: 2024-01-01T00:00:00.000Z.
const EPOCH_MILLIS: i64 = 1_704_067_200_000;

/// Maximum number of recent items reported by object metadata.
const MAX_RECENT_ITEMS: usize = 200;

#[derive(Debug, Default)]
struct ServerState {
    objects: BTreeMap<String, BTreeMap<String, Record>>,
    next_id: u64,
    clock: i64,
    recent: Vec<(String, String)>,
    cursors: HashMap<String, Vec<Value>>,
    next_cursor: u64,
}

impl ServerState {
    fn tick(&mut self) -> String {
        self.clock += 1000;
        timestamp::format_millis(EPOCH_MILLIS + self.clock).unwrap_or_default()
    }

    fn new_id(&mut self, object_type: &str) -> String {
        self.next_id += 1;
        let prefix: String = object_type
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(3)
            .collect::<String>()
            .to_ascii_uppercase();
        format!("{prefix:0<3}{:012}", self.next_id)
    }

    fn touch(&mut self, object_type: &str, id: &str) {
        self.recent.retain(|(t, i)| !(t == object_type && i == id));
        self.recent.push((object_type.to_string(), id.to_string()));
    }

    fn find(&self, object_type: &str, id: &str) -> Option<&Record> {
        self.objects.get(object_type).and_then(|records| records.get(id))
    }

    fn find_by_field(&self, object_type: &str, field: &str, value: &str) -> Option<String> {
        self.objects.get(object_type).and_then(|records| {
            records
                .iter()
                .find(|(_, r)| r.get_str(field) == Some(value))
                .map(|(id, _)| id.clone())
        })
    }

    fn create(&mut self, object_type: &str, fields: Map<String, Value>) -> String {
        let id = self.new_id(object_type);
        let modified = self.tick();
        let mut record = Record::from_map(writable(fields)).with_object_type(object_type);
        record.insert(ID, id.clone());
        record.insert(LAST_MODIFIED_DATE, modified);
        self.objects
            .entry(object_type.to_string())
            .or_default()
            .insert(id.clone(), record);
        self.touch(object_type, &id);
        id
    }

    fn update(&mut self, object_type: &str, id: &str, fields: Map<String, Value>) -> bool {
        let modified = self.tick();
        let Some(record) = self
            .objects
            .get_mut(object_type)
            .and_then(|records| records.get_mut(id))
        else {
            return false;
        };
        for (field, value) in writable(fields) {
            record.insert(field, value);
        }
        record.insert(LAST_MODIFIED_DATE, modified);
        self.touch(object_type, id);
        true
    }

    fn delete(&mut self, object_type: &str, id: &str) -> bool {
        let removed = self
            .objects
            .get_mut(object_type)
            .and_then(|records| records.remove(id))
            .is_some();
        if removed {
            self.recent.retain(|(t, i)| !(t == object_type && i == id));
        }
        removed
    }

    fn delete_anywhere(&mut self, id: &str) -> bool {
        let object_type = self
            .objects
            .iter()
            .find(|(_, records)| records.contains_key(id))
            .map(|(t, _)| t.clone());
        match object_type {
            Some(object_type) => self.delete(&object_type, id),
            None => false,
        }
    }
}

/// Drops fields the server owns.
fn writable(mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.remove(ATTRIBUTES);
    fields.remove(ID);
    fields.remove(LAST_MODIFIED_DATE);
    fields
}

fn body_fields(request: &RestRequest) -> Map<String, Value> {
    match &request.body {
        Some(Value::Object(fields)) => fields.clone(),
        _ => Map::new(),
    }
}

fn error_body(code: &str, message: &str) -> Value {
    json!([{ "errorCode": code, "message": message }])
}

fn not_found(what: &str) -> RestResponse {
    RestResponse::new(404, error_body("NOT_FOUND", &format!("{what} does not exist")))
}

fn collection_error(code: &str, message: &str) -> Value {
    json!({
        "id": null,
        "success": false,
        "errors": [{ "statusCode": code, "message": message, "fields": [] }]
    })
}

fn collection_success(id: &str) -> Value {
    json!({ "id": id, "success": true, "errors": [] })
}

fn parse_method(method: &str) -> Option<RestMethod> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(RestMethod::Get),
        "POST" => Some(RestMethod::Post),
        "PATCH" => Some(RestMethod::Patch),
        "DELETE" => Some(RestMethod::Delete),
        _ => None,
    }
}

/// Replaces `@{ref.id}` placeholders in every string of `value`.
fn resolve_references(value: &mut Value, references: &HashMap<String, String>) {
    match value {
        Value::String(s) if s.contains("@{") => {
            for (reference, id) in references {
                *s = s.replace(&format!("@{{{reference}.id}}"), id);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_references(v, references)),
        Value::Object(map) => map.values_mut().for_each(|v| resolve_references(v, references)),
        _ => {}
    }
}

fn project(record: &Record, fields: &[&str]) -> Value {
    let mut projected = Map::new();
    if let Some(attributes) = record.get(ATTRIBUTES) {
        projected.insert(ATTRIBUTES.into(), attributes.clone());
    }
    for field in fields {
        let value = record.project(field).cloned().unwrap_or(Value::Null);
        projected.insert(field.to_string(), value);
    }
    Value::Object(projected)
}

/// A fake REST server usable as a [`RestClient`].
#[derive(Debug)]
pub struct FakeServer {
    api_version: String,
    page_size: usize,
    connected: AtomicBool,
    state: Mutex<ServerState>,
    requests: Mutex<Vec<RestRequest>>,
    scripted: Mutex<VecDeque<RestResponse>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    /// Creates an empty server for the default API version.
    pub fn new() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            page_size: DEFAULT_QUERY_PAGE_SIZE,
            connected: AtomicBool::new(true),
            state: Mutex::new(ServerState::default()),
            requests: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
        }
    }

    /// Sets the API version the server answers for.
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Sets the default number of records per query page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Creates a record server side and returns its id.
    pub fn insert(&self, object_type: &str, fields: Value) -> String {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.lock().create(object_type, fields)
    }

    /// Changes a record server side, bumping its modification date.
    pub fn modify(&self, object_type: &str, id: &str, fields: Value) -> bool {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.lock().update(object_type, id, fields)
    }

    /// Deletes a record server side.
    pub fn remove(&self, object_type: &str, id: &str) -> bool {
        self.state.lock().delete(object_type, id)
    }

    /// A stored record.
    pub fn get(&self, object_type: &str, id: &str) -> Option<Record> {
        self.state.lock().find(object_type, id).cloned()
    }

    /// All stored records of a type, in creation order.
    pub fn records(&self, object_type: &str) -> Vec<Record> {
        self.state
            .lock()
            .objects
            .get(object_type)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stored records of a type.
    pub fn count(&self, object_type: &str) -> usize {
        self.state
            .lock()
            .objects
            .get(object_type)
            .map_or(0, BTreeMap::len)
    }

    /// Requests received so far, composite sub-requests not expanded.
    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Forgets the requests received so far.
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// Queues a response returned as is for the next request.
    pub fn respond_next(&self, response: RestResponse) {
        self.scripted.lock().push_back(response);
    }

    /// Sets the connected state; a disconnected server fails every request.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answers one request.
    pub fn handle(&self, request: &RestRequest) -> RestResponse {
        let base = format!("/services/data/{}", self.api_version);
        let Some(rest) = request.path_only().strip_prefix(&base) else {
            return not_found(request.path_only());
        };
        let segments: Vec<&str> = rest.trim_matches('/').split('/').collect();
        match (request.method, segments.as_slice()) {
            (RestMethod::Post, ["composite"]) => self.composite(request),
            (RestMethod::Get, ["query"]) => self.query(request),
            (RestMethod::Get, ["query", cursor]) => self.query_more(cursor),
            (RestMethod::Post, ["composite", "sobjects"]) => self.collection_create(request),
            (RestMethod::Patch, ["composite", "sobjects"]) => self.collection_update(request),
            (RestMethod::Patch, ["composite", "sobjects", object_type, field]) => {
                self.collection_upsert(request, object_type, field)
            }
            (RestMethod::Delete, ["composite", "sobjects"]) => self.collection_delete(request),
            (RestMethod::Post, ["composite", "sobjects", object_type]) => {
                self.collection_retrieve(request, object_type)
            }
            (RestMethod::Get, ["sobjects", object_type]) => self.metadata(object_type),
            (RestMethod::Get, ["sobjects", object_type, "describe"]) => self.describe(object_type),
            (RestMethod::Post, ["sobjects", object_type]) => {
                let id = self.state.lock().create(object_type, body_fields(request));
                RestResponse::new(201, json!({ "id": id, "success": true, "errors": [] }))
            }
            (RestMethod::Get, ["sobjects", object_type, id]) => {
                self.retrieve(request, object_type, id)
            }
            (RestMethod::Patch, ["sobjects", object_type, id]) => {
                if self.state.lock().update(object_type, id, body_fields(request)) {
                    RestResponse::new(204, Value::Null)
                } else {
                    not_found(id)
                }
            }
            (RestMethod::Patch, ["sobjects", object_type, field, value]) => {
                self.upsert(request, object_type, field, value)
            }
            (RestMethod::Delete, ["sobjects", object_type, id]) => {
                if self.state.lock().delete(object_type, id) {
                    RestResponse::new(204, Value::Null)
                } else {
                    not_found(id)
                }
            }
            _ => not_found(request.path_only()),
        }
    }

    fn upsert(
        &self,
        request: &RestRequest,
        object_type: &str,
        field: &str,
        value: &str,
    ) -> RestResponse {
        let mut state = self.state.lock();
        let mut fields = body_fields(request);
        match state.find_by_field(object_type, field, value) {
            Some(id) => {
                state.update(object_type, &id, fields);
                RestResponse::new(
                    200,
                    json!({ "id": id, "created": false, "success": true, "errors": [] }),
                )
            }
            None => {
                fields.insert(field.to_string(), Value::from(value));
                let id = state.create(object_type, fields);
                RestResponse::new(
                    201,
                    json!({ "id": id, "created": true, "success": true, "errors": [] }),
                )
            }
        }
    }

    fn retrieve(&self, request: &RestRequest, object_type: &str, id: &str) -> RestResponse {
        let state = self.state.lock();
        let Some(record) = state.find(object_type, id) else {
            return not_found(id);
        };
        let body = match request.query_param("fields") {
            Some(fields) => project(record, &fields.split(',').map(str::trim).collect::<Vec<_>>()),
            None => record.clone().into_value(),
        };
        RestResponse::new(200, body)
    }

    fn composite(&self, request: &RestRequest) -> RestResponse {
        let subs = request
            .body
            .as_ref()
            .and_then(|b| b.get("compositeRequest"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut references: HashMap<String, String> = HashMap::new();
        let mut responses = Vec::with_capacity(subs.len());
        for mut sub in subs {
            resolve_references(&mut sub, &references);
            let reference_id = sub
                .get("referenceId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let method = sub.get("method").and_then(Value::as_str).and_then(parse_method);
            let url = sub.get("url").and_then(Value::as_str).unwrap_or_default();
            let response = match method {
                Some(method) => {
                    self.handle(&RestRequest::new(method, url, sub.get("body").cloned()))
                }
                None => RestResponse::new(400, error_body("INVALID_METHOD", "unsupported method")),
            };
            if let Some(id) = response.body.get("id").and_then(Value::as_str) {
                references.insert(reference_id.clone(), id.to_string());
            }
            responses.push(json!({
                "body": response.body,
                "httpHeaders": {},
                "httpStatusCode": response.status,
                "referenceId": reference_id,
            }));
        }
        RestResponse::new(200, json!({ "compositeResponse": responses }))
    }

    fn collection_records(request: &RestRequest) -> Vec<Map<String, Value>> {
        request
            .body
            .as_ref()
            .and_then(|b| b.get("records"))
            .and_then(Value::as_array)
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| r.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn collection_create(&self, request: &RestRequest) -> RestResponse {
        let mut state = self.state.lock();
        let results: Vec<Value> = Self::collection_records(request)
            .into_iter()
            .map(|fields| {
                let record = Record::from_map(fields);
                match record.object_type().map(str::to_string) {
                    Some(object_type) => {
                        collection_success(&state.create(&object_type, record.into_map()))
                    }
                    None => collection_error("INVALID_TYPE", "missing attributes.type"),
                }
            })
            .collect();
        RestResponse::new(200, Value::Array(results))
    }

    fn collection_update(&self, request: &RestRequest) -> RestResponse {
        let mut state = self.state.lock();
        let results: Vec<Value> = Self::collection_records(request)
            .into_iter()
            .map(|fields| {
                let record = Record::from_map(fields);
                let object_type = record.object_type().unwrap_or_default().to_string();
                let id = record.id(ID).unwrap_or_default().to_string();
                if state.update(&object_type, &id, record.into_map()) {
                    collection_success(&id)
                } else {
                    collection_error("ENTITY_IS_DELETED", "entity is deleted")
                }
            })
            .collect();
        RestResponse::new(200, Value::Array(results))
    }

    fn collection_upsert(
        &self,
        request: &RestRequest,
        object_type: &str,
        field: &str,
    ) -> RestResponse {
        let mut state = self.state.lock();
        let results: Vec<Value> = Self::collection_records(request)
            .into_iter()
            .map(|fields| {
                let value = fields.get(field).and_then(Value::as_str).map(str::to_string);
                let Some(value) = value else {
                    return collection_error("MISSING_ARGUMENT", "missing external id");
                };
                match state.find_by_field(object_type, field, &value) {
                    Some(id) => {
                        state.update(object_type, &id, fields);
                        json!({ "id": id, "success": true, "created": false, "errors": [] })
                    }
                    None => {
                        let id = state.create(object_type, fields);
                        json!({ "id": id, "success": true, "created": true, "errors": [] })
                    }
                }
            })
            .collect();
        RestResponse::new(200, Value::Array(results))
    }

    fn collection_delete(&self, request: &RestRequest) -> RestResponse {
        let ids = request.query_param("ids").unwrap_or_default();
        let mut state = self.state.lock();
        let results: Vec<Value> = ids
            .split(',')
            .filter(|id| !id.is_empty())
            .map(|id| {
                if state.delete_anywhere(id) {
                    collection_success(id)
                } else {
                    collection_error("ENTITY_IS_DELETED", "entity is deleted")
                }
            })
            .collect();
        RestResponse::new(200, Value::Array(results))
    }

    fn collection_retrieve(&self, request: &RestRequest, object_type: &str) -> RestResponse {
        let strings = |key: &str| -> Vec<String> {
            request
                .body
                .as_ref()
                .and_then(|b| b.get(key))
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let fields = strings("fields");
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        let state = self.state.lock();
        let results: Vec<Value> = strings("ids")
            .iter()
            .map(|id| {
                state
                    .find(object_type, id)
                    .map_or(Value::Null, |record| project(record, &fields))
            })
            .collect();
        RestResponse::new(200, Value::Array(results))
    }

    fn metadata(&self, object_type: &str) -> RestResponse {
        let state = self.state.lock();
        let recent: Vec<Value> = state
            .recent
            .iter()
            .rev()
            .filter(|(t, _)| t == object_type)
            .take(MAX_RECENT_ITEMS)
            .map(|(_, id)| json!({ "attributes": { "type": object_type }, "Id": id }))
            .collect();
        RestResponse::new(
            200,
            json!({
                "objectDescribe": { "name": object_type, "queryable": true },
                "recentItems": recent,
            }),
        )
    }

    fn describe(&self, object_type: &str) -> RestResponse {
        let state = self.state.lock();
        let mut names: Vec<String> = vec![ID.to_string(), LAST_MODIFIED_DATE.to_string()];
        for record in state.objects.get(object_type).into_iter().flat_map(BTreeMap::values) {
            for field in record.as_map().keys() {
                if field != ATTRIBUTES && !names.contains(field) {
                    names.push(field.clone());
                }
            }
        }
        let fields: Vec<Value> = names.iter().map(|n| json!({ "name": n })).collect();
        RestResponse::new(200, json!({ "name": object_type, "fields": fields }))
    }

    fn page_size(&self, request: &RestRequest) -> usize {
        request
            .headers
            .get(QUERY_OPTIONS_HEADER)
            .and_then(|options| options.strip_prefix("batchSize="))
            .and_then(|size| size.trim().parse::<usize>().ok())
            .map_or(self.page_size, |size| size.clamp(1, self.page_size))
    }

    fn query(&self, request: &RestRequest) -> RestResponse {
        let soql = request.query_param("q").unwrap_or_default();
        let query = match SoqlQuery::parse(&soql) {
            Ok(query) => query,
            Err(message) => return RestResponse::new(400, error_body("MALFORMED_QUERY", &message)),
        };
        let page_size = self.page_size(request);
        let mut state = self.state.lock();
        let rows = query.apply(
            state
                .objects
                .get(query.object_type())
                .into_iter()
                .flat_map(BTreeMap::values),
        );
        let total = rows.len();
        self.page(&mut state, rows, total, page_size)
    }

    fn query_more(&self, cursor: &str) -> RestResponse {
        let mut state = self.state.lock();
        let Some(rows) = state.cursors.remove(cursor) else {
            return RestResponse::new(400, error_body("INVALID_QUERY_LOCATOR", cursor));
        };
        let (total, page_size) = cursor_parts(cursor);
        self.page(&mut state, rows, total, page_size)
    }

    fn page(
        &self,
        state: &mut ServerState,
        mut rows: Vec<Value>,
        total: usize,
        page_size: usize,
    ) -> RestResponse {
        let rest = if rows.len() > page_size {
            rows.split_off(page_size)
        } else {
            Vec::new()
        };
        let mut body = json!({
            "totalSize": total,
            "done": rest.is_empty(),
            "records": rows,
        });
        if !rest.is_empty() {
            state.next_cursor += 1;
            let cursor = format!("01g{}-{total}-{page_size}", state.next_cursor);
            body["nextRecordsUrl"] =
                Value::from(format!("/services/data/{}/query/{cursor}", self.api_version));
            state.cursors.insert(cursor, rest);
        }
        RestResponse::new(200, body)
    }
}

/// Total size and page size encoded in a query cursor.
fn cursor_parts(cursor: &str) -> (usize, usize) {
    let mut parts = cursor.rsplitn(3, '-');
    let page_size = parts.next().and_then(|p| p.parse().ok()).unwrap_or(DEFAULT_QUERY_PAGE_SIZE);
    let total = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (total, page_size)
}

impl RestClient for FakeServer {
    fn send(&self, request: &RestRequest) -> SyncResult<RestResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("fake server disconnected"));
        }
        self.requests.lock().push(request.clone());
        debug!(method = request.method.as_str(), path = request.path_only(), "fake server request");
        if let Some(response) = self.scripted.lock().pop_front() {
            return Ok(response);
        }
        Ok(self.handle(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilesync_protocol::soql::SoqlBuilder;

    fn api() -> &'static str {
        DEFAULT_API_VERSION
    }

    #[test]
    fn crud_round_trip() {
        let server = FakeServer::new();
        let mut fields = Map::new();
        fields.insert("Name".into(), json!("Acme"));
        let created = server.handle(&RestRequest::create(api(), "Account", fields));
        assert_eq!(created.status, 201);
        let id = created.body["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("ACC"));

        let mut change = Map::new();
        change.insert("Name".into(), json!("Acme Corp"));
        assert_eq!(server.handle(&RestRequest::update(api(), "Account", &id, change)).status, 204);
        assert_eq!(server.get("Account", &id).unwrap().get_str("Name"), Some("Acme Corp"));

        let fetched =
            server.handle(&RestRequest::retrieve(api(), "Account", &id, &["Name".into()]));
        assert_eq!(fetched.body["Name"], "Acme Corp");

        assert_eq!(server.handle(&RestRequest::delete(api(), "Account", &id)).status, 204);
        assert_eq!(server.handle(&RestRequest::delete(api(), "Account", &id)).status, 404);
        assert_eq!(server.count("Account"), 0);
    }

    #[test]
    fn writes_bump_modification_dates() {
        let server = FakeServer::new();
        let id = server.insert("Account", json!({ "Name": "Acme" }));
        let before = server.get("Account", &id).unwrap();
        server.modify("Account", &id, json!({ "Name": "Acme 2" }));
        let after = server.get("Account", &id).unwrap();
        assert!(
            timestamp::compare(
                after.get_str(LAST_MODIFIED_DATE).unwrap(),
                before.get_str(LAST_MODIFIED_DATE).unwrap()
            )
            .is_gt()
        );
    }

    #[test]
    fn composite_resolves_references() {
        let server = FakeServer::new();
        let request = RestRequest::new(
            RestMethod::Post,
            format!("/services/data/{}/composite", api()),
            Some(json!({
                "allOrNone": false,
                "compositeRequest": [
                    {
                        "method": "POST",
                        "url": format!("/services/data/{}/sobjects/Account", api()),
                        "referenceId": "parent",
                        "body": { "Name": "Acme" }
                    },
                    {
                        "method": "POST",
                        "url": format!("/services/data/{}/sobjects/Contact", api()),
                        "referenceId": "child",
                        "body": { "LastName": "Doe", "AccountId": "@{parent.id}" }
                    }
                ]
            })),
        );
        let response = server.handle(&request);
        let subs = response.body["compositeResponse"].as_array().unwrap();
        assert_eq!(subs.len(), 2);
        let parent_id = subs[0]["body"]["id"].as_str().unwrap();
        let child_id = subs[1]["body"]["id"].as_str().unwrap();
        let child = server.get("Contact", child_id).unwrap();
        assert_eq!(child.get_str("AccountId"), Some(parent_id));
    }

    #[test]
    fn collection_update_reports_deleted_entities() {
        let server = FakeServer::new();
        let id = server.insert("Account", json!({ "Name": "Acme" }));
        let request = RestRequest::new(
            RestMethod::Patch,
            format!("/services/data/{}/composite/sobjects", api()),
            Some(json!({
                "allOrNone": false,
                "records": [
                    { "attributes": { "type": "Account" }, "Id": id, "Name": "x" },
                    { "attributes": { "type": "Account" }, "Id": "ACC999", "Name": "y" }
                ]
            })),
        );
        let response = server.handle(&request);
        assert_eq!(response.body[0]["success"], true);
        assert_eq!(response.body[1]["errors"][0]["statusCode"], "ENTITY_IS_DELETED");
    }

    #[test]
    fn queries_are_paged() {
        let server = FakeServer::new().with_page_size(2);
        for name in ["a", "b", "c", "d", "e"] {
            server.insert("Account", json!({ "Name": name }));
        }
        let soql = SoqlBuilder::with_fields(["Id", "Name"])
            .from("Account")
            .order_by("Name")
            .build()
            .unwrap();
        let first = server.handle(&RestRequest::query(api(), &soql, None));
        assert_eq!(first.body["totalSize"], 5);
        assert_eq!(first.body["records"].as_array().unwrap().len(), 2);

        let mut names = Vec::new();
        let mut page = first;
        loop {
            for record in page.body["records"].as_array().unwrap() {
                names.push(record["Name"].as_str().unwrap().to_string());
            }
            let Some(next) = page.body.get("nextRecordsUrl").and_then(Value::as_str) else {
                break;
            };
            page = server.handle(&RestRequest::query_next(next));
            assert_eq!(page.body["totalSize"], 5);
        }
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn metadata_lists_recent_items_newest_first() {
        let server = FakeServer::new();
        let first = server.insert("Account", json!({ "Name": "a" }));
        let second = server.insert("Account", json!({ "Name": "b" }));
        server.modify("Account", &first, json!({ "Name": "a2" }));
        let response = server.handle(&RestRequest::metadata(api(), "Account"));
        let ids: Vec<&str> = response.body["recentItems"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|item| item["Id"].as_str())
            .collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
    }

    #[test]
    fn disconnected_server_fails_requests() {
        let server = FakeServer::new();
        server.set_connected(false);
        let err = server
            .send(&RestRequest::describe(api(), "Account"))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(server.request_count(), 0);
    }

    #[test]
    fn scripted_responses_come_first() {
        let server = FakeServer::new();
        server.respond_next(RestResponse::new(503, json!([])));
        let request = RestRequest::describe(api(), "Account");
        assert_eq!(server.send(&request).unwrap().status, 503);
        assert_eq!(server.send(&request).unwrap().status, 200);
    }
}
