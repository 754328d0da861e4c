//! REST request and response shapes.
//!
//! These types describe what goes over the wire; sending them is the job of
//! the transport in the engine crate.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Header carrying query options such as the page size.
pub const QUERY_OPTIONS_HEADER: &str = "Sforce-Query-Options";

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl RestMethod {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RestMethod::Get => "GET",
            RestMethod::Post => "POST",
            RestMethod::Patch => "PATCH",
            RestMethod::Delete => "DELETE",
        }
    }
}

/// A REST request ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    /// HTTP method.
    pub method: RestMethod,
    /// Path relative to the instance URL, query string included.
    pub path: String,
    /// JSON body.
    pub body: Option<Value>,
    /// Extra headers.
    pub headers: BTreeMap<String, String>,
}

fn base_path(api_version: &str) -> String {
    format!("/services/data/{api_version}")
}

fn encode_query(pairs: &[(&str, &str)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

impl RestRequest {
    /// Creates a request.
    pub fn new(method: RestMethod, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            headers: BTreeMap::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Path without its query string.
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Decoded query string parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let (_, query) = self.path.split_once('?')?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Creates a record.
    pub fn create(api_version: &str, object_type: &str, fields: Map<String, Value>) -> Self {
        Self::new(
            RestMethod::Post,
            format!("{}/sobjects/{object_type}", base_path(api_version)),
            Some(Value::Object(fields)),
        )
    }

    /// Updates a record.
    pub fn update(
        api_version: &str,
        object_type: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Self {
        Self::new(
            RestMethod::Patch,
            format!("{}/sobjects/{object_type}/{id}", base_path(api_version)),
            Some(Value::Object(fields)),
        )
    }

    /// Upserts a record by external id.
    pub fn upsert(
        api_version: &str,
        object_type: &str,
        external_id_field: &str,
        external_id: &str,
        fields: Map<String, Value>,
    ) -> Self {
        Self::new(
            RestMethod::Patch,
            format!(
                "{}/sobjects/{object_type}/{external_id_field}/{external_id}",
                base_path(api_version)
            ),
            Some(Value::Object(fields)),
        )
    }

    /// Deletes a record.
    pub fn delete(api_version: &str, object_type: &str, id: &str) -> Self {
        Self::new(
            RestMethod::Delete,
            format!("{}/sobjects/{object_type}/{id}", base_path(api_version)),
            None,
        )
    }

    /// Retrieves selected fields of one record.
    pub fn retrieve(api_version: &str, object_type: &str, id: &str, fields: &[String]) -> Self {
        let query = encode_query(&[("fields", &fields.join(","))]);
        Self::new(
            RestMethod::Get,
            format!("{}/sobjects/{object_type}/{id}?{query}", base_path(api_version)),
            None,
        )
    }

    /// Retrieves selected fields of many records of one type.
    pub fn collection_retrieve(
        api_version: &str,
        object_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Self {
        Self::new(
            RestMethod::Post,
            format!("{}/composite/sobjects/{object_type}", base_path(api_version)),
            Some(json!({ "ids": ids, "fields": fields })),
        )
    }

    /// Object metadata, including recently viewed items.
    pub fn metadata(api_version: &str, object_type: &str) -> Self {
        Self::new(
            RestMethod::Get,
            format!("{}/sobjects/{object_type}/", base_path(api_version)),
            None,
        )
    }

    /// Full object description.
    pub fn describe(api_version: &str, object_type: &str) -> Self {
        Self::new(
            RestMethod::Get,
            format!("{}/sobjects/{object_type}/describe/", base_path(api_version)),
            None,
        )
    }

    /// SOQL query, optionally with a page size hint.
    pub fn query(api_version: &str, soql: &str, batch_size: Option<usize>) -> Self {
        let query = encode_query(&[("q", soql)]);
        let request = Self::new(
            RestMethod::Get,
            format!("{}/query?{query}", base_path(api_version)),
            None,
        );
        match batch_size {
            Some(size) => request.with_header(QUERY_OPTIONS_HEADER, format!("batchSize={size}")),
            None => request,
        }
    }

    /// Next page of a query, following the server supplied URL.
    pub fn query_next(next_records_url: &str) -> Self {
        Self::new(RestMethod::Get, next_records_url, None)
    }

    /// SOSL search.
    pub fn search(api_version: &str, sosl: &str) -> Self {
        let query = encode_query(&[("q", sosl)]);
        Self::new(
            RestMethod::Get,
            format!("{}/search?{query}", base_path(api_version)),
            None,
        )
    }

    /// UI layout of an object.
    pub fn layout(
        api_version: &str,
        object_api_name: &str,
        form_factor: Option<&str>,
        layout_type: Option<&str>,
        mode: Option<&str>,
        record_type_id: Option<&str>,
    ) -> Self {
        let pairs: Vec<(&str, &str)> = [
            ("formFactor", form_factor),
            ("layoutType", layout_type),
            ("mode", mode),
            ("recordTypeId", record_type_id),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();
        let mut path = format!("{}/ui-api/layout/{object_api_name}", base_path(api_version));
        if !pairs.is_empty() {
            path.push('?');
            path.push_str(&encode_query(&pairs));
        }
        Self::new(RestMethod::Get, path, None)
    }

    /// Priming record ids from the briefcase index.
    pub fn priming_records(
        api_version: &str,
        relay_token: Option<&str>,
        changed_after_millis: Option<i64>,
    ) -> Self {
        let changed_after = changed_after_millis.map(|t| t.to_string());
        let mut pairs = Vec::new();
        if let Some(token) = relay_token {
            pairs.push(("relayToken", token));
        }
        if let Some(ts) = changed_after.as_deref() {
            pairs.push(("changedAfterTimestamp", ts));
        }
        let mut path = format!("{}/connect/briefcase/priming-records", base_path(api_version));
        if !pairs.is_empty() {
            path.push('?');
            path.push_str(&encode_query(&pairs));
        }
        Self::new(RestMethod::Get, path, None)
    }
}

/// A REST response.
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body, `Null` when empty.
    pub body: Value,
}

impl RestResponse {
    /// Creates a response from an already parsed body.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Parses a raw body; an empty body becomes `Null`.
    pub fn from_raw(status: u16, raw: &str) -> ProtocolResult<Self> {
        let body = if raw.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(raw)?
        };
        Ok(Self { status, body })
    }

    /// Returns true for 2xx status codes.
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }

    /// Body as a JSON object.
    pub fn as_object(&self) -> ProtocolResult<&Map<String, Value>> {
        self.body
            .as_object()
            .ok_or_else(|| ProtocolError::invalid_response("expected a JSON object body"))
    }

    /// Body as a JSON array.
    pub fn as_array(&self) -> ProtocolResult<&Vec<Value>> {
        self.body
            .as_array()
            .ok_or_else(|| ProtocolError::invalid_response("expected a JSON array body"))
    }

    /// Raw body text.
    pub fn as_string(&self) -> String {
        match &self.body {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Returns true for 2xx status codes.
pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}
