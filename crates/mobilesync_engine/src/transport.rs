//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use mobilesync_protocol::{RestRequest, RestResponse};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sends REST requests to the server.
///
/// Implementations handle authentication and HTTP. Non-success statuses are
/// returned as responses, not errors; an error means the request did not
/// complete.
pub trait RestClient: Send + Sync {
    /// Sends one request and waits for its response.
    fn send(&self, request: &RestRequest) -> SyncResult<RestResponse>;
}

type Handler = dyn Fn(&RestRequest) -> RestResponse + Send + Sync;

/// A mock client for testing.
///
/// Every request is recorded and answered by a handler closure.
pub struct MockRestClient {
    connected: AtomicBool,
    handler: Box<Handler>,
    requests: Mutex<Vec<RestRequest>>,
}

impl MockRestClient {
    /// Creates a client answering with `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&RestRequest) -> RestResponse + Send + Sync + 'static,
    {
        Self {
            connected: AtomicBool::new(true),
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Creates a client answering every request with the same response.
    pub fn always(response: RestResponse) -> Self {
        Self::new(move |_| response.clone())
    }

    /// Requests sent so far.
    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Sets the connected state; a disconnected client fails every request.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl fmt::Debug for MockRestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockRestClient")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("requests", &self.request_count())
            .finish()
    }
}

impl RestClient for MockRestClient {
    fn send(&self, request: &RestRequest) -> SyncResult<RestResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected"));
        }
        self.requests.lock().push(request.clone());
        Ok((self.handler)(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilesync_protocol::RestMethod;
    use serde_json::json;

    #[test]
    fn mock_client_records_requests() {
        let client = MockRestClient::new(|req| {
            RestResponse::new(200, json!({ "path": req.path.clone() }))
        });
        let req = RestRequest::new(RestMethod::Get, "/a", None);
        let resp = client.send(&req).unwrap();
        assert_eq!(resp.body["path"], "/a");
        assert_eq!(client.request_count(), 1);
        assert_eq!(client.requests()[0], req);
    }

    #[test]
    fn disconnected_client_fails() {
        let client = MockRestClient::always(RestResponse::new(204, json!(null)));
        client.set_connected(false);
        let err = client
            .send(&RestRequest::new(RestMethod::Get, "/a", None))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.request_count(), 0);
    }
}
