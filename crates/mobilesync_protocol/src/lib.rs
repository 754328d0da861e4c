//! # MobileSync Protocol
//!
//! Record model and wire encodings for MobileSync.
//!
//! This crate provides:
//! - Records with their local bookkeeping flags and freshness dates
//! - Per-record requests and normalized responses
//! - Composite and collection batch encodings
//! - REST request and response shapes
//! - SOQL building and rewriting
//!
//! Nothing here performs I/O. The engine crate decides what to send and
//! hands the encoded [`RestRequest`]s to a transport.
//!
//! ## Key Invariants
//!
//! - A record is dirty iff one of its local flags is set
//! - Created-then-deleted records never produce a request
//! - Composite batches hold at most 25 requests, collection batches 200
//! - Collection responses correlate with requests by position

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collection;
pub mod composite;
mod error;
pub mod record;
pub mod request;
pub mod rest;
pub mod soql;
pub mod timestamp;

pub use collection::{
    collection_request, parse_collection_response, record_response_from_collection_sub_response,
    MAX_RECORDS_SOBJECT_COLLECTION_API,
};
pub use composite::{
    composite_request, parse_composite_response, record_response_from_sub_response,
    reference_placeholder, MAX_SUB_REQUESTS_COMPOSITE_API,
};
pub use error::{ProtocolError, ProtocolResult};
pub use record::{create_local_id, is_local_id, DirtyState, Record, RecordModDate};
pub use request::{
    build_fields_map, parse_ids_from_responses, update_references, RecordRequest, RecordResponse,
    RequestBuilder, RequestType,
};
pub use rest::{RestMethod, RestRequest, RestResponse};
pub use soql::{SoqlBuilder, SoqlMutator};
