//! HTTP routes for the replicator

pub mod admin;
pub mod health;
pub mod replication;

pub use admin::{
    handle_list_credentials, handle_query_failures, handle_register_credential,
    handle_register_scope, handle_store_template, handle_switch_selection,
};
pub use health::health_check;
pub use replication::{handle_cancel, handle_list, handle_start, handle_status};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::ReplicatorError;

pub(crate) type FullBody = Full<Bytes>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<FullBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn error_response(status: StatusCode, error: &str, code: Option<&str>) -> Response<FullBody> {
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
            code: code.map(|c| c.to_string()),
        },
    )
}

/// Map an engine error onto its HTTP status
pub(crate) fn error_from(err: ReplicatorError) -> Response<FullBody> {
    let (status, message) = err.into_status_code_and_body();
    let code = status.canonical_reason().map(|r| r.to_uppercase().replace(' ', "_"));
    error_response(status, &message, code.as_deref())
}

/// Collect and parse a JSON request body
pub(crate) async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ReplicatorError> {
    let body = req.into_body().collect().await?.to_bytes();
    if body.is_empty() {
        return Err(ReplicatorError::BadRequest("request body is required".into()));
    }
    serde_json::from_slice(&body)
        .map_err(|e| ReplicatorError::BadRequest(format!("invalid request body: {}", e)))
}

/// Parse an optional query string
pub(crate) fn parse_query<T: DeserializeOwned + Default>(query: Option<&str>) -> Result<T, ReplicatorError> {
    match query {
        Some(q) if !q.is_empty() => serde_urlencoded::from_str(q)
            .map_err(|e| ReplicatorError::BadRequest(format!("invalid query: {}", e))),
        _ => Ok(T::default()),
    }
}
