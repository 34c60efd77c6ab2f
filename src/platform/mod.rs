//! Outbound contract with the advertising platform
//!
//! The engine consumes three endpoints of the external platform:
//!
//! - **Create**: one object under an owner (`POST /{owner}/{edge}`)
//! - **Batch**: an ordered array of `{method, relative_url, body}` answered by
//!   a parallel array of `{code, body}` (or `null` for operations the platform
//!   did not run)
//! - **List**: enumerate the children of a parent, with the number of
//!   grandchildren each one holds, for authoritative counting
//!
//! [`AdPlatform`] abstracts these so the engine can run against the real
//! Graph-style HTTP API ([`GraphClient`]) or an in-process
//! [`SimulatedPlatform`].

pub mod classify;
pub mod graph;
pub mod simulated;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::quota::Credential;

pub use classify::{classify, ErrorClass};
pub use graph::{GraphClient, GraphClientConfig};
pub use simulated::{FailureRule, SimulatedPlatform};

/// Numeric platform error codes that mark a throttling or temporary condition
pub const TRANSIENT_ERROR_CODES: &[i64] = &[1, 2, 4, 17, 32, 341, 613, 80004];

/// A platform object to create: the edge it is created on and its fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    /// Edge name under the owner, e.g. `adsets`
    pub edge: String,
    /// Fields sent with the create call
    #[serde(default)]
    pub body: Map<String, Value>,
}

impl ObjectSpec {
    pub fn new(edge: impl Into<String>) -> Self {
        Self {
            edge: edge.into(),
            body: Map::new(),
        }
    }

    /// Set a body field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }
}

/// One entry of a batch call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub method: String,
    /// URL relative to the API version root, e.g. `act_1/adsets`
    pub relative_url: String,
    /// Name other entries of the same batch can reference with
    /// `{result=<name>:$.id}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub body: Map<String, Value>,
}

impl BatchRequest {
    /// Owner and edge encoded in `relative_url`
    pub fn owner_and_edge(&self) -> Option<(&str, &str)> {
        let path = self.relative_url.split('?').next()?;
        let mut segments = path.trim_matches('/').rsplitn(2, '/');
        let edge = segments.next()?;
        let owner = segments.next()?;
        let owner = owner.rsplit('/').next()?;
        Some((owner, edge))
    }
}

/// One entry of a batch response, parallel to the request array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub code: u16,
    #[serde(default)]
    pub body: Value,
}

impl BatchResponse {
    /// Created object id, when the entry reports success
    pub fn created_id(&self) -> Option<&str> {
        if !(200..300).contains(&self.code) {
            return None;
        }
        self.body.get("id").and_then(Value::as_str)
    }

    /// Error carried by a failed entry
    pub fn error(&self) -> PlatformError {
        if (200..300).contains(&self.code) {
            return PlatformError::Malformed("success entry without an id".to_string());
        }
        PlatformError::from_error_body(self.code, &self.body)
    }
}

/// A child object under a parent, with its own child count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildNode {
    pub id: String,
    pub child_count: u32,
}

/// Failures returned by the advertising platform
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PlatformError {
    /// The call could not complete (connection reset, DNS, TLS, ...)
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The call did not answer in time
    #[error("Request timed out")]
    Timeout,

    /// The platform answered with an error object
    #[error("Platform error {status} (code {code:?}, subcode {subcode:?}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        subcode: Option<i64>,
        transient: Option<bool>,
        message: String,
    },

    /// A batch entry was not executed (`null` slot), typically because an
    /// entry it referenced failed
    #[error("Batch entry was not executed")]
    NotExecuted,

    /// The response did not have the expected shape
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl PlatformError {
    /// Parse a Graph-style error body: `{"error": {"message", "code", "error_subcode", "is_transient"}}`
    pub fn from_error_body(status: u16, body: &Value) -> Self {
        let error = body.get("error").unwrap_or(body);
        PlatformError::Api {
            status,
            code: error.get("code").and_then(Value::as_i64),
            subcode: error.get("error_subcode").and_then(Value::as_i64),
            transient: error.get("is_transient").and_then(Value::as_bool),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown platform error")
                .to_string(),
        }
    }

    /// Classify this error into the engine's taxonomy
    pub fn class(&self) -> ErrorClass {
        classify(self)
    }
}

/// The external advertising platform
#[async_trait::async_trait]
pub trait AdPlatform: Send + Sync {
    /// Create one object under `owner`, returning its id
    async fn create_object(
        &self,
        credential: &Credential,
        owner: &str,
        spec: &ObjectSpec,
    ) -> Result<String, PlatformError>;

    /// Send a batch call; the result is parallel to `requests`
    async fn batch(
        &self,
        credential: &Credential,
        requests: &[BatchRequest],
    ) -> Result<Vec<Option<BatchResponse>>, PlatformError>;

    /// List objects on `edge` under `parent_id` with their `child_edge` counts
    async fn list_children(
        &self,
        credential: &Credential,
        parent_id: &str,
        edge: &str,
        child_edge: &str,
    ) -> Result<Vec<ChildNode>, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_owner_and_edge() {
        let request = BatchRequest {
            method: "POST".to_string(),
            relative_url: "v19.0/act_42/adsets".to_string(),
            name: None,
            body: Map::new(),
        };
        assert_eq!(request.owner_and_edge(), Some(("act_42", "adsets")));

        let request = BatchRequest {
            relative_url: "act_42/ads".to_string(),
            ..request
        };
        assert_eq!(request.owner_and_edge(), Some(("act_42", "ads")));
    }

    #[test]
    fn test_created_id_requires_success_code() {
        let ok = BatchResponse {
            code: 200,
            body: json!({"id": "123"}),
        };
        assert_eq!(ok.created_id(), Some("123"));

        let failed = BatchResponse {
            code: 400,
            body: json!({"error": {"message": "Invalid parameter", "code": 100, "error_subcode": 1487}}),
        };
        assert_eq!(failed.created_id(), None);
        match failed.error() {
            PlatformError::Api { code, subcode, .. } => {
                assert_eq!(code, Some(100));
                assert_eq!(subcode, Some(1487));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
