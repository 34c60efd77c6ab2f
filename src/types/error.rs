//! Error types for the replicator
//!
//! One crate-wide error enum, mapped onto HTTP status codes at the route layer.

use hyper::StatusCode;

/// Main error type for replicator operations
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Quota error: {0}")]
    Quota(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ReplicatorError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Platform(_) => StatusCode::BAD_GATEWAY,
            Self::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled(_) => StatusCode::CONFLICT,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for ReplicatorError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for ReplicatorError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for ReplicatorError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON serialization failed: {}", err))
    }
}

impl From<bson::de::Error> for ReplicatorError {
    fn from(err: bson::de::Error) -> Self {
        Self::Database(format!("BSON deserialization failed: {}", err))
    }
}

/// Result type alias for replicator operations
pub type Result<T> = std::result::Result<T, ReplicatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ReplicatorError::NotFound("job".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ReplicatorError::Quota("exhausted".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        let (status, body) = ReplicatorError::Conflict("dup".into()).into_status_code_and_body();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, "Conflict: dup");
    }
}
