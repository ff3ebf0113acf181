// Error taxonomy shared by every public operation
//
// Errors are a tagged value (code, message, http status, optional details).
// The transport layer turns an ApiError into the response envelope; internal
// plumbing stays on anyhow and is wrapped at the service boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    BadRequest,
    ValidationError,
    ConfigNotFound,
    ConfigInvalid,
    EnvironmentNotFound,
    EngineInitFailed,
    ManifestNotFound,
    ManifestInvalid,
    MetricNotFound,
    DimensionNotFound,
    QueryNotFound,
    QueryExpired,
    QueryExecutionFailed,
    QueryCompileFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ConfigNotFound => "CONFIG_NOT_FOUND",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::EnvironmentNotFound => "ENVIRONMENT_NOT_FOUND",
            ErrorCode::EngineInitFailed => "ENGINE_INIT_FAILED",
            ErrorCode::ManifestNotFound => "MANIFEST_NOT_FOUND",
            ErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            ErrorCode::MetricNotFound => "METRIC_NOT_FOUND",
            ErrorCode::DimensionNotFound => "DIMENSION_NOT_FOUND",
            ErrorCode::QueryNotFound => "QUERY_NOT_FOUND",
            ErrorCode::QueryExpired => "QUERY_EXPIRED",
            ErrorCode::QueryExecutionFailed => "QUERY_EXECUTION_FAILED",
            ErrorCode::QueryCompileFailed => "QUERY_COMPILE_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error surfaced by every public operation.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, status: u16) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 422 validation failure, the most common constructor in the filter
    /// compiler and request normalization.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message, 422)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, 500)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Wire envelope: `{ ok, data, error }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ResponseEnvelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: &ApiError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code,
                message: error.message.clone(),
                details: error.details.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::QueryExecutionFailed).unwrap();
        assert_eq!(json, "\"QUERY_EXECUTION_FAILED\"");
        assert_eq!(ErrorCode::ManifestNotFound.as_str(), "MANIFEST_NOT_FOUND");
    }

    #[test]
    fn envelope_failure_carries_details() {
        let err = ApiError::validation("bad group_by")
            .with_details(json!({"invalid": ["x"], "allowed": ["customer"]}));
        let envelope = ResponseEnvelope::<()>::failure(&err);
        assert!(!envelope.ok);
        let body = envelope.error.unwrap();
        assert_eq!(body.code, ErrorCode::ValidationError);
        assert_eq!(body.details.unwrap()["invalid"][0], "x");
    }

    #[test]
    fn envelope_success_has_no_error() {
        let envelope = ResponseEnvelope::success(42);
        assert!(envelope.ok);
        assert_eq!(envelope.data, Some(42));
        assert!(envelope.error.is_none());
    }
}
