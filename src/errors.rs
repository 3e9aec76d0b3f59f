use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

/// Error body returned to HTTP callers.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional detail (e.g. the list of out-of-stock products)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    /// Store unavailable or query failure. Retryable by the caller.
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or missing input. Never retried.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Business-rule conflict: illegal transition, expired or exhausted promo
    /// code, order-number collision after exhausting retries.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// One or more products cannot cover the requested quantity. Carries the
    /// product names so the caller can remediate.
    #[error("Insufficient stock for: {}", .0.join(", "))]
    InsufficientStock(Vec<String>),

    /// Partial multi-step effect detected; compensation ran before this was
    /// surfaced.
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    /// Compensation itself failed. Requires out-of-band reconciliation and
    /// must never be silently dropped.
    #[error("Fatal: {0}")]
    FatalError(String),

    /// Cache trouble. Swallowed and logged at call sites, never fails a
    /// business operation.
    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::InsufficientStock(_) => StatusCode::CONFLICT,
            Self::ConsistencyError(_)
            | Self::FatalError(_)
            | Self::CacheError(_)
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Store temporarily unavailable".to_string(),
            Self::CacheError(_) | Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::FatalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured detail attached to the response body, where one exists.
    fn response_details(&self) -> Option<Vec<String>> {
        match self {
            Self::InsufficientStock(names) => Some(names.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.response_details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::StatusCode};

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InsufficientStock(vec!["Widget".into()]).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("down".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::FatalError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("dsn=postgres://secret".into()))
                .response_message(),
            "Store temporarily unavailable"
        );
        assert_eq!(
            ServiceError::CacheError("redis down".into()).response_message(),
            "Internal server error"
        );

        // User-facing errors keep their message
        assert_eq!(
            ServiceError::NotFound("Order not found".into()).response_message(),
            "Not found: Order not found"
        );
    }

    #[tokio::test]
    async fn insufficient_stock_lists_product_names() {
        let response =
            ServiceError::InsufficientStock(vec!["Widget".into(), "Gadget".into()]).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            payload.details,
            Some(vec!["Widget".to_string(), "Gadget".to_string()])
        );
        assert!(payload.message.contains("Widget"));
    }
}
