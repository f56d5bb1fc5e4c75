//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("query error: {0}")]
    Query(#[from] quarry_query::QueryError),

    #[error("storage error: {0}")]
    Storage(#[from] quarry_storage::StorageError),

    #[error("core error: {0}")]
    Core(#[from] quarry_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
            Self::Query(e) => match e {
                quarry_query::QueryError::UnknownQuery(_) => "not_found",
                quarry_query::QueryError::InvalidOptions(_) => "bad_request",
                quarry_query::QueryError::Datasource(_) => "bad_request",
                quarry_query::QueryError::Canceled => "canceled",
                _ => "query_error",
            },
            Self::Storage(_) => "storage_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Query(e) => match e {
                quarry_query::QueryError::UnknownQuery(_) => StatusCode::NOT_FOUND,
                quarry_query::QueryError::InvalidOptions(_) => StatusCode::BAD_REQUEST,
                quarry_query::QueryError::Datasource(_) => StatusCode::BAD_REQUEST,
                quarry_query::QueryError::Canceled => StatusCode::CONFLICT,
                quarry_query::QueryError::Storage(
                    quarry_storage::StorageError::NotFound(_),
                ) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Storage(e) => match e {
                quarry_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_query::QueryError;

    #[test]
    fn test_query_errors_map_onto_http_status() {
        let unknown = ApiError::from(QueryError::UnknownQuery("x".to_string()));
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(unknown.code(), "not_found");

        let invalid = ApiError::from(QueryError::InvalidOptions("x".to_string()));
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);

        let storage = ApiError::from(QueryError::Storage(
            quarry_storage::StorageError::NotFound("k".to_string()),
        ));
        assert_eq!(storage.status_code(), StatusCode::NOT_FOUND);
    }
}
