//! REST error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Handler-level error with a direct HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "detail": message }))).into_response()
    }
}

impl From<ncf_db::DbError> for ApiError {
    fn from(err: ncf_db::DbError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ncf_git::RepoError> for ApiError {
    fn from(err: ncf_git::RepoError) -> Self {
        Self::Internal(err.to_string())
    }
}
