//! REST-facing error type: maps store/engine failures onto HTTP status codes.

use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("persisting rule store failed: {0}")]
    Persistence(#[from] warden_core::StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // A failed disk write is an operational failure of the service, not
        // a client mistake.
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
