//! Root CA certificate download, so clients can install it as a trust anchor.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::AppState;

pub async fn download_ca(State(state): State<Arc<AppState>>) -> Response {
    (
        axum::http::StatusCode::OK,
        [("content-type", "application/x-x509-ca-cert")],
        state.ca.ca_cert_pem().to_string(),
    )
        .into_response()
}
