//! REST CRUD facade over the rule store, plus tokens and status.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;
use warden_core::{Rule, TokenRecord};

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<Rule>> {
    Json(state.engine.store().list())
}

pub async fn add_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<Rule>,
) -> Result<(StatusCode, Json<Rule>), ApiError> {
    let added = state.engine.store().add(rule)?;
    Ok((StatusCode::CREATED, Json(added)))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(rule): Json<Rule>,
) -> Result<StatusCode, ApiError> {
    state.engine.store().update(&id, rule)?;
    Ok(StatusCode::OK)
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.store().delete(&id)?;
    Ok(StatusCode::OK)
}

pub async fn list_tokens(State(state): State<Arc<AppState>>) -> Json<Vec<TokenRecord>> {
    Json(state.engine.tokens())
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub proxy_port: u16,
    pub uptime: u64,
    pub rules: usize,
    pub tokens: usize,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        proxy_port: state.proxy_port,
        uptime: state.started_at.elapsed().as_secs(),
        rules: state.engine.store().list().len(),
        tokens: state.engine.tokens().len(),
    })
}
