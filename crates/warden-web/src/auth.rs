//! Token + IP allow-list middleware, active only when `security.enabled`.
//!
//! Exempt paths are `/`, `/ssl`, and any `/static/*` prefix regardless of
//! whether security is enabled, matching the route surface the control
//! plane exposes even though no static UI bundle ships with this port.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Clone, Default)]
pub struct SecuritySettings {
    pub enabled: bool,
    pub api_token: String,
    pub allowed_ips: Vec<String>,
}

fn is_exempt_path(path: &str) -> bool {
    path == "/" || path == "/ssl" || path.starts_with("/static/")
}

fn token_from_request(req: &Request) -> Option<String> {
    if let Some(header) = req.headers().get("X-API-Token") {
        if let Ok(value) = header.to_str() {
            return Some(value.to_string());
        }
    }
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some("token"), Some(value)) => Some(value.to_string()),
                _ => None,
            }
        })
    })
}

fn ip_allowed(allowed: &[String], remote_ip: &str) -> bool {
    allowed
        .iter()
        .any(|entry| entry == "*" || entry == "0.0.0.0/0" || entry == remote_ip)
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.security.enabled || is_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let token_ok = token_from_request(&req)
        .map(|t| t == state.security.api_token)
        .unwrap_or(false);
    if !token_ok {
        return Err(StatusCode::UNAUTHORIZED);
    }

    if !state.security.allowed_ips.is_empty() && !ip_allowed(&state.security.allowed_ips, &addr.ip().to_string()) {
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_paths_bypass_auth() {
        assert!(is_exempt_path("/"));
        assert!(is_exempt_path("/ssl"));
        assert!(is_exempt_path("/static/app.js"));
        assert!(!is_exempt_path("/api/rules"));
    }

    #[test]
    fn ip_allowed_matches_wildcard_and_exact() {
        assert!(ip_allowed(&["*".to_string()], "1.2.3.4"));
        assert!(ip_allowed(&["0.0.0.0/0".to_string()], "9.9.9.9"));
        assert!(ip_allowed(&["10.0.0.5".to_string()], "10.0.0.5"));
        assert!(!ip_allowed(&["10.0.0.5".to_string()], "10.0.0.6"));
    }
}
