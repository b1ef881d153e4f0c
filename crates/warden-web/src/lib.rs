//! REST control plane for the proxy: rule CRUD, token inspection, status,
//! CA download, PAC generation, and the live log websocket.
//!
//! Grounded on `oisp-web::start_server`'s axum `Router` + `AppState` shape,
//! generalized from a single read-only dashboard into a CRUD facade with an
//! auth middleware layer.

pub mod api;
pub mod auth;
pub mod error;
pub mod pac;
pub mod ssl;
pub mod ws;

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use auth::SecuritySettings;

use warden_core::{Broadcaster, RuleEngine};
use warden_mitm::CertificateAuthority;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_ip: String,
    pub port: u16,
}

/// Shared control-plane state, handed to every handler via axum's
/// `State` extractor.
pub struct AppState {
    pub engine: Arc<RuleEngine>,
    pub broadcaster: Arc<Broadcaster>,
    pub ca: Arc<CertificateAuthority>,
    pub security: SecuritySettings,
    /// The CONNECT/HTTP proxy port, surfaced via `/api/status` and used as
    /// the PAC default when the request omits `?port=`.
    pub proxy_port: u16,
    pub bind_ip: String,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/rules", get(api::list_rules).post(api::add_rule))
        .route("/api/rules/{id}", axum::routing::put(api::update_rule).delete(api::delete_rule))
        .route("/api/tokens", get(api::list_tokens))
        .route("/api/status", get(api::status))
        .route("/ssl", get(ssl::download_ca))
        .route("/proxy.pac", get(pac::proxy_pac))
        .route("/api/logs/ws", get(ws::logs_ws))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(config: WebConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.bind_ip, config.port);
    info!(%addr, "control plane listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::RuleStore;

    fn test_state(security: SecuritySettings) -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        let ca = CertificateAuthority::load_or_generate(
            dir.path().join("ca.crt"),
            dir.path().join("ca.key"),
        )
        .unwrap();
        std::mem::forget(dir);
        Arc::new(AppState {
            engine: Arc::new(RuleEngine::new(store)),
            broadcaster: Arc::new(Broadcaster::new(false)),
            ca: Arc::new(ca),
            security,
            proxy_port: 2021,
            bind_ip: "0.0.0.0".to_string(),
            started_at: Instant::now(),
        })
    }

    #[test]
    fn router_builds_without_panicking_when_security_disabled() {
        let _router = build_router(test_state(SecuritySettings::default()));
    }

    #[test]
    fn router_builds_without_panicking_when_security_enabled() {
        let security = SecuritySettings {
            enabled: true,
            api_token: "secret".to_string(),
            allowed_ips: vec!["*".to_string()],
        };
        let _router = build_router(test_state(security));
    }
}
