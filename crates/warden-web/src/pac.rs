//! Proxy auto-config script generation.
//!
//! Pulls `match` from every enabled rule regardless of `kind` — a
//! `token_extract` rule's match string (a header name) ends up in the PAC
//! array alongside `url_replace` match strings, mirroring the upstream
//! `handlePAC` this was ported from.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PacQuery {
    host: Option<String>,
    port: Option<u16>,
}

pub async fn proxy_pac(State(state): State<Arc<AppState>>, Query(query): Query<PacQuery>) -> Response {
    let host = query.host.unwrap_or_else(|| state.bind_ip.clone());
    let port = query.port.unwrap_or(state.proxy_port);

    let patterns: Vec<String> = state
        .engine
        .store()
        .list_enabled_sorted()
        .into_iter()
        .map(|r| r.match_pattern)
        .collect();

    let patterns_js = patterns
        .iter()
        .map(|p| format!("{:?}", p))
        .collect::<Vec<_>>()
        .join(", ");

    let body = format!(
        r#"function FindProxyForURL(url, host) {{
    var patterns = [{patterns_js}];
    for (var i = 0; i < patterns.length; i++) {{
        if (url.indexOf(patterns[i]) !== -1 || host.indexOf(patterns[i]) !== -1) {{
            return "PROXY {host}:{port}";
        }}
    }}
    return "DIRECT";
}}
"#,
        patterns_js = patterns_js,
        host = host,
        port = port,
    );

    (
        axum::http::StatusCode::OK,
        [("content-type", "application/x-ns-proxy-autoconfig")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden_core::{Broadcaster, RuleEngine, RuleStore};
    use warden_mitm::CertificateAuthority;

    fn state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        let engine = Arc::new(RuleEngine::new(store));
        let broadcaster = Arc::new(Broadcaster::new(false));
        let ca = Arc::new(
            CertificateAuthority::load_or_generate(dir.path().join("ca.crt"), dir.path().join("ca.key")).unwrap(),
        );
        std::mem::forget(dir);
        Arc::new(AppState {
            engine,
            broadcaster,
            ca,
            security: crate::auth::SecuritySettings::default(),
            proxy_port: 2021,
            bind_ip: "0.0.0.0".to_string(),
            started_at: std::time::Instant::now(),
        })
    }

    #[tokio::test]
    async fn pac_contains_every_enabled_rules_match_regardless_of_kind() {
        let state = state();
        let response = proxy_pac(
            State(state),
            Query(PacQuery {
                host: Some("p".to_string()),
                port: Some(9),
            }),
        )
        .await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("miniapp.example.internal"));
        assert!(text.contains("payment-another-info"));
        assert!(text.contains("X-User-Token"));
        assert!(text.contains("PROXY p:9"));
    }
}
