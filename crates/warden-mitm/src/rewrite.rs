//! `RewriteProxy`: runs one decrypted exchange through the rule engine and
//! relays it to the origin over a pooled `reqwest::Client`.
//!
//! The pool settings (idle timeout, per-host cap, connect timeout) mirror
//! spec §5; `reqwest` is already in the teacher's dependency table (used by
//! `oisp-export`) and is the idiomatic pooled HTTP(S) client for the pack.

use crate::error::RewriteError;
use crate::httpio;
use crate::mime;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use warden_core::{Broadcaster, LogEvent, RuleEngine};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub struct InboundRequest {
    pub method: String,
    /// Request-target exactly as sent by the client: origin-form
    /// (`/path?query`) or absolute-form (`http://host/path?query`).
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct OutboundResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub response: reqwest::Response,
}

pub struct RewriteProxy {
    engine: std::sync::Arc<RuleEngine>,
    broadcaster: std::sync::Arc<Broadcaster>,
    http_client: reqwest::Client,
    https_client: reqwest::Client,
}

impl RewriteProxy {
    pub fn new(engine: std::sync::Arc<RuleEngine>, broadcaster: std::sync::Arc<Broadcaster>) -> Self {
        let build = || {
            reqwest::Client::builder()
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                .connect_timeout(DIAL_TIMEOUT)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client config is valid")
        };
        Self {
            engine,
            broadcaster,
            http_client: build(),
            https_client: build(),
        }
    }

    /// Resolve the absolute URL the client intended: absolute-form targets
    /// are used verbatim, origin-form targets are joined with `scheme` and
    /// the `Host` header (falling back to `connect_host`, the CONNECT
    /// target, when no `Host` header was sent).
    fn absolute_url(scheme: &str, connect_host: &str, req: &InboundRequest) -> Result<Url, RewriteError> {
        if req.target.starts_with("http://") || req.target.starts_with("https://") {
            return Url::parse(&req.target)
                .map_err(|e| RewriteError::ClientProtocol(format!("bad absolute-form target: {e}")));
        }
        let host = crate::httpio::header_ci(&req.headers, "host").unwrap_or(connect_host);
        let joined = format!("{scheme}://{host}{}", req.target);
        Url::parse(&joined).map_err(|e| RewriteError::ClientProtocol(format!("bad request target: {e}")))
    }

    pub async fn handle(
        &self,
        scheme: &str,
        connect_host: &str,
        req: InboundRequest,
    ) -> Result<OutboundResponse, RewriteError> {
        let url = Self::absolute_url(scheme, connect_host, &req)?;
        let url_str = url.to_string();

        for token in self.engine.extract_tokens(&url_str, &req.headers) {
            self.broadcaster
                .publish(LogEvent::token(token.name.clone(), token.value.clone(), token.url.clone()));
        }

        let (new_url_str, ids_u) = self.engine.apply_url(&url_str);
        let (mut new_headers, ids_h) = self.engine.apply_headers(&req.headers);

        let new_url = Url::parse(&new_url_str)
            .map_err(|e| RewriteError::ClientProtocol(format!("rule rewrote url into garbage: {e}")))?;
        if new_url_str != url_str {
            if let Some(host) = new_url.host_str() {
                let host_header = match new_url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                overwrite_header(&mut new_headers, "Host", &host_header);
            }
        }

        let modified = !ids_u.is_empty() || !ids_h.is_empty();
        let mut rules_applied = ids_u;
        rules_applied.extend(ids_h);
        // Log the URL the client actually asked for, not the rewritten one;
        // `modified`/`rules_applied` already surface that a rewrite happened.
        self.broadcaster.publish(LogEvent::request(
            req.method.clone(),
            url_str.clone(),
            modified,
            rules_applied,
        ));

        let client = if new_url.scheme() == "https" {
            &self.https_client
        } else {
            &self.http_client
        };

        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| RewriteError::ClientProtocol(format!("bad method: {e}")))?;
        let mut builder = client.request(method, new_url.clone());
        for (name, value) in new_headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.body(req.body);

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.broadcaster
                    .publish(LogEvent::error(new_url_str.clone(), err.to_string()));
                return Err(RewriteError::UpstreamDial(err));
            }
        };

        let status = response.status().as_u16();
        let mut headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();

        let current_ct = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str());
        if mime::is_fixup_candidate(current_ct) {
            if let Some(ext) = mime::extension_from_path(new_url.path()) {
                if let Some(canonical) = mime::canonical_mime_for_ext(ext) {
                    overwrite_header(&mut headers, "Content-Type", canonical);
                }
            }
        }

        self.broadcaster
            .publish(LogEvent::response(req.method, url_str, status));

        Ok(OutboundResponse {
            status,
            headers,
            response,
        })
    }
}

/// Where (and how) to dial the origin for a request that is switching
/// protocols, plus the raw HTTP/1.1 request line and headers to replay
/// verbatim once connected.
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub request_bytes: Vec<u8>,
}

impl RewriteProxy {
    /// A request is a protocol-upgrade candidate (the only one this proxy
    /// supports is WebSocket) when it carries `Connection: Upgrade` and an
    /// `Upgrade` header naming the target protocol.
    pub fn is_upgrade_request(req: &InboundRequest) -> bool {
        httpio::header_ci(&req.headers, "upgrade").is_some()
            && httpio::header_ci(&req.headers, "connection")
                .map(|v| v.to_ascii_lowercase().contains("upgrade"))
                .unwrap_or(false)
    }

    /// Run the same rule pipeline an ordinary request gets (token
    /// extraction, URL rewrite, header rewrite, `request` log event), then
    /// hand back enough to dial the origin directly and replay the request
    /// bytes — from here on the exchange is opaque, relayed byte-for-byte
    /// (spec.md §4.5: "switching to relay mode post-upgrade").
    pub fn prepare_upgrade(
        &self,
        scheme: &str,
        connect_host: &str,
        req: InboundRequest,
    ) -> Result<UpstreamTarget, RewriteError> {
        let url = Self::absolute_url(scheme, connect_host, &req)?;
        let url_str = url.to_string();

        for token in self.engine.extract_tokens(&url_str, &req.headers) {
            self.broadcaster
                .publish(LogEvent::token(token.name.clone(), token.value.clone(), token.url.clone()));
        }

        let (new_url_str, ids_u) = self.engine.apply_url(&url_str);
        let (mut new_headers, ids_h) = self.engine.apply_headers(&req.headers);

        let new_url = Url::parse(&new_url_str)
            .map_err(|e| RewriteError::ClientProtocol(format!("rule rewrote url into garbage: {e}")))?;
        if new_url_str != url_str {
            if let Some(host) = new_url.host_str() {
                let host_header = match new_url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                overwrite_header(&mut new_headers, "Host", &host_header);
            }
        }

        let modified = !ids_u.is_empty() || !ids_h.is_empty();
        let mut rules_applied = ids_u;
        rules_applied.extend(ids_h);
        // Log the URL the client actually asked for, not the rewritten one.
        self.broadcaster
            .publish(LogEvent::request(req.method.clone(), url_str.clone(), modified, rules_applied));

        let host = new_url.host_str().unwrap_or(connect_host).to_string();
        let use_tls = new_url.scheme() == "https";
        let port = new_url.port_or_known_default().unwrap_or(if use_tls { 443 } else { 80 });

        let mut target = new_url.path().to_string();
        if let Some(q) = new_url.query() {
            target.push('?');
            target.push_str(q);
        }

        let mut raw = format!("{} {} HTTP/1.1\r\n", req.method, target);
        for (name, value) in new_headers.iter() {
            let keep_anyway = name.eq_ignore_ascii_case("upgrade") || name.eq_ignore_ascii_case("connection");
            if is_hop_by_hop(name) && !keep_anyway {
                continue;
            }
            raw.push_str(name);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push_str("\r\n");
        }
        raw.push_str("\r\n");
        let mut request_bytes = raw.into_bytes();
        request_bytes.extend_from_slice(&req.body);

        Ok(UpstreamTarget { host, port, use_tls, request_bytes })
    }
}

fn overwrite_header(headers: &mut HashMap<String, String>, name: &str, value: &str) {
    if let Some(key) = headers.keys().find(|k| k.eq_ignore_ascii_case(name)).cloned() {
        headers.remove(&key);
    }
    headers.insert(name.to_string(), value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_url_passes_through_absolute_form_target() {
        let req = InboundRequest {
            method: "GET".to_string(),
            target: "https://example.com/x".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let url = RewriteProxy::absolute_url("http", "fallback.invalid", &req).unwrap();
        assert_eq!(url.as_str(), "https://example.com/x");
    }

    #[test]
    fn absolute_url_joins_origin_form_with_host_header() {
        let mut headers = HashMap::new();
        headers.insert("Host".to_string(), "miniapp.example.internal".to_string());
        let req = InboundRequest {
            method: "GET".to_string(),
            target: "/v1/x".to_string(),
            headers,
            body: Vec::new(),
        };
        let url = RewriteProxy::absolute_url("https", "fallback.invalid", &req).unwrap();
        assert_eq!(url.as_str(), "https://miniapp.example.internal/v1/x");
    }

    #[test]
    fn absolute_url_falls_back_to_connect_host_without_host_header() {
        let req = InboundRequest {
            method: "GET".to_string(),
            target: "/v1/x".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let url = RewriteProxy::absolute_url("https", "example.com", &req).unwrap();
        assert_eq!(url.as_str(), "https://example.com/v1/x");
    }

    fn proxy() -> RewriteProxy {
        let dir = tempfile::tempdir().unwrap();
        let store = warden_core::RuleStore::load_or_default(dir.path().join("rules.json"));
        std::mem::forget(dir);
        RewriteProxy::new(
            std::sync::Arc::new(RuleEngine::new(store)),
            std::sync::Arc::new(Broadcaster::new(false)),
        )
    }

    #[test]
    fn is_upgrade_request_requires_both_headers() {
        let mut headers = HashMap::new();
        headers.insert("Upgrade".to_string(), "websocket".to_string());
        headers.insert("Connection".to_string(), "Upgrade".to_string());
        let req = InboundRequest {
            method: "GET".to_string(),
            target: "/ws".to_string(),
            headers,
            body: Vec::new(),
        };
        assert!(RewriteProxy::is_upgrade_request(&req));

        let mut missing_connection = HashMap::new();
        missing_connection.insert("Upgrade".to_string(), "websocket".to_string());
        let plain = InboundRequest {
            method: "GET".to_string(),
            target: "/ws".to_string(),
            headers: missing_connection,
            body: Vec::new(),
        };
        assert!(!RewriteProxy::is_upgrade_request(&plain));
    }

    #[test]
    fn prepare_upgrade_builds_raw_request_and_preserves_upgrade_headers() {
        let mut headers = HashMap::new();
        headers.insert("Host".to_string(), "example.com".to_string());
        headers.insert("Upgrade".to_string(), "websocket".to_string());
        headers.insert("Connection".to_string(), "Upgrade".to_string());
        let req = InboundRequest {
            method: "GET".to_string(),
            target: "/ws".to_string(),
            headers,
            body: Vec::new(),
        };

        let upstream = proxy().prepare_upgrade("https", "example.com", req).unwrap();
        assert_eq!(upstream.host, "example.com");
        assert_eq!(upstream.port, 443);
        assert!(upstream.use_tls);

        let raw = String::from_utf8(upstream.request_bytes).unwrap();
        assert!(raw.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(raw.contains("Upgrade: websocket"));
        assert!(raw.contains("Connection: Upgrade"));
    }
}
