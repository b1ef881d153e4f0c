//! Process wiring: builds the shared engine/broadcaster/CA/interceptor, then
//! runs either dual-port (separate proxy and control-plane listeners) or
//! single-port mode (both multiplexed behind one socket) until a shutdown
//! signal arrives.
//!
//! Single-port mode avoids hand-rolling a manual hyper/axum connection-serving
//! loop: the control plane binds to an ephemeral loopback port, and the
//! shared listener peeks each new connection's first bytes to decide whether
//! to hand it to the `Interceptor` (CONNECT / absolute-form) or splice it
//! through to the loopback control plane (everything else).

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_core::{Broadcaster, RuleEngine, RuleStore};
use warden_mitm::{CertificateAuthority, Interceptor, RewriteProxy};
use warden_web::{AppState, SecuritySettings, WebConfig};

use crate::config::AppConfig;

const PEEK_BUF_SIZE: usize = 2048;
const MAX_TOKEN_AGE_HOURS: i64 = 24;

pub async fn run(app_config: AppConfig, ca_dir: PathBuf) -> Result<()> {
    let ca = Arc::new(
        CertificateAuthority::load_or_generate(ca_dir.join("ca.crt"), ca_dir.join("ca.key"))
            .context("failed to load or generate root CA")?,
    );

    let store = RuleStore::load_or_default(app_config.rules.file.clone());
    let engine = Arc::new(RuleEngine::new(store));
    let broadcaster = Arc::new(Broadcaster::new(app_config.logging.console));
    let rewrite = Arc::new(RewriteProxy::new(engine.clone(), broadcaster.clone()));
    let interceptor = Arc::new(Interceptor::new(
        ca.clone(),
        rewrite,
        app_config.server.mitm_hosts.clone(),
    ));

    let web_state = Arc::new(AppState {
        engine: engine.clone(),
        broadcaster,
        ca,
        security: SecuritySettings {
            enabled: app_config.security.enabled,
            api_token: app_config.security.api_token.clone(),
            allowed_ips: app_config.security.allowed_ips.clone(),
        },
        proxy_port: app_config.server.proxy_port,
        bind_ip: app_config.server.bind_ip.clone(),
        started_at: std::time::Instant::now(),
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));
    tokio::spawn(crate::sweeper::run(
        engine,
        chrono::Duration::hours(MAX_TOKEN_AGE_HOURS),
        shutdown.clone(),
    ));

    match std::env::var("PORT").ok().and_then(|v| v.parse::<u16>().ok()) {
        Some(port) => run_single_port(app_config, web_state, interceptor, port, shutdown).await,
        None => run_dual_port(app_config, web_state, interceptor, shutdown).await,
    }
}

async fn run_dual_port(
    app_config: AppConfig,
    web_state: Arc<AppState>,
    interceptor: Arc<Interceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let proxy_addr = format!("{}:{}", app_config.server.bind_ip, app_config.server.proxy_port);
    let listener = TcpListener::bind(&proxy_addr)
        .await
        .with_context(|| format!("failed to bind proxy listener on {proxy_addr}"))?;
    info!(%proxy_addr, "proxy listening");

    let web_config = WebConfig {
        bind_ip: app_config.server.bind_ip.clone(),
        port: app_config.server.web_port,
    };
    let web_shutdown = shutdown.clone();
    let web_task = tokio::spawn(async move {
        tokio::select! {
            result = warden_web::start_server(web_config, web_state) => {
                if let Err(err) = result {
                    error!(error = %err, "control plane exited with error");
                }
            }
            _ = web_shutdown.cancelled() => {}
        }
    });

    accept_loop(listener, interceptor, shutdown.clone()).await;
    shutdown.cancel();
    let _ = web_task.await;
    Ok(())
}

async fn run_single_port(
    app_config: AppConfig,
    web_state: Arc<AppState>,
    interceptor: Arc<Interceptor>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let internal_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind internal control-plane listener")?;
    let internal_addr = internal_listener.local_addr()?;
    info!(%internal_addr, "control plane listening internally (single-port mode)");

    let web_router = warden_web::build_router(web_state);
    let web_shutdown = shutdown.clone();
    let web_task = tokio::spawn(async move {
        tokio::select! {
            result = axum::serve(
                internal_listener,
                web_router.into_make_service_with_connect_info::<SocketAddr>(),
            ) => {
                if let Err(err) = result {
                    error!(error = %err, "internal control plane exited with error");
                }
            }
            _ = web_shutdown.cancelled() => {}
        }
    });

    let bind_addr = format!("{}:{}", app_config.server.bind_ip, port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind shared listener on {bind_addr}"))?;
    info!(%bind_addr, port, "proxy and control plane sharing one port");

    accept_loop_single_port(listener, interceptor, internal_addr, shutdown.clone()).await;
    shutdown.cancel();
    let _ = web_task.await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, interceptor: Arc<Interceptor>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let interceptor = interceptor.clone();
                        tokio::spawn(async move {
                            if let Err(err) = interceptor.handle_connection(stream).await {
                                warn!(%peer, error = %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Like [`accept_loop`], but peeks each connection's first bytes to decide
/// whether it is a proxy request (CONNECT or absolute-form HTTP) or a plain
/// request meant for the control plane, then splices the latter to
/// `internal_addr` byte-for-byte.
async fn accept_loop_single_port(
    listener: TcpListener,
    interceptor: Arc<Interceptor>,
    internal_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let interceptor = interceptor.clone();
                        tokio::spawn(async move {
                            if let Err(err) = dispatch_connection(stream, interceptor, internal_addr).await {
                                warn!(%peer, error = %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn dispatch_connection(
    mut stream: TcpStream,
    interceptor: Arc<Interceptor>,
    internal_addr: SocketAddr,
) -> std::io::Result<()> {
    let mut peek_buf = vec![0u8; PEEK_BUF_SIZE];
    let n = stream.peek(&mut peek_buf).await?;
    let peeked = &peek_buf[..n];

    if is_proxy_request(peeked) {
        if let Err(err) = interceptor.handle_connection(stream).await {
            warn!(error = %err, "interceptor failed");
        }
        return Ok(());
    }

    let mut internal = TcpStream::connect(internal_addr).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut internal).await?;
    Ok(())
}

fn is_proxy_request(peeked: &[u8]) -> bool {
    let Some(line_end) = peeked.windows(2).position(|w| w == b"\r\n") else {
        return false;
    };
    let Ok(line) = std::str::from_utf8(&peeked[..line_end]) else {
        return false;
    };
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    method.eq_ignore_ascii_case("CONNECT") || target.starts_with("http://") || target.starts_with("https://")
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
