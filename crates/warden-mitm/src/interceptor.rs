//! CONNECT state machine: NEW → READ_REQUEST_LINE → {CONNECT → DECIDE_MITM →
//! {SPLICE, MITM → TLS_HANDSHAKE → INTERCEPT_HTTP}, absolute-form HTTP →
//! INTERCEPT_HTTP}.
//!
//! The splice path is a straight `tokio::io::copy_bidirectional`, the
//! idiomatic-Tokio equivalent of `oisp-redirector::proxy::handle_connection`'s
//! hand-rolled `tokio::join!(outbound, inbound)` byte-copy loop.

use crate::ca::CertificateAuthority;
use crate::duplex::{OriginStream, PrefixedStream};
use crate::error::{CaError, InterceptError, RewriteError};
use crate::httpio::{self, RequestHead};
use crate::rewrite::{InboundRequest, RewriteProxy};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub struct Interceptor {
    ca: Arc<CertificateAuthority>,
    rewrite: Arc<RewriteProxy>,
    /// Substrings of a CONNECT host that trigger MITM instead of splice.
    /// Empty means nothing is intercepted (reference policy's "hard-coded
    /// single substring" generalized to an operator-supplied, possibly
    /// empty, list — see SPEC_FULL.md §4.5).
    mitm_hosts: Vec<String>,
}

impl Interceptor {
    pub fn new(ca: Arc<CertificateAuthority>, rewrite: Arc<RewriteProxy>, mitm_hosts: Vec<String>) -> Self {
        Self { ca, rewrite, mitm_hosts }
    }

    pub fn should_mitm(&self, host: &str) -> bool {
        self.mitm_hosts.iter().any(|needle| host.contains(needle.as_str()))
    }

    pub async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), InterceptError> {
        let mut buf = Vec::new();
        let Some((head, consumed)) = httpio::read_request_head(&mut stream, &mut buf).await? else {
            return Ok(());
        };
        let leftover = buf[consumed..].to_vec();

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(stream, head, leftover).await
        } else if is_absolute_form(&head.target) {
            let host = connect_host_from_absolute(&head.target);
            self.intercept_http_loop(stream, "http", &host, head, leftover).await
        } else {
            Err(InterceptError::ClientProtocol(
                "expected CONNECT or absolute-form request on proxy port".to_string(),
            ))
        }
    }

    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        head: RequestHead,
        leftover: Vec<u8>,
    ) -> Result<(), InterceptError> {
        let target = head.target.clone();
        let host = target.split(':').next().unwrap_or(&target).to_string();

        if self.should_mitm(&host) {
            debug!(host, "MITM: terminating TLS locally");

            // Mint the leaf and build the TLS acceptor before writing the
            // 200 response: a `CAUnavailable`/`CryptoFailure` here must close
            // the client connection without ever sending "Connection
            // established" (spec.md §7).
            let leaf = self.ca.leaf_for(&host).await?;
            let server_config = build_server_config(&leaf)?;
            let acceptor = TlsAcceptor::from(Arc::new(server_config));

            write_connection_established(&mut stream).await?;
            let prefixed = PrefixedStream::new(leftover, stream);

            let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(prefixed))
                .await
                .map_err(|_| InterceptError::ClientProtocol("tls handshake timed out".to_string()))?
                .map_err(|e| InterceptError::ClientProtocol(format!("tls handshake failed: {e}")))?;

            self.intercept_http_stream(tls_stream, "https", &host).await
        } else {
            debug!(host, "splicing opaque TCP tunnel");
            let origin = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target))
                .await
                .map_err(|_| InterceptError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout")))?
                .map_err(InterceptError::Io)?;

            write_connection_established(&mut stream).await?;
            let mut origin = origin;
            if !leftover.is_empty() {
                origin.write_all(&leftover).await.map_err(InterceptError::Io)?;
            }
            tokio::io::copy_bidirectional(&mut stream, &mut origin)
                .await
                .map_err(InterceptError::Io)?;
            Ok(())
        }
    }

    async fn intercept_http_stream<S>(&self, stream: S, scheme: &str, connect_host: &str) -> Result<(), InterceptError>
    where
        S: DuplexStream,
    {
        let mut stream = stream;
        let mut buf = Vec::new();
        let Some((head, consumed)) = httpio::read_request_head(&mut stream, &mut buf).await? else {
            return Ok(());
        };
        let leftover = buf[consumed..].to_vec();
        self.intercept_http_loop(stream, scheme, connect_host, head, leftover).await
    }

    /// Drive one or more HTTP/1.1 requests over an already-plaintext stream
    /// (either never encrypted, or just TLS-terminated), handing each to
    /// `RewriteProxy` and writing its response back before reading the next.
    async fn intercept_http_loop<S>(
        &self,
        mut stream: S,
        scheme: &str,
        connect_host: &str,
        mut head: RequestHead,
        mut leftover: Vec<u8>,
    ) -> Result<(), InterceptError>
    where
        S: DuplexStream,
    {
        loop {
            let content_length = httpio::header_ci(&head.headers, "content-length")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body = httpio::read_body(&mut stream, &mut Vec::new(), &leftover, content_length)
                .await
                .map_err(InterceptError::Io)?;

            let close_requested = httpio::header_ci(&head.headers, "connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);

            let inbound = InboundRequest {
                method: head.method.clone(),
                target: head.target.clone(),
                headers: head.headers.clone(),
                body,
            };

            if RewriteProxy::is_upgrade_request(&inbound) {
                let upstream = self
                    .rewrite
                    .prepare_upgrade(scheme, connect_host, inbound)
                    .map_err(|e| InterceptError::ClientProtocol(e.to_string()))?;
                relay_upgrade(&mut stream, upstream).await?;
                // The connection is now an opaque relay; no further HTTP
                // requests can be read off it.
                return Ok(());
            }

            match self.rewrite.handle(scheme, connect_host, inbound).await {
                Ok(outbound) => write_response(&mut stream, outbound).await?,
                Err(RewriteError::ClientProtocol(msg)) => return Err(InterceptError::ClientProtocol(msg)),
                Err(_) => write_bad_gateway(&mut stream).await?,
            }

            if close_requested {
                return Ok(());
            }

            let mut buf = Vec::new();
            match httpio::read_request_head(&mut stream, &mut buf).await.map_err(InterceptError::Io)? {
                Some((next_head, consumed)) => {
                    head = next_head;
                    leftover = buf[consumed..].to_vec();
                }
                None => return Ok(()),
            }
        }
    }
}

fn is_absolute_form(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

fn connect_host_from_absolute(target: &str) -> String {
    url::Url::parse(target)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}

async fn write_connection_established<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), InterceptError> {
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .map_err(InterceptError::Io)
}

async fn write_bad_gateway<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), InterceptError> {
    stream
        .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .map_err(InterceptError::Io)
}

async fn write_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    mut outbound: crate::rewrite::OutboundResponse,
) -> Result<(), InterceptError> {
    let reason = http::StatusCode::from_u16(outbound.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");
    let mut head = format!("HTTP/1.1 {} {}\r\n", outbound.status, reason);
    for (name, value) in outbound.headers.iter() {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await.map_err(InterceptError::Io)?;

    loop {
        match outbound.response.chunk().await {
            Ok(Some(chunk)) => stream.write_all(&chunk).await.map_err(InterceptError::Io)?,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "error streaming upstream body");
                break;
            }
        }
    }
    Ok(())
}

/// Dial the origin named by `upstream`, replay the (rule-rewritten) upgrade
/// request verbatim, then splice client and origin byte-for-byte — the same
/// uninspected relay the CONNECT `SPLICE` path uses, just entered from
/// inside an already-intercepted HTTP exchange instead of at CONNECT time.
async fn relay_upgrade<S>(client: &mut S, upstream: crate::rewrite::UpstreamTarget) -> Result<(), InterceptError>
where
    S: DuplexStream,
{
    let addr = format!("{}:{}", upstream.host, upstream.port);
    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| InterceptError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout")))?
        .map_err(InterceptError::Io)?;

    let mut origin = if upstream.use_tls {
        let connector = tls_connector();
        let server_name = ServerName::try_from(upstream.host.clone())
            .map_err(|_| InterceptError::ClientProtocol(format!("invalid upstream hostname: {}", upstream.host)))?;
        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| InterceptError::ClientProtocol("upstream tls handshake timed out".to_string()))?
            .map_err(|e| InterceptError::ClientProtocol(format!("upstream tls handshake failed: {e}")))?;
        OriginStream::Tls(Box::new(tls))
    } else {
        OriginStream::Plain(tcp)
    };

    origin.write_all(&upstream.request_bytes).await.map_err(InterceptError::Io)?;
    tokio::io::copy_bidirectional(client, &mut origin)
        .await
        .map_err(InterceptError::Io)?;
    Ok(())
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn build_server_config(leaf: &crate::ca::LeafCertificate) -> Result<ServerConfig, CaError> {
    let cert_chain = vec![CertificateDer::from(leaf.cert_der.clone())];
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| CaError::CryptoFailure(e.to_string()))
}
