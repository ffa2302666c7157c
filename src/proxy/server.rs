//! The proxy server: TCP accept loop, protocol sniffing, and the
//! scan-and-forward pipeline shared by the plaintext and MITM paths.
//!
//! Each accepted connection runs in its own task; a panicking flow takes
//! down only that task. Counters are process-wide atomics surfaced through
//! the `/health` endpoint.

use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt, TryStreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::http::uri::PathAndQuery;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::config::schema::{ProxyConfig, ScanTypeConfig};
use crate::lifecycle::Shutdown;
use crate::proxy::cert_cache::CertCache;
use crate::proxy::{mitm, original_dst};
use crate::scanner::types::{is_binary_content_type, should_scan_content_type, Decision, ScanResult};
use crate::scanner::ScannerClient;

/// Bodies above this size bypass scanning and stream through unmodified.
pub const SCAN_LIMIT: usize = 1024 * 1024;

/// Per-message read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS record type for a ClientHello.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

/// Process-wide request counters.
#[derive(Debug, Default)]
pub struct ProxyCounters {
    pub requests_total: AtomicU64,
    pub blocked: AtomicU64,
    pub warned: AtomicU64,
}

/// What a connection knows about where its traffic is headed.
#[derive(Clone)]
pub struct ConnCtx {
    pub scheme: &'static str,
    /// SNI (MITM) or None (plaintext; Host header decides).
    pub host: Option<String>,
    pub original_dst: Option<SocketAddr>,
    pub via_mitm: bool,
    /// Upstream client; MITM connections get one pinned to the original
    /// destination so the SNI name dials the intercepted address.
    pub client: reqwest::Client,
}

/// The transparent proxy server.
pub struct ProxyServer {
    pub config: Arc<ProxyConfig>,
    pub scanner: Arc<ScannerClient>,
    pub cert_cache: Arc<CertCache>,
    pub counters: Arc<ProxyCounters>,
    upstream: reqwest::Client,
}

impl ProxyServer {
    pub fn new(
        config: Arc<ProxyConfig>,
        scanner: Arc<ScannerClient>,
        cert_cache: Arc<CertCache>,
    ) -> Result<Self, std::io::Error> {
        let upstream = upstream_client(None)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(Self {
            config,
            scanner,
            cert_cache,
            counters: Arc::new(ProxyCounters::default()),
            upstream,
        })
    }

    /// Accept connections until shutdown; one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: &Shutdown) {
        let local_addr = listener.local_addr().ok();
        tracing::info!(address = ?local_addr, "proxy listening");

        tokio::spawn(
            self.cert_cache
                .clone()
                .run_eviction(shutdown.subscribe()),
        );

        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    tracing::debug!(peer = %peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = stop.recv() => {
                    tracing::info!("proxy accept loop stopping");
                    return;
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Redirected flows carry the true destination in SO_ORIGINAL_DST.
        // A destination equal to our own listener means the client dialed
        // us directly (proxy-style or health probe).
        let local = stream.local_addr().ok();
        let dst = original_dst::original_dst(&stream)
            .ok()
            .filter(|dst| Some(*dst) != local);

        let mut first = [0u8; 1];
        let n = stream.peek(&mut first).await?;
        if n == 0 {
            return Ok(());
        }

        tracing::debug!(peer = %peer, original_dst = ?dst, tls = first[0] == TLS_HANDSHAKE_BYTE, "connection accepted");

        if first[0] == TLS_HANDSHAKE_BYTE {
            mitm::handle_tls(self, stream, dst).await
        } else {
            let ctx = ConnCtx {
                scheme: "http",
                host: None,
                original_dst: dst,
                via_mitm: false,
                client: self.upstream.clone(),
            };
            self.serve_http1(stream, ctx).await
        }
    }

    /// Serve HTTP/1.x messages over any duplex stream (plain TCP or a
    /// terminated TLS session).
    pub(crate) async fn serve_http1<IO>(
        self: Arc<Self>,
        io: IO,
        ctx: ConnCtx,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let server = self.clone();
            let ctx = ctx.clone();
            async move {
                Ok::<_, std::convert::Infallible>(server.handle_request(req, &ctx).await)
            }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(READ_TIMEOUT)
            .serve_connection(TokioIo::new(io), service)
            .await?;
        Ok(())
    }

    async fn handle_request(&self, req: Request<Incoming>, ctx: &ConnCtx) -> Response<ProxyBody> {
        let request_id = Uuid::new_v4().to_string();

        // Direct requests to the proxy itself: health endpoint.
        if ctx.original_dst.is_none()
            && req.uri().authority().is_none()
            && req.uri().path() == "/health"
            && req.method() == Method::GET
        {
            return self.health_response();
        }

        self.counters.requests_total.fetch_add(1, Ordering::Relaxed);

        match self.proxy_request(req, ctx, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(request_id, error = %e, "proxy request failed");
                error_response(StatusCode::BAD_GATEWAY, &e.to_string(), &request_id)
            }
        }
    }

    async fn proxy_request(
        &self,
        req: Request<Incoming>,
        ctx: &ConnCtx,
        request_id: &str,
    ) -> Result<Response<ProxyBody>, Box<dyn std::error::Error + Send + Sync>> {
        let method = req.method().clone();
        let (target_url, host_header) = resolve_target(&req, ctx)?;

        let req_content_type = req
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut upstream_headers = reqwest::header::HeaderMap::new();
        for (name, value) in req.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                upstream_headers.insert(n, v);
            }
        }

        let body_bytes = req.into_body().collect().await?.to_bytes();

        // Request bodies can carry injections too (POST data headed for a
        // model). Scan the same way responses are scanned.
        let scan_cfg = &self.config.scanning.content;
        if scan_cfg.enabled
            && !body_bytes.is_empty()
            && body_bytes.len() <= SCAN_LIMIT
            && should_scan_content_type(&req_content_type)
            && !is_binary_content_type(&req_content_type)
        {
            if let Some(result) = self
                .scan(&body_bytes, &target_url, &req_content_type, request_id)
                .await
            {
                if effective_action(result.decision, scan_cfg) == "block" {
                    self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                    return Ok(block_response(&result, request_id, ctx.via_mitm));
                }
            }
        }

        tracing::debug!(request_id, method = %method, url = %target_url, "forwarding");

        let mut upstream_req = ctx
            .client
            .request(method, &target_url)
            .headers(upstream_headers);
        if let Some(host) = host_header {
            upstream_req = upstream_req.header(reqwest::header::HOST, host);
        }
        if !body_bytes.is_empty() {
            upstream_req = upstream_req.body(body_bytes);
        }

        let upstream_resp = upstream_req.send().await?;
        self.relay_response(upstream_resp, &target_url, ctx, request_id)
            .await
    }

    /// Read the upstream response up to the scan cap; scan when eligible,
    /// stream through otherwise.
    async fn relay_response(
        &self,
        upstream: reqwest::Response,
        source_url: &str,
        ctx: &ConnCtx,
        request_id: &str,
    ) -> Result<Response<ProxyBody>, Box<dyn std::error::Error + Send + Sync>> {
        let status = StatusCode::from_u16(upstream.status().as_u16())?;
        let content_type = upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length")
                {
                    continue;
                }
                if let (Ok(n), Ok(v)) = (
                    hyper::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                    hyper::header::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    headers.append(n, v);
                }
            }
        }
        builder = builder.header("X-Stronghold-Request-ID", request_id);
        if ctx.via_mitm {
            builder = builder.header("X-Stronghold-Proxy", "mitm");
        }

        let scan_cfg = &self.config.scanning.content;
        let scannable = scan_cfg.enabled
            && should_scan_content_type(&content_type)
            && !is_binary_content_type(&content_type);

        // Pull the body up to the cap. Anything larger streams through
        // unscanned; so does anything we were never going to scan.
        let mut body_stream = upstream.bytes_stream();
        let mut buffered = BytesMut::new();
        let mut overflow: Option<Bytes> = None;

        if scannable {
            while let Some(chunk) = body_stream.next().await {
                let chunk = chunk?;
                if buffered.len() + chunk.len() > SCAN_LIMIT {
                    overflow = Some(chunk);
                    break;
                }
                buffered.extend_from_slice(&chunk);
            }
        }

        if scannable && overflow.is_none() {
            let body = buffered.freeze();
            if !body.is_empty() {
                if let Some(result) = self.scan(&body, source_url, &content_type, request_id).await
                {
                    match effective_action(result.decision, scan_cfg).as_str() {
                        "block" => {
                            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                            return Ok(block_response(&result, request_id, ctx.via_mitm));
                        }
                        "warn" => {
                            self.counters.warned.fetch_add(1, Ordering::Relaxed);
                            builder = builder
                                .header("X-Stronghold-Decision", Decision::Warn.as_str())
                                .header(
                                    "X-Stronghold-Reason",
                                    sanitize_header_value(&result.reason),
                                );
                            return Ok(builder.body(full_body(body))?);
                        }
                        _ => {}
                    }
                }
            }
            builder = builder.header("X-Stronghold-Decision", Decision::Allow.as_str());
            return Ok(builder.body(full_body(body))?);
        }

        // Streaming path: buffered prefix (if any), the overflowing chunk,
        // then the rest of the upstream body, byte for byte.
        builder = builder.header("X-Stronghold-Decision", Decision::Allow.as_str());
        let mut head_chunks: Vec<Result<Bytes, std::io::Error>> = Vec::new();
        let prefix = buffered.freeze();
        if !prefix.is_empty() {
            head_chunks.push(Ok(prefix));
        }
        if let Some(chunk) = overflow {
            head_chunks.push(Ok(chunk));
        }
        let head = stream::iter(head_chunks);
        let tail = body_stream.map_err(io_error);
        let body = StreamBody::new(head.chain(tail).map_ok(Frame::data));
        Ok(builder.body(BoxBody::new(body))?)
    }

    /// Run a scan, honoring the fail-open flag when the scanner is down.
    /// `None` means "treat as allowed without a verdict".
    async fn scan(
        &self,
        body: &[u8],
        source_url: &str,
        content_type: &str,
        request_id: &str,
    ) -> Option<ScanResult> {
        match self.scanner.scan_content(body, source_url, content_type).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(request_id, error = %e, "scan error");
                if self.config.scanning.fail_open {
                    None
                } else {
                    Some(ScanResult {
                        decision: Decision::Block,
                        reason: "Scan failed - blocking for safety".to_string(),
                        ..ScanResult::allow("")
                    })
                }
            }
        }
    }

    fn health_response(&self) -> Response<ProxyBody> {
        let body = serde_json::json!({
            "status": "healthy",
            "requests_total": self.counters.requests_total.load(Ordering::Relaxed),
            "blocked": self.counters.blocked.load(Ordering::Relaxed),
            "warned": self.counters.warned.load(Ordering::Relaxed),
        });
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full_body(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
    }
}

/// Build an upstream client, optionally pinning `host` to `addr` so MITM'd
/// flows dial the intercepted destination under the SNI name. Redirects are
/// never followed; the agent sees them and decides.
pub(crate) fn upstream_client(
    pin: Option<(&str, SocketAddr)>,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(READ_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none());
    if let Some((host, addr)) = pin {
        builder = builder.resolve(host, addr);
    }
    builder.build()
}

/// Work out where a request is headed and what Host header to present.
fn resolve_target(
    req: &Request<Incoming>,
    ctx: &ConnCtx,
) -> Result<(String, Option<String>), Box<dyn std::error::Error + Send + Sync>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");

    // Absolute-form request line (explicit proxy mode).
    if let Some(authority) = req.uri().authority() {
        let scheme = req.uri().scheme_str().unwrap_or(ctx.scheme);
        return Ok((format!("{scheme}://{authority}{path_and_query}"), None));
    }

    let host_header = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let host = ctx
        .host
        .clone()
        .or_else(|| host_header.clone())
        .or_else(|| ctx.original_dst.map(|d| d.ip().to_string()))
        .ok_or("no host information for request")?;

    let default_port: u16 = if ctx.scheme == "https" { 443 } else { 80 };
    let port = ctx.original_dst.map(|d| d.port()).unwrap_or(default_port);

    let authority = if host.contains(':') || port == default_port {
        host.clone()
    } else {
        format!("{host}:{port}")
    };

    Ok((
        format!("{}://{authority}{path_and_query}", ctx.scheme),
        host_header,
    ))
}

/// Map a scan decision through the configured action overrides.
fn effective_action(decision: Decision, config: &ScanTypeConfig) -> String {
    match decision {
        Decision::Block => config.action_on_block.clone(),
        Decision::Warn => config.action_on_warn.clone(),
        Decision::Allow => "allow".to_string(),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .take(256)
        .collect()
}

pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| -> std::io::Error { match never {} })
        .boxed()
}

fn io_error(e: reqwest::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

/// The 403 substituted for blocked content.
pub(crate) fn block_response(
    result: &ScanResult,
    request_id: &str,
    via_mitm: bool,
) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "error": "Content blocked by Stronghold security scan",
        "reason": result.reason,
        "request_id": request_id,
        "recommended_action": result.recommended_action,
    });

    let mut builder = Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Stronghold-Decision", Decision::Block.as_str())
        .header("X-Stronghold-Action", "block")
        .header("X-Stronghold-Reason", sanitize_header_value(&result.reason))
        .header("X-Stronghold-Request-ID", request_id);
    if via_mitm {
        builder = builder.header("X-Stronghold-Proxy", "mitm");
    }

    builder
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "error": message,
        "request_id": request_id,
    });
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Stronghold-Request-ID", request_id)
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_action_respects_overrides() {
        let mut cfg = ScanTypeConfig::default();
        assert_eq!(effective_action(Decision::Block, &cfg), "block");
        assert_eq!(effective_action(Decision::Warn, &cfg), "warn");
        assert_eq!(effective_action(Decision::Allow, &cfg), "allow");

        cfg.action_on_block = "warn".to_string();
        assert_eq!(effective_action(Decision::Block, &cfg), "warn");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-custom"));
    }

    #[test]
    fn test_sanitize_header_value() {
        assert_eq!(sanitize_header_value("plain reason"), "plain reason");
        assert_eq!(sanitize_header_value("line\r\nbreak"), "linebreak");
    }

    #[test]
    fn test_block_response_shape() {
        let result = ScanResult {
            decision: Decision::Block,
            reason: "Prompt injection detected".to_string(),
            recommended_action: "Discard".to_string(),
            ..ScanResult::allow("")
        };
        let resp = block_response(&result, "req-1", true);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.headers()["X-Stronghold-Decision"], "BLOCK");
        assert_eq!(resp.headers()["X-Stronghold-Action"], "block");
        assert_eq!(resp.headers()["X-Stronghold-Proxy"], "mitm");
    }
}
