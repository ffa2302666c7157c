//! TLS interception.
//!
//! The acceptor reads the ClientHello without committing to a config, pulls
//! the SNI, mints (or fetches) a leaf certificate for that name, finishes
//! the handshake as the server, and then speaks plain HTTP/1.x with the
//! agent while re-encrypting to the real upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::proxy::server::{upstream_client, ConnCtx, ProxyServer};

pub async fn handle_tls(
    server: Arc<ProxyServer>,
    stream: TcpStream,
    original_dst: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;

    // SNI names the host the agent believes it is talking to. Flows without
    // SNI fall back to the redirected destination address.
    let host = match start.client_hello().server_name() {
        Some(name) => name.to_string(),
        None => original_dst
            .map(|d| d.ip().to_string())
            .ok_or("TLS connection without SNI or original destination")?,
    };

    let cert = server.cert_cache.get_cert(&host)?;
    let mut tls_config = (*cert.server_config()?).clone();
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let tls_stream = start.into_stream(Arc::new(tls_config)).await?;

    tracing::debug!(host, original_dst = ?original_dst, "TLS intercepted");

    // Dial the upstream by SNI name but pinned to the intercepted address,
    // so certificate validation and routing both see the truth.
    let client = match original_dst {
        Some(dst) => upstream_client(Some((&host, dst)))?,
        None => upstream_client(None)?,
    };

    let ctx = ConnCtx {
        scheme: "https",
        host: Some(host),
        original_dst,
        via_mitm: true,
        client,
    };

    server.serve_http1(tls_stream, ctx).await
}
