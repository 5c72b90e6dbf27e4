use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsStream;

use crate::error::{CastError, Result};

/// Open the TLS control channel to a device.
///
/// Devices present self-signed certificates, so certificate and hostname
/// verification are disabled. Every failure is reported as
/// `ConnectionFailed` so callers can tell "unreachable" from "not found".
pub(crate) async fn connect_tls(
    host: IpAddr,
    port: u16,
    connect_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let unreachable = |reason: String| CastError::ConnectionFailed { host, port, reason };
    let addr = SocketAddr::new(host, port);

    tracing::info!("Connecting to {}", addr);

    let tcp = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| unreachable(format!("connect timed out after {:?}", connect_timeout)))?
        .map_err(|e| unreachable(e.to_string()))?;
    tcp.set_nodelay(true)
        .map_err(|e| unreachable(e.to_string()))?;

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let stream = timeout(connect_timeout, connector.connect(&host.to_string(), tcp))
        .await
        .map_err(|_| unreachable("TLS handshake timed out".to_string()))?
        .map_err(|e| unreachable(format!("TLS handshake failed: {e}")))?;

    tracing::debug!("TLS handshake with {} complete", addr);
    Ok(stream)
}
