//! Destination leg: TCP connect plus TLS client handshake

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

use super::error::{Leg, ProxyError, TimeoutStage};
use super::tls_config::{SniUtils, UpstreamTlsConfig};

/// Opens TCP connections to destinations
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Resolves and connects directly
#[derive(Debug, Clone, Default)]
pub struct DirectConnector;

#[async_trait]
impl UpstreamConnector for DirectConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Sends chosen hosts to fixed addresses, everything else directly
///
/// Lets a proxy reach a local stand-in for a public name.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    overrides: HashMap<String, SocketAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.overrides.insert(host.into().to_ascii_lowercase(), addr);
        self
    }
}

#[async_trait]
impl UpstreamConnector for StaticResolver {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match self.overrides.get(&host.to_ascii_lowercase()) {
            Some(addr) => {
                debug!(target_host = %host, addr = %addr, "Using static upstream address");
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            None => DirectConnector.connect(host, port).await,
        }
    }
}

/// TCP connect bounded by `timeout`
pub async fn connect_tcp(
    connector: &dyn UpstreamConnector,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(timeout, connector.connect(host, port)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            error!(
                target_host = %host,
                target_port = port,
                error = %e,
                "Failed to connect to upstream"
            );
            Err(ProxyError::UpstreamConnect {
                host: host.to_string(),
                source: e,
            })
        }
        Err(_) => Err(ProxyError::Timeout {
            stage: TimeoutStage::UpstreamConnect,
            after: timeout,
        }),
    }
}

/// Connect and complete the TLS client handshake, SNI set to `host`
pub async fn connect_tls(
    connector: &dyn UpstreamConnector,
    tls: &UpstreamTlsConfig,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, ProxyError> {
    let server_name = SniUtils::parse_server_name(host)
        .map_err(|e| ProxyError::handshake(Leg::Destination, host, e))?;

    let stream = connect_tcp(connector, host, port, timeout).await?;

    let tls_connector = TlsConnector::from(tls.client_config());
    match tokio::time::timeout(timeout, tls_connector.connect(server_name, stream)).await {
        Ok(Ok(tls_stream)) => {
            debug!(
                target_host = %host,
                verification = ?tls.verification(),
                "Upstream TLS handshake successful"
            );
            Ok(tls_stream)
        }
        Ok(Err(e)) => Err(ProxyError::handshake(Leg::Destination, host, e)),
        Err(_) => Err(ProxyError::Timeout {
            stage: TimeoutStage::Handshake(Leg::Destination),
            after: timeout,
        }),
    }
}
