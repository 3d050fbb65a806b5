//! CONNECT proxy server: accept loop and per-connection dispatch
//!
//! Each accepted connection runs in its own task:
//! CONNECT head → policy → {intercept | opaque tunnel | reject}.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::mitm::{
    connect::ConnectionTunnel,
    error::{Leg, ProxyError},
    handler::{HandlerChain, HttpHandler},
    interceptor::{MitmInterceptor, SessionSettings},
    logging::{CloseReason, EventSink, SessionEvent, TracingEventSink},
    policy::{decide, AlwaysIntercept, InterceptPolicy, InterceptionDecision},
    relay::{relay, RelayEnd},
    tls_config::{TlsConfigError, UpstreamTlsConfig},
    upstream::{connect_tcp, DirectConnector, UpstreamConnector},
    CertificateAuthority,
};

/// Back-off after a failed `accept`, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Forward proxy that intercepts, tunnels or rejects CONNECT requests
pub struct MitmProxy {
    policy: Arc<dyn InterceptPolicy>,
    interceptor: MitmInterceptor,
    connector: Arc<dyn UpstreamConnector>,
    events: Arc<dyn EventSink>,
    settings: SessionSettings,
    next_session: AtomicU64,
}

/// Builder for [`MitmProxy`]
pub struct MitmProxyBuilder {
    ca: Arc<CertificateAuthority>,
    policy: Arc<dyn InterceptPolicy>,
    chain: HandlerChain,
    events: Arc<dyn EventSink>,
    upstream_tls: Option<Arc<UpstreamTlsConfig>>,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
}

impl MitmProxyBuilder {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            policy: Arc::new(AlwaysIntercept),
            chain: HandlerChain::new(),
            events: Arc::new(TracingEventSink),
            upstream_tls: None,
            connector: Arc::new(DirectConnector),
            settings: SessionSettings::default(),
        }
    }

    pub fn policy(mut self, policy: Arc<dyn InterceptPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Append a handler; handlers run in the order they are added
    pub fn with_handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.chain.push(handler);
        self
    }

    pub fn handler_chain(mut self, chain: HandlerChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// TLS settings for the destination leg (default: strict verification)
    pub fn upstream_tls(mut self, tls: Arc<UpstreamTlsConfig>) -> Self {
        self.upstream_tls = Some(tls);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.settings.handshake_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.settings.idle_timeout = timeout;
        self
    }

    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.settings.max_body_size = limit;
        self
    }

    pub fn build(self) -> Result<MitmProxy, TlsConfigError> {
        let upstream_tls = match self.upstream_tls {
            Some(tls) => tls,
            None => Arc::new(UpstreamTlsConfig::new()?),
        };

        info!(
            policy = self.policy.name(),
            handlers = self.chain.len(),
            verification = ?upstream_tls.verification(),
            handshake_timeout = ?self.settings.handshake_timeout,
            idle_timeout = ?self.settings.idle_timeout,
            "MITM proxy configured"
        );

        let interceptor = MitmInterceptor::new(
            self.ca,
            upstream_tls,
            Arc::clone(&self.connector),
            Arc::new(self.chain),
            Arc::clone(&self.events),
            self.settings,
        );

        Ok(MitmProxy {
            policy: self.policy,
            interceptor,
            connector: self.connector,
            events: self.events,
            settings: self.settings,
            next_session: AtomicU64::new(0),
        })
    }
}

impl MitmProxy {
    pub fn builder(ca: Arc<CertificateAuthority>) -> MitmProxyBuilder {
        MitmProxyBuilder::new(ca)
    }

    /// Serve until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Serve until `shutdown` resolves; sessions already running are left to finish
    pub async fn serve_with_shutdown<F>(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: F,
    ) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %local_addr, "Shutdown requested, no longer accepting");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = proxy.handle_connection(stream, Some(peer)).await {
                            if e.is_fault() {
                                debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        }
                    });
                }
            }
        }
    }

    /// Drive one client connection from CONNECT head to close
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.events
            .record(SessionEvent::Accepted { session_id, peer });

        let tunnel = match ConnectionTunnel::accept(stream, self.settings.handshake_timeout).await
        {
            Ok(tunnel) => tunnel,
            Err(err) => {
                self.closed(session_id, CloseReason::from_error(&err));
                return Err(err);
            }
        };

        let request = tunnel.request();
        if !request.is_connect() {
            warn!(
                session_id,
                method = %request.method,
                "Non-CONNECT request refused"
            );
            let _ = tunnel.reject(405, "Method Not Allowed").await;
            self.closed(session_id, CloseReason::Rejected(405));
            return Ok(());
        }

        let decision = decide(self.policy.as_ref(), request);
        self.events.record(SessionEvent::Decision {
            session_id,
            target: request.authority.clone(),
            decision,
        });

        match decision {
            InterceptionDecision::Intercept => {
                self.interceptor.intercept(session_id, tunnel).await?;
                Ok(())
            }
            InterceptionDecision::TunnelOpaque => self.tunnel(session_id, tunnel).await,
            InterceptionDecision::Reject => {
                let status = if request.target.is_some() {
                    (403, "Forbidden")
                } else {
                    (400, "Bad Request")
                };
                let _ = tunnel.reject(status.0, status.1).await;
                self.closed(session_id, CloseReason::Rejected(status.0));
                Ok(())
            }
        }
    }

    /// Relay the tunnel without terminating TLS
    async fn tunnel<S>(&self, session_id: u64, mut tunnel: ConnectionTunnel<S>) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (host, port) = match &tunnel.request().target {
            Some(target) => (target.host.clone(), target.port),
            None => return Err(ProxyError::MalformedConnect(tunnel.request().authority.clone())),
        };

        let upstream = match connect_tcp(
            self.connector.as_ref(),
            &host,
            port,
            self.settings.handshake_timeout,
        )
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let (status, reason) = err.tunnel_status();
                let _ = tunnel.reject(status, reason).await;
                self.closed(session_id, CloseReason::from_error(&err));
                return Err(err);
            }
        };

        if let Err(e) = tunnel.establish().await {
            let err = ProxyError::from_io(Leg::Client, e);
            self.closed(session_id, CloseReason::from_error(&err));
            return Err(err);
        }
        let (_request, client) = tunnel.into_parts();

        match relay(client, upstream, self.settings.idle_timeout).await {
            Ok(stats) => {
                info!(
                    session_id,
                    target_host = %host,
                    bytes_up = stats.client_to_destination,
                    bytes_down = stats.destination_to_client,
                    "Tunnel completed"
                );
                let reason = match stats.end {
                    RelayEnd::IdleTimeout => CloseReason::TimedOut,
                    _ => CloseReason::RelayFinished,
                };
                self.closed(session_id, reason);
                Ok(())
            }
            Err(err) => {
                error!(session_id, target_host = %host, error = %err, "Tunnel failed");
                self.closed(session_id, CloseReason::from_error(&err));
                Err(err)
            }
        }
    }

    fn closed(&self, session_id: u64, reason: CloseReason) {
        self.events.record(SessionEvent::Closed {
            session_id,
            reason,
            exchanges: 0,
        });
    }
}
