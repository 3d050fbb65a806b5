//! MITM Interceptor - Main interception logic
//!
//! This module handles the interception flow for one accepted CONNECT:
//! 1. Obtain the leaf certificate for the CONNECT host
//! 2. Open the tunnel and accept client TLS with that certificate
//! 3. Establish upstream TLS to the real destination
//! 4. Run the HTTP/1 exchange loop through the handler chain

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::certificate_authority::CertificateAuthority;
use super::codec::HttpReader;
use super::connect::ConnectionTunnel;
use super::error::{Leg, ProxyError, TimeoutStage};
use super::handler::{HandlerChain, HandlerContext, RequestVerdict, ResponseVerdict};
use super::http_parser::{HttpResponse, ParseError, MAX_HEAD_SIZE};
use super::logging::{CloseReason, EventSink, SessionEvent};
use super::relay::relay;
use super::tls_config::UpstreamTlsConfig;
use super::upstream::{connect_tls, UpstreamConnector};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Timeouts and limits applied to each intercepted session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Bound on each TLS handshake and on the upstream TCP connect
    pub handshake_timeout: Duration,
    /// Bound on each read while a message is expected on either leg
    pub idle_timeout: Duration,
    /// Largest decoded body accepted on either leg
    pub max_body_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Shared interception state: CA, upstream TLS, handlers, events
pub struct MitmInterceptor {
    ca: Arc<CertificateAuthority>,
    upstream_tls: Arc<UpstreamTlsConfig>,
    connector: Arc<dyn UpstreamConnector>,
    chain: Arc<HandlerChain>,
    events: Arc<dyn EventSink>,
    settings: SessionSettings,
}

impl MitmInterceptor {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        upstream_tls: Arc<UpstreamTlsConfig>,
        connector: Arc<dyn UpstreamConnector>,
        chain: Arc<HandlerChain>,
        events: Arc<dyn EventSink>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            ca,
            upstream_tls,
            connector,
            chain,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Intercept one tunnel end to end; emits the session's `Closed` event
    pub async fn intercept<S>(
        &self,
        session_id: u64,
        tunnel: ConnectionTunnel<S>,
    ) -> Result<CloseReason, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (result, exchanges) = match self.establish_and_run(session_id, tunnel).await {
            Ok((reason, exchanges)) => (Ok(reason), exchanges),
            Err((err, exchanges)) => (Err(err), exchanges),
        };

        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(err) => CloseReason::from_error(err),
        };
        self.events.record(SessionEvent::Closed {
            session_id,
            reason,
            exchanges,
        });
        result
    }

    async fn establish_and_run<S>(
        &self,
        session_id: u64,
        mut tunnel: ConnectionTunnel<S>,
    ) -> Result<(CloseReason, u64), (ProxyError, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = match tunnel.request().target.clone() {
            Some(target) => target,
            None => {
                let err = ProxyError::MalformedConnect(tunnel.request().authority.clone());
                let (status, reason) = err.tunnel_status();
                let _ = tunnel.reject(status, reason).await;
                return Err((err, 0));
            }
        };
        let host = target.host.clone();
        let timeout = self.settings.handshake_timeout;

        // 1. Leaf first, so a signing failure can still be answered in plaintext
        let record = match self.ca.certificate_for(&host).await {
            Ok(record) => record,
            Err(source) => {
                error!(target_host = %host, error = %source, "Certificate signing failed");
                let err = ProxyError::CertificateSigning {
                    host: host.clone(),
                    source,
                };
                let (status, reason) = err.tunnel_status();
                let _ = tunnel.reject(status, reason).await;
                return Err((err, 0));
            }
        };

        // 2. Open the tunnel
        tunnel
            .establish()
            .await
            .map_err(|e| (ProxyError::from_io(Leg::Client, e), 0))?;
        let (_request, stream) = tunnel.into_parts();

        // 3. Client-facing TLS with the leaf
        let acceptor = TlsAcceptor::from(record.server_config());
        let client_tls = match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                let err = ProxyError::handshake(Leg::Client, &host, e);
                self.handshake_failed(session_id, Leg::Client, &host, &err);
                return Err((err, 0));
            }
            Err(_) => {
                let err = ProxyError::Timeout {
                    stage: TimeoutStage::Handshake(Leg::Client),
                    after: timeout,
                };
                self.handshake_failed(session_id, Leg::Client, &host, &err);
                return Err((err, 0));
            }
        };
        self.events.record(SessionEvent::HandshakeOk {
            session_id,
            leg: Leg::Client,
            host: host.clone(),
        });

        // 4. Destination TLS; dropping `client_tls` on failure closes the client leg
        let upstream_tls = match connect_tls(
            self.connector.as_ref(),
            &self.upstream_tls,
            &host,
            target.port,
            timeout,
        )
        .await
        {
            Ok(tls) => tls,
            Err(err) => {
                self.handshake_failed(session_id, Leg::Destination, &host, &err);
                return Err((err, 0));
            }
        };
        self.events.record(SessionEvent::HandshakeOk {
            session_id,
            leg: Leg::Destination,
            host: host.clone(),
        });

        info!(
            session_id,
            target_host = %host,
            target_port = target.port,
            "TLS interception established"
        );

        // 5. HTTP/1 exchange loop
        let ctx = HandlerContext {
            session_id,
            host,
            port: target.port,
        };
        let mut session = MitmSession::new(
            ctx,
            client_tls,
            upstream_tls,
            Arc::clone(&self.chain),
            Arc::clone(&self.events),
            self.settings,
        );
        let result = session.run().await;
        let exchanges = session.exchanges();
        session.shutdown().await;

        match result {
            Ok(reason) => Ok((reason, exchanges)),
            Err(err) => Err((err, exchanges)),
        }
    }

    fn handshake_failed(&self, session_id: u64, leg: Leg, host: &str, err: &ProxyError) {
        self.events.record(SessionEvent::HandshakeFailed {
            session_id,
            leg,
            host: host.to_string(),
            error: err.to_string(),
        });
    }
}

/// What the exchange loop does after a response went out
enum Next {
    Continue,
    Close(CloseReason),
    Upgrade,
}

/// One intercepted session: both plaintext legs and the exchange loop
pub struct MitmSession<C, U> {
    ctx: HandlerContext,
    client_rd: Option<HttpReader<ReadHalf<C>>>,
    client_wr: Option<WriteHalf<C>>,
    upstream_rd: Option<HttpReader<ReadHalf<U>>>,
    upstream_wr: Option<WriteHalf<U>>,
    chain: Arc<HandlerChain>,
    events: Arc<dyn EventSink>,
    settings: SessionSettings,
    exchanges: u64,
}

impl<C, U> MitmSession<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        ctx: HandlerContext,
        client: C,
        upstream: U,
        chain: Arc<HandlerChain>,
        events: Arc<dyn EventSink>,
        settings: SessionSettings,
    ) -> Self {
        let (client_rd, client_wr) = tokio::io::split(client);
        let (upstream_rd, upstream_wr) = tokio::io::split(upstream);
        Self {
            ctx,
            client_rd: Some(
                HttpReader::new(client_rd, settings.max_body_size)
                    .with_idle_timeout(settings.idle_timeout),
            ),
            client_wr: Some(client_wr),
            upstream_rd: Some(
                HttpReader::new(upstream_rd, settings.max_body_size)
                    .with_idle_timeout(settings.idle_timeout),
            ),
            upstream_wr: Some(upstream_wr),
            chain,
            events,
            settings,
            exchanges: 0,
        }
    }

    /// Request/response pairs completed so far
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Run until either leg ends, a handler terminates, or an error occurs
    pub async fn run(&mut self) -> Result<CloseReason, ProxyError> {
        loop {
            match self.exchange().await? {
                Next::Continue => continue,
                Next::Close(reason) => return Ok(reason),
                Next::Upgrade => return self.switch_to_relay().await,
            }
        }
    }

    async fn exchange(&mut self) -> Result<Next, ProxyError> {
        let session_id = self.ctx.session_id;
        let idle = self.settings.idle_timeout;

        let mut request = match self.client_reader()?.read_request().await {
            Ok(None) => return Ok(Next::Close(CloseReason::PeerClosed(Leg::Client))),
            Ok(Some(request)) => request,
            Err(e) => return Err(decode_error(Leg::Client, e, idle)),
        };

        self.events.record(SessionEvent::RequestDecoded {
            session_id,
            method: request.method.clone(),
            path: request.path.clone(),
        });
        request.strip_proxy_headers();
        let client_keep_alive = request.keep_alive();
        let head_request = request.method.eq_ignore_ascii_case("HEAD");

        let request = match self.chain.run_request(&self.ctx, request).await {
            RequestVerdict::Forward(request) => request,
            RequestVerdict::Respond {
                mut response,
                fault,
            } => {
                match fault {
                    Some(fault) => self.handler_fault(fault),
                    None => self.events.record(SessionEvent::ShortCircuited {
                        session_id,
                        status: response.status_code,
                    }),
                }
                response.set_head_only(head_request);
                self.write_client(&response).await?;
                self.exchanges += 1;
                return Ok(close_or_continue(client_keep_alive, &response));
            }
            RequestVerdict::Terminate => {
                return Ok(Next::Close(CloseReason::HandlerTerminated));
            }
        };

        let wire = request.encode();
        {
            let writer = self.upstream_writer()?;
            writer
                .write_all(&wire)
                .await
                .map_err(|e| ProxyError::from_io(Leg::Destination, e))?;
            writer
                .flush()
                .await
                .map_err(|e| ProxyError::from_io(Leg::Destination, e))?;
        }
        debug!(
            session_id,
            method = %request.method,
            path = %request.path,
            modified = request.is_modified(),
            "Request forwarded"
        );

        let response = loop {
            let response = match self.await_response(&request.method).await {
                Ok(response) => response,
                Err(err @ ProxyError::Decode { .. }) => {
                    let _ = self
                        .write_client(&HttpResponse::bad_gateway("invalid response from destination"))
                        .await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            if response.is_informational() && response.status_code != 101 {
                self.write_client(&response).await?;
                continue;
            }
            break response;
        };

        let (mut response, fault) = match self.chain.run_response(&self.ctx, &request, response).await {
            ResponseVerdict::Send { response, fault } => (response, fault),
            ResponseVerdict::Terminate => {
                return Ok(Next::Close(CloseReason::HandlerTerminated));
            }
        };
        if let Some(fault) = fault {
            self.handler_fault(fault);
        }
        response.set_head_only(head_request);

        self.write_client(&response).await?;
        self.exchanges += 1;

        if response.status_code == 101 && request.is_upgrade() {
            return Ok(Next::Upgrade);
        }
        Ok(close_or_continue(client_keep_alive, &response))
    }

    fn handler_fault(&self, fault: ProxyError) {
        warn!(
            session_id = self.ctx.session_id,
            target_host = %self.ctx.host,
            error = %fault,
            "Answering with 502, session continues"
        );
        self.events.record(SessionEvent::HandlerFault {
            session_id: self.ctx.session_id,
            error: fault.to_string(),
        });
    }

    /// Read the destination's answer while watching the client for closure
    async fn await_response(&mut self, method: &str) -> Result<HttpResponse, ProxyError> {
        let idle = self.settings.idle_timeout;
        let pipeline_limit = MAX_HEAD_SIZE + self.settings.max_body_size;

        let upstream_rd = self
            .upstream_rd
            .as_mut()
            .ok_or(ProxyError::TransportClosed {
                leg: Leg::Destination,
            })?;
        let client_rd = self
            .client_rd
            .as_mut()
            .ok_or(ProxyError::TransportClosed { leg: Leg::Client })?;

        loop {
            let watch_client = !client_rd.is_eof() && client_rd.buffered() < pipeline_limit;
            tokio::select! {
                result = upstream_rd.read_response(method) => {
                    return match result {
                        Ok(Some(response)) => Ok(response),
                        Ok(None) => Err(ProxyError::TransportClosed { leg: Leg::Destination }),
                        Err(e) => Err(decode_error(Leg::Destination, e, idle)),
                    };
                }
                read = client_rd.read_more(), if watch_client => {
                    match read {
                        Ok(0) => {
                            debug!(
                                session_id = self.ctx.session_id,
                                "Client closed while awaiting destination"
                            );
                            return Err(ProxyError::TransportClosed { leg: Leg::Client });
                        }
                        // pipelined bytes stay buffered for the next exchange
                        Ok(_) => continue,
                        Err(e) => return Err(ProxyError::from_io(Leg::Client, e)),
                    }
                }
            }
        }
    }

    async fn write_client(&mut self, response: &HttpResponse) -> Result<(), ProxyError> {
        let wire = response.encode();
        let writer = self
            .client_wr
            .as_mut()
            .ok_or(ProxyError::TransportClosed { leg: Leg::Client })?;
        writer
            .write_all(&wire)
            .await
            .map_err(|e| ProxyError::from_io(Leg::Client, e))?;
        writer
            .flush()
            .await
            .map_err(|e| ProxyError::from_io(Leg::Client, e))
    }

    fn client_reader(&mut self) -> Result<&mut HttpReader<ReadHalf<C>>, ProxyError> {
        self.client_rd
            .as_mut()
            .ok_or(ProxyError::TransportClosed { leg: Leg::Client })
    }

    fn upstream_writer(&mut self) -> Result<&mut WriteHalf<U>, ProxyError> {
        self.upstream_wr.as_mut().ok_or(ProxyError::TransportClosed {
            leg: Leg::Destination,
        })
    }

    /// After `101 Switching Protocols` both legs carry an opaque protocol
    async fn switch_to_relay(&mut self) -> Result<CloseReason, ProxyError> {
        let (client_rd, client_wr, upstream_rd, upstream_wr) = match (
            self.client_rd.take(),
            self.client_wr.take(),
            self.upstream_rd.take(),
            self.upstream_wr.take(),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => return Err(ProxyError::TransportClosed { leg: Leg::Client }),
        };

        let (client_rd, client_pending) = client_rd.into_parts();
        let (upstream_rd, upstream_pending) = upstream_rd.into_parts();
        let mut client = client_rd.unsplit(client_wr);
        let mut upstream = upstream_rd.unsplit(upstream_wr);

        flush_pending(&mut upstream, client_pending, Leg::Destination).await?;
        flush_pending(&mut client, upstream_pending, Leg::Client).await?;

        debug!(
            session_id = self.ctx.session_id,
            target_host = %self.ctx.host,
            "Protocol switched, relaying opaque bytes"
        );
        relay(client, upstream, self.settings.idle_timeout).await?;
        Ok(CloseReason::RelayFinished)
    }

    /// Best-effort close of both legs
    pub async fn shutdown(&mut self) {
        if let Some(mut writer) = self.client_wr.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
        }
        if let Some(mut writer) = self.upstream_wr.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
        }
        self.client_rd = None;
        self.upstream_rd = None;
    }
}

async fn flush_pending<W>(writer: &mut W, pending: BytesMut, leg: Leg) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    if pending.is_empty() {
        return Ok(());
    }
    writer
        .write_all(&pending)
        .await
        .map_err(|e| ProxyError::from_io(leg, e))?;
    writer.flush().await.map_err(|e| ProxyError::from_io(leg, e))
}

fn close_or_continue(client_keep_alive: bool, response: &HttpResponse) -> Next {
    if client_keep_alive && response.keep_alive() {
        Next::Continue
    } else {
        Next::Close(CloseReason::ConnectionClose)
    }
}

fn decode_error(leg: Leg, err: ParseError, idle: Duration) -> ProxyError {
    match err {
        ParseError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ProxyError::Timeout {
            stage: TimeoutStage::Idle(leg),
            after: idle,
        },
        ParseError::Io(e) => ProxyError::from_io(leg, e),
        other => ProxyError::decode(leg, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::certificate_authority::{CaConfig, RootSigner};
    use crate::mitm::handler::{HandlerError, HttpHandler, RequestOutcome, ResponseOutcome};
    use crate::mitm::http_parser::HttpRequest;
    use crate::mitm::upstream::DirectConnector;
    use async_trait::async_trait;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    #[derive(Default)]
    struct Collect(Mutex<Vec<SessionEvent>>);

    impl EventSink for Collect {
        fn record(&self, event: SessionEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct Deny;

    #[async_trait]
    impl HttpHandler for Deny {
        async fn on_request(
            &self,
            _ctx: &HandlerContext,
            request: HttpRequest,
        ) -> Result<RequestOutcome, HandlerError> {
            if request.path.starts_with("/blocked") {
                Ok(RequestOutcome::ShortCircuit(
                    HttpResponse::new(403, "Forbidden").with_body("blocked"),
                ))
            } else {
                Ok(RequestOutcome::Continue(request))
            }
        }
    }

    struct Flaky;

    #[async_trait]
    impl HttpHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn on_request(
            &self,
            _ctx: &HandlerContext,
            request: HttpRequest,
        ) -> Result<RequestOutcome, HandlerError> {
            if request.path == "/fail" {
                return Err(HandlerError::new("lookup table missing"));
            }
            Ok(RequestOutcome::Continue(request))
        }
    }

    struct HangUp;

    #[async_trait]
    impl HttpHandler for HangUp {
        async fn on_response(
            &self,
            _ctx: &HandlerContext,
            _request: &HttpRequest,
            _response: HttpResponse,
        ) -> Result<ResponseOutcome, HandlerError> {
            Ok(ResponseOutcome::Terminate)
        }
    }

    fn test_ca() -> Arc<CertificateAuthority> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Interceptor Test Root");
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let signer = RootSigner::from_pem(&cert.pem(), &key.serialize_pem()).unwrap();
        Arc::new(CertificateAuthority::new(Arc::new(signer), CaConfig::default()))
    }

    struct Harness {
        client: DuplexStream,
        destination: DuplexStream,
        events: Arc<Collect>,
        task: tokio::task::JoinHandle<(Result<CloseReason, ProxyError>, u64)>,
    }

    fn start(chain: HandlerChain, idle: Duration) -> Harness {
        let (client, client_proxy) = duplex(64 * 1024);
        let (destination_proxy, destination) = duplex(64 * 1024);
        let events = Arc::new(Collect::default());
        let settings = SessionSettings {
            idle_timeout: idle,
            ..SessionSettings::default()
        };
        let ctx = HandlerContext {
            session_id: 1,
            host: "example.com".to_string(),
            port: 443,
        };
        let mut session = MitmSession::new(
            ctx,
            client_proxy,
            destination_proxy,
            Arc::new(chain),
            events.clone(),
            settings,
        );
        let task = tokio::spawn(async move {
            let result = session.run().await;
            let exchanges = session.exchanges();
            session.shutdown().await;
            (result, exchanges)
        });
        Harness {
            client,
            destination,
            events,
            task,
        }
    }

    async fn read_exactly(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_empty_chain_is_byte_transparent() {
        let mut h = start(HandlerChain::new(), Duration::from_secs(5));

        // odd spacing and header case must survive untouched
        let request: &[u8] =
            b"POST /submit HTTP/1.1\r\nhost: example.com\r\nX-Odd:   spaced\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        h.client.write_all(request).await.unwrap();
        assert_eq!(read_exactly(&mut h.destination, request.len()).await, request);

        let response: &[u8] =
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nSet-Cookie: a=b\r\n\r\nhello";
        h.destination.write_all(response).await.unwrap();
        assert_eq!(read_exactly(&mut h.client, response.len()).await, response);

        drop(h.client);
        let (result, exchanges) = h.task.await.unwrap();
        assert_eq!(result.unwrap(), CloseReason::PeerClosed(Leg::Client));
        assert_eq!(exchanges, 1);
    }

    #[tokio::test]
    async fn test_short_circuit_never_reaches_destination() {
        let mut h = start(
            HandlerChain::new().with_handler(Arc::new(Deny)),
            Duration::from_secs(5),
        );

        h.client
            .write_all(b"GET /blocked HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let expected = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 7\r\n\r\nblocked";
        assert_eq!(read_exactly(&mut h.client, expected.len()).await, expected);

        // next request is forwarded, and it is the first thing the destination sees
        let allowed: &[u8] = b"GET /ok HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(allowed).await.unwrap();
        assert_eq!(read_exactly(&mut h.destination, allowed.len()).await, allowed);

        h.destination
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        read_exactly(&mut h.client, 27).await;

        drop(h.client);
        let (result, exchanges) = h.task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(exchanges, 2);

        let events = h.events.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ShortCircuited { status: 403, .. })));
    }

    #[tokio::test]
    async fn test_proxy_headers_stripped() {
        let mut h = start(HandlerChain::new(), Duration::from_secs(5));

        h.client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let expected = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(read_exactly(&mut h.destination, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_destination() {
        let mut h = start(HandlerChain::new(), Duration::from_secs(30));

        let request: &[u8] = b"GET /slow HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(request).await.unwrap();
        read_exactly(&mut h.destination, request.len()).await;

        // destination never answers; the client gives up
        drop(h.client);
        let (result, _) = tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::TransportClosed { leg: Leg::Client })
        ));

        let mut rest = Vec::new();
        h.destination.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_session() {
        let h = start(HandlerChain::new(), Duration::from_millis(100));
        let (result, _) = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::Timeout {
                stage: TimeoutStage::Idle(Leg::Client),
                ..
            })
        ));
        drop(h.client);
    }

    #[tokio::test]
    async fn test_informational_forwarded_before_final() {
        let mut h = start(HandlerChain::new(), Duration::from_secs(5));

        let request: &[u8] =
            b"POST /up HTTP/1.1\r\nHost: example.com\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\nhi";
        h.client.write_all(request).await.unwrap();
        read_exactly(&mut h.destination, request.len()).await;

        let interim: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
        let final_response: &[u8] = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        h.destination.write_all(interim).await.unwrap();
        h.destination.write_all(final_response).await.unwrap();

        let mut expected = interim.to_vec();
        expected.extend_from_slice(final_response);
        assert_eq!(read_exactly(&mut h.client, expected.len()).await, expected);

        let (result, exchanges) = h.task.await.unwrap();
        assert_eq!(result.unwrap(), CloseReason::ConnectionClose);
        assert_eq!(exchanges, 1);
    }

    #[tokio::test]
    async fn test_upgrade_switches_to_relay() {
        let mut h = start(HandlerChain::new(), Duration::from_secs(5));

        let request: &[u8] =
            b"GET /ws HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        h.client.write_all(request).await.unwrap();
        read_exactly(&mut h.destination, request.len()).await;

        let switching: &[u8] =
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        h.destination.write_all(switching).await.unwrap();
        assert_eq!(read_exactly(&mut h.client, switching.len()).await, switching);

        h.client.write_all(b"\x81\x02hi").await.unwrap();
        assert_eq!(read_exactly(&mut h.destination, 4).await, b"\x81\x02hi");

        drop(h.destination);
        let (result, _) = h.task.await.unwrap();
        assert_eq!(result.unwrap(), CloseReason::RelayFinished);
    }

    #[tokio::test]
    async fn test_garbage_from_destination_is_decode_error() {
        let mut h = start(HandlerChain::new(), Duration::from_secs(5));

        let request: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(request).await.unwrap();
        read_exactly(&mut h.destination, request.len()).await;
        h.destination.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap();

        let (result, _) = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::Decode {
                leg: Leg::Destination,
                ..
            })
        ));

        let mut answer = Vec::new();
        h.client.read_to_end(&mut answer).await.unwrap();
        assert!(answer.starts_with(b"HTTP/1.1 502 Bad Gateway"));
    }

    #[tokio::test]
    async fn test_handler_fault_answers_502_and_session_continues() {
        let mut h = start(
            HandlerChain::new().with_handler(Arc::new(Flaky)),
            Duration::from_secs(5),
        );

        h.client
            .write_all(b"GET /fail HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let expected = HttpResponse::bad_gateway("request handler failed").encode();
        assert_eq!(
            read_exactly(&mut h.client, expected.len()).await,
            &expected[..]
        );

        // same connection, next request goes through
        let allowed: &[u8] = b"GET /ok HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(allowed).await.unwrap();
        assert_eq!(read_exactly(&mut h.destination, allowed.len()).await, allowed);

        let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        h.destination.write_all(response).await.unwrap();
        assert_eq!(read_exactly(&mut h.client, response.len()).await, response);

        drop(h.client);
        let (result, exchanges) = h.task.await.unwrap();
        assert_eq!(result.unwrap(), CloseReason::PeerClosed(Leg::Client));
        assert_eq!(exchanges, 2);

        let events = h.events.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::HandlerFault { error, .. } if error.contains("lookup table missing")
        )));
    }

    #[tokio::test]
    async fn test_response_terminate_closes_without_answer() {
        let mut h = start(
            HandlerChain::new().with_handler(Arc::new(HangUp)),
            Duration::from_secs(5),
        );

        let request: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(request).await.unwrap();
        read_exactly(&mut h.destination, request.len()).await;
        h.destination
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();

        let (result, exchanges) = h.task.await.unwrap();
        assert_eq!(result.unwrap(), CloseReason::HandlerTerminated);
        assert_eq!(exchanges, 0);

        let mut answer = Vec::new();
        h.client.read_to_end(&mut answer).await.unwrap();
        assert!(answer.is_empty());
    }

    #[tokio::test]
    async fn test_short_circuit_to_head_has_no_body() {
        let mut h = start(
            HandlerChain::new().with_handler(Arc::new(Deny)),
            Duration::from_secs(5),
        );

        h.client
            .write_all(b"HEAD /blocked HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let expected: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        assert_eq!(read_exactly(&mut h.client, expected.len()).await, expected);

        // nothing trails the head: the next bytes belong to the next response
        let allowed: &[u8] = b"GET /ok HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(allowed).await.unwrap();
        read_exactly(&mut h.destination, allowed.len()).await;
        let response: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";
        h.destination.write_all(response).await.unwrap();
        assert_eq!(read_exactly(&mut h.client, response.len()).await, response);
    }

    #[tokio::test]
    async fn test_slow_body_within_idle_gaps_is_delivered() {
        let mut h = start(HandlerChain::new(), Duration::from_millis(300));

        let request: &[u8] = b"GET /download HTTP/1.1\r\nHost: example.com\r\n\r\n";
        h.client.write_all(request).await.unwrap();
        read_exactly(&mut h.destination, request.len()).await;

        let head: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\n";
        h.destination.write_all(head).await.unwrap();
        for byte in b"abcdef" {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.destination.write_all(&[*byte]).await.unwrap();
        }

        let mut expected = head.to_vec();
        expected.extend_from_slice(b"abcdef");
        assert_eq!(read_exactly(&mut h.client, expected.len()).await, expected);

        let (result, exchanges) = h.task.await.unwrap();
        assert_eq!(result.unwrap(), CloseReason::ConnectionClose);
        assert_eq!(exchanges, 1);
    }

    #[tokio::test]
    async fn test_silent_client_times_out_in_handshake() {
        let (mut client, proxy_side) = duplex(16 * 1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let tunnel = ConnectionTunnel::accept(proxy_side, Duration::from_secs(1))
            .await
            .unwrap();

        let events = Arc::new(Collect::default());
        let interceptor = MitmInterceptor::new(
            test_ca(),
            Arc::new(UpstreamTlsConfig::new().unwrap()),
            Arc::new(DirectConnector),
            Arc::new(HandlerChain::new()),
            events.clone(),
            SessionSettings {
                handshake_timeout: Duration::from_millis(200),
                ..SessionSettings::default()
            },
        );

        // the client reads the 200 but never sends a ClientHello
        let started = std::time::Instant::now();
        let result = interceptor.intercept(7, tunnel).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            result,
            Err(ProxyError::Timeout {
                stage: TimeoutStage::Handshake(Leg::Client),
                ..
            })
        ));

        let mut answer = vec![0u8; 39];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        let events = events.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::HandshakeFailed {
                leg: Leg::Client,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Closed {
                reason: CloseReason::TimedOut,
                ..
            }
        )));
    }
}
