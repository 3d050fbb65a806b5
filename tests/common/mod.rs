//! Shared fixtures: rcgen test CAs, a local HTTPS destination, proxy helpers
#![allow(dead_code)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{client, TlsAcceptor, TlsConnector};

use tunnel_mitm::mitm::{
    EventSink, HostIdentifier, HttpReader, LeafSigner, MitmError, SessionEvent, SignedLeaf,
};
use tunnel_mitm::{MitmProxyBuilder, RootSigner};

/// Self-signed root usable both as the proxy CA and as a destination CA
pub struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn root_signer(&self) -> RootSigner {
        RootSigner::from_pem(&self.cert_pem(), &self.key_pem()).unwrap()
    }

    /// Leaf for a destination server
    pub fn issue(&self, host: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, host);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }
}

/// Signer that can be switched off and slowed down
pub struct ControlledSigner {
    inner: RootSigner,
    pub healthy: AtomicBool,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ControlledSigner {
    pub fn new(inner: RootSigner) -> Self {
        Self {
            inner,
            healthy: AtomicBool::new(true),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl LeafSigner for ControlledSigner {
    fn sign_leaf(
        &self,
        host: &HostIdentifier,
        validity: Duration,
    ) -> Result<SignedLeaf, MitmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(MitmError::cert_generation(host.to_string(), "signer offline"));
        }
        self.inner.sign_leaf(host, validity)
    }
}

/// Records every session event
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn record(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// What the local destination observed
#[derive(Debug)]
pub enum UpstreamEvent {
    Request(Vec<u8>),
    Closed,
}

pub struct TestUpstream {
    pub addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

impl TestUpstream {
    /// Next event, or `None` if nothing arrives within `wait`
    pub async fn next_event(&mut self, wait: Duration) -> Option<UpstreamEvent> {
        tokio::time::timeout(wait, self.events.recv())
            .await
            .ok()
            .flatten()
    }
}

/// HTTPS destination for `host`; answers every request with `response`,
/// or never answers when `response` is `None`
pub async fn spawn_https_upstream(
    ca: &TestCa,
    host: &str,
    response: Option<&'static [u8]>,
) -> TestUpstream {
    let (chain, key) = ca.issue(host);
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(_) => return,
                };
                let (rd, mut wr) = tokio::io::split(tls);
                let mut reader = HttpReader::new(rd, 1 << 20);
                while let Ok(Some(request)) = reader.read_request().await {
                    let raw = request
                        .wire_bytes()
                        .map(|b| b.to_vec())
                        .unwrap_or_default();
                    let _ = tx.send(UpstreamEvent::Request(raw));
                    if let Some(response) = response {
                        if wr.write_all(response).await.is_err() || wr.flush().await.is_err() {
                            break;
                        }
                    }
                }
                let _ = tx.send(UpstreamEvent::Closed);
            });
        }
    });

    TestUpstream { addr, events: rx }
}

/// Plain TCP echo server
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    pub task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl RunningProxy {
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn spawn_proxy(builder: MitmProxyBuilder) -> RunningProxy {
    let proxy = Arc::new(builder.build().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(proxy.serve_with_shutdown(listener, async move {
        let _ = rx.await;
    }));
    RunningProxy {
        addr,
        shutdown: Some(tx),
        task,
    }
}

/// Read a response head byte by byte so nothing past it is consumed
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

/// Open a tunnel through the proxy; returns the socket and the proxy's answer
pub async fn connect_via(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let head = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    stream.write_all(head.as_bytes()).await.unwrap();
    let answer = read_head(&mut stream).await;
    (stream, answer)
}

/// TLS client trusting only `root`
pub async fn tls_handshake(
    stream: TcpStream,
    root: &TestCa,
    host: &str,
) -> std::io::Result<client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.add(root.cert_der()).unwrap();
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string()).unwrap();
    connector.connect(server_name, stream).await
}
