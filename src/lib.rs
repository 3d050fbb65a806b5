//! tunnel-mitm - CONNECT forward proxy with TLS interception
//!
//! Every CONNECT request is classified by an interception policy:
//!
//! - **Intercept**: the proxy presents a leaf certificate signed by a locally
//!   trusted root, opens its own TLS connection to the destination, and runs
//!   each decoded HTTP/1 exchange through an ordered handler chain
//! - **TunnelOpaque**: bytes are relayed untouched
//! - **Reject**: the tunnel is refused with an error status
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunnel_mitm::{CaConfig, CertificateAuthority, MitmProxy, RootSigner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let signer = RootSigner::from_pem_files("ca.pem", "ca-key.pem")?;
//!     let ca = Arc::new(CertificateAuthority::new(Arc::new(signer), CaConfig::default()));
//!
//!     let proxy = Arc::new(MitmProxy::builder(ca).build()?);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     proxy.serve(listener).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `mitm` - policy, CA adapter, TLS legs, HTTP/1 codec, handler chain, relay
//! - `server` - accept loop and per-connection dispatch
//! - `config` - environment configuration for the binary

pub mod config;
pub mod mitm;
pub mod server;

// Re-export commonly used types

/// Configuration types
pub use config::ProxyConfig;

/// Proxy server
pub use server::{MitmProxy, MitmProxyBuilder};

/// MITM types and functionality
pub use mitm::{
    // Policy
    AlwaysIntercept,
    // Certificate generation
    CaConfig,
    CertificateAuthority,
    // Events
    EventSink,
    // Handlers
    HandlerChain,
    HandlerContext,
    HandlerError,
    HostRulesPolicy,
    HttpHandler,
    HttpRequest,
    HttpResponse,
    InterceptPolicy,
    InterceptionDecision,
    LeafSigner,
    MitmError,
    PolicyConfig,
    PredicatePolicy,
    ProxyError,
    RequestOutcome,
    ResponseOutcome,
    RootSigner,
    SessionEvent,
    SessionSettings,
    TlsVerification,
    TracingEventSink,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
