//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides TLS interception for a CONNECT proxy.
//! It includes:
//! - Interception policy deciding intercept, opaque tunnel or reject
//! - Certificate Authority adapter signing and caching per-host leaves
//! - TLS configuration for the client-facing and destination legs
//! - HTTP/1 decoding, the handler chain and the interception session
//! - Opaque relay and session events

pub mod certificate_authority;
pub mod codec;
pub mod connect;
pub mod error;
pub mod handler;
pub mod http_parser;
pub mod interceptor;
pub mod logging;
pub mod policy;
pub mod policy_config;
pub mod relay;
pub mod tls_config;
pub mod upstream;

// Re-export main types
pub use certificate_authority::{
    CaConfig, CacheStats, CertificateAuthority, CertificateRecord, HostIdentifier, LeafSigner,
    RootSigner, SignedLeaf,
};
pub use codec::HttpReader;
pub use connect::{parse_authority, ConnectRequest, ConnectTarget, ConnectionTunnel, Rewind};
pub use error::{Leg, MitmError, ProxyError, TimeoutStage};
pub use handler::{
    HandlerChain, HandlerContext, HandlerError, HttpHandler, RequestOutcome, ResponseOutcome,
};
pub use http_parser::{
    parse_http1_request, parse_http1_response, BodyFraming, Headers, HttpRequest, HttpResponse,
    ParseError as HttpParseError,
};
pub use interceptor::{MitmInterceptor, MitmSession, SessionSettings};
pub use logging::{CloseReason, EventSink, FanoutEventSink, SessionEvent, TracingEventSink};
pub use policy::{
    decide, AlwaysIntercept, HostRule, HostRulesPolicy, InterceptPolicy, InterceptionDecision,
    PredicatePolicy,
};
pub use policy_config::{ConfigError as PolicyConfigError, PolicyConfig, PolicyMode};
pub use relay::{relay, RelayEnd, RelayStats};
pub use tls_config::{
    load_pem_certs, ClientTlsConfig, SniUtils, TlsConfigBuilder, TlsConfigError, TlsVerification,
    TlsVersion, UpstreamTlsConfig,
};
pub use upstream::{DirectConnector, StaticResolver, UpstreamConnector};
