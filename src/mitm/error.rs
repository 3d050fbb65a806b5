//! MITM error types
//!
//! Two layers:
//! - [`MitmError`] covers CA loading and leaf certificate signing
//! - [`ProxyError`] is the per-connection taxonomy surfaced by tunnels and
//!   interception sessions

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::http_parser::ParseError;

/// Result type for certificate operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Certificate authority errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate loading failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// Host cannot be placed in a certificate
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// rustls rejected the generated material
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            reason: msg.into(),
        }
    }
}

/// Which side of the proxy a failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Proxy ← client
    Client,
    /// Proxy → destination
    Destination,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client"),
            Leg::Destination => f.write_str("destination"),
        }
    }
}

/// Stage a timeout fired in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    ConnectHead,
    Handshake(Leg),
    UpstreamConnect,
    Idle(Leg),
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::ConnectHead => f.write_str("CONNECT head"),
            TimeoutStage::Handshake(leg) => write!(f, "{} handshake", leg),
            TimeoutStage::UpstreamConnect => f.write_str("upstream connect"),
            TimeoutStage::Idle(leg) => write!(f, "{} idle read", leg),
        }
    }
}

/// Per-connection error taxonomy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// CONNECT line or authority could not be understood
    #[error("Malformed CONNECT request: {0}")]
    MalformedConnect(String),

    /// TLS handshake failed on one leg
    #[error("TLS handshake failed on {leg} leg for {host}: {reason}")]
    HandshakeFailure {
        leg: Leg,
        host: String,
        reason: String,
    },

    /// The CA adapter could not produce a leaf for the host
    #[error("Certificate signing failed for {host}: {source}")]
    CertificateSigning {
        host: String,
        #[source]
        source: MitmError,
    },

    /// TCP connect to the destination failed
    #[error("Upstream connection failed for {host}: {source}")]
    UpstreamConnect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Plaintext HTTP could not be decoded
    #[error("Failed to decode HTTP on {leg} leg: {source}")]
    Decode {
        leg: Leg,
        #[source]
        source: ParseError,
    },

    /// A handler failed or panicked
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// Peer closed the connection
    #[error("Transport closed by {leg}")]
    TransportClosed { leg: Leg },

    /// Timed out waiting on I/O
    #[error("Timed out after {after:?} during {stage}")]
    Timeout { stage: TimeoutStage, after: Duration },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Create a handshake error
    pub fn handshake(leg: Leg, host: impl Into<String>, msg: impl fmt::Display) -> Self {
        Self::HandshakeFailure {
            leg,
            host: host.into(),
            reason: msg.to_string(),
        }
    }

    /// Create a decode error
    pub fn decode(leg: Leg, source: ParseError) -> Self {
        Self::Decode { leg, source }
    }

    /// Classify an I/O error raised on `leg`
    ///
    /// Resets, broken pipes and unexpected EOFs are peer closure, not faults.
    pub fn from_io(leg: Leg, err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected => {
                Self::TransportClosed { leg }
            }
            _ => Self::Io(err),
        }
    }

    /// Normal lifecycle endings are not reported as faults
    pub fn is_fault(&self) -> bool {
        !matches!(self, ProxyError::TransportClosed { .. })
    }

    /// Status line written to the plaintext tunnel when the failure happens
    /// before `200 Connection Established`
    pub fn tunnel_status(&self) -> (u16, &'static str) {
        match self {
            ProxyError::MalformedConnect(_) => (400, "Bad Request"),
            ProxyError::Timeout { .. } => (504, "Gateway Timeout"),
            _ => (502, "Bad Gateway"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_closed_is_not_a_fault() {
        let err = ProxyError::from_io(
            Leg::Client,
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(matches!(
            err,
            ProxyError::TransportClosed { leg: Leg::Client }
        ));
        assert!(!err.is_fault());

        let err = ProxyError::from_io(
            Leg::Destination,
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.is_fault());
    }

    #[test]
    fn test_tunnel_status_mapping() {
        assert_eq!(
            ProxyError::MalformedConnect("x".into()).tunnel_status().0,
            400
        );
        let signing = ProxyError::CertificateSigning {
            host: "example.com".into(),
            source: MitmError::cert_generation("example.com", "boom"),
        };
        assert_eq!(signing.tunnel_status(), (502, "Bad Gateway"));
    }

    #[test]
    fn test_display_names_leg() {
        let err = ProxyError::handshake(Leg::Destination, "example.com", "bad cert");
        assert_eq!(
            err.to_string(),
            "TLS handshake failed on destination leg for example.com: bad cert"
        );
    }
}
