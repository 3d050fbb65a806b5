//! TLS Configuration for both legs of an intercepted session
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) presenting the per-host leaf
//! - Upstream TLS (proxy → destination) with strict or permissive verification
//!
//! ## Hardening
//!
//! - TLS 1.2 and 1.3 only
//! - ALPN offers `http/1.1` only; the session decoder speaks HTTP/1
//! - SNI set from the CONNECT host

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// ALPN protocol offered on both legs
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

impl TlsVersion {
    fn versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls12And13 => vec![&TLS12, &TLS13],
            TlsVersion::Tls13Only => vec![&TLS13],
        }
    }
}

/// How the destination's certificate is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerification {
    /// webpki roots plus configured extra roots, hostname checked
    #[default]
    Strict,
    /// Accept any destination certificate
    Permissive,
}

impl FromStr for TlsVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!(
                "unknown TLS verification '{}': expected strict or permissive",
                other
            )),
        }
    }
}

/// Client-facing TLS config (proxy acts as server with the leaf certificate)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        Self::new_with_options(cert_chain, private_key, TlsVersion::default())
    }

    pub fn new_with_options(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        tls_version: TlsVersion,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_protocol_versions(&tls_version.versions())
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client towards the destination)
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
    verification: TlsVerification,
}

impl UpstreamTlsConfig {
    /// Strict verification against the Mozilla root bundle
    pub fn new() -> Result<Self, TlsConfigError> {
        Self::new_with_options(TlsVerification::Strict, &[], TlsVersion::default())
    }

    pub fn new_with_options(
        verification: TlsVerification,
        extra_roots: &[CertificateDer<'static>],
        tls_version: TlsVersion,
    ) -> Result<Self, TlsConfigError> {
        let builder = ClientConfig::builder_with_protocol_versions(&tls_version.versions());

        let mut config = match verification {
            TlsVerification::Strict => {
                let mut root_store = RootCertStore::empty();
                root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
                for root in extra_roots {
                    root_store
                        .add(root.clone())
                        .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
                }

                info!(
                    tls_version = ?tls_version,
                    roots_count = root_store.len(),
                    extra_roots = extra_roots.len(),
                    "Upstream TLS config created (strict verification)"
                );

                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            TlsVerification::Permissive => {
                warn!(
                    tls_version = ?tls_version,
                    "Upstream TLS config created with certificate verification DISABLED"
                );

                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
                    .with_no_client_auth()
            }
        };

        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        Ok(Self {
            config: Arc::new(config),
            verification,
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn verification(&self) -> TlsVerification {
        self.verification
    }
}

/// TLS config builder shared by the CA adapter and the session manager
#[derive(Debug, Clone, Default)]
pub struct TlsConfigBuilder {
    tls_version: TlsVersion,
    verification: TlsVerification,
    extra_roots: Vec<CertificateDer<'static>>,
}

impl TlsConfigBuilder {
    /// Create new builder with secure defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set TLS version preference
    pub fn tls_version(mut self, version: TlsVersion) -> Self {
        self.tls_version = version;
        self
    }

    /// Set destination certificate verification
    pub fn verification(mut self, verification: TlsVerification) -> Self {
        self.verification = verification;
        self
    }

    /// Trust additional roots for the destination leg (strict mode only)
    pub fn extra_roots(mut self, roots: Vec<CertificateDer<'static>>) -> Self {
        self.extra_roots = roots;
        self
    }

    /// Build upstream TLS config
    pub fn build_upstream(&self) -> Result<UpstreamTlsConfig, TlsConfigError> {
        UpstreamTlsConfig::new_with_options(self.verification, &self.extra_roots, self.tls_version)
    }

    /// Build client-facing TLS config
    pub fn build_client_facing(
        &self,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<ClientTlsConfig, TlsConfigError> {
        ClientTlsConfig::new_with_options(cert_chain, private_key, self.tls_version)
    }
}

/// Load every certificate from a PEM file
pub fn load_pem_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        TlsConfigError::InvalidCertificate(format!("{}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::InvalidCertificate(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(TlsConfigError::InvalidCertificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    debug!(path = %path.display(), count = certs.len(), "Loaded PEM certificates");
    Ok(certs)
}

/// Accepts any destination certificate (permissive mode)
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_default() {
        assert_eq!(TlsVersion::default(), TlsVersion::Tls12And13);
    }

    #[test]
    fn test_verification_parsing() {
        assert_eq!(
            "strict".parse::<TlsVerification>().unwrap(),
            TlsVerification::Strict
        );
        assert_eq!(
            " Permissive ".parse::<TlsVerification>().unwrap(),
            TlsVerification::Permissive
        );
        assert!("sometimes".parse::<TlsVerification>().is_err());
        assert_eq!(TlsVerification::default(), TlsVerification::Strict);
    }

    #[test]
    fn test_sni_validate_hostname() {
        assert!(SniUtils::validate_hostname("example.com"));
        assert!(SniUtils::validate_hostname("a.b.c.example.com"));

        assert!(!SniUtils::validate_hostname(""));
        assert!(!SniUtils::validate_hostname(".example.com"));
        assert!(!SniUtils::validate_hostname("example.com."));
    }

    #[test]
    fn test_sni_parse_server_name() {
        assert!(SniUtils::parse_server_name("example.com").is_ok());
        assert!(SniUtils::parse_server_name("192.168.1.1").is_ok());
        assert!(SniUtils::parse_server_name("").is_err());
    }

    #[test]
    fn test_upstream_configs_offer_http1_only() {
        let strict = UpstreamTlsConfig::new().unwrap();
        assert_eq!(strict.verification(), TlsVerification::Strict);
        assert_eq!(strict.client_config().alpn_protocols, vec![ALPN_HTTP1.to_vec()]);

        let permissive = TlsConfigBuilder::new()
            .verification(TlsVerification::Permissive)
            .tls_version(TlsVersion::Tls13Only)
            .build_upstream()
            .unwrap();
        assert_eq!(permissive.verification(), TlsVerification::Permissive);
    }

    #[test]
    fn test_load_pem_certs_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(load_pem_certs(file.path()).is_err());
        assert!(load_pem_certs("/nonexistent/roots.pem").is_err());
    }
}
