//! Certificate Authority - per-host leaf certificates for MITM
//!
//! Leaves are signed by a root loaded from PEM and cached per host. The
//! first caller for an uncached host signs; concurrent callers for the same
//! host wait on that one signing. A failed signing goes back to the caller
//! and leaves nothing behind, so the next request starts from scratch.

use lru::LruCache;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::error::{MitmError, Result};
use super::tls_config::{SniUtils, TlsConfigBuilder};

/// Records this close to expiry are treated as expired
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from a CONNECT host; IPv6 literals may keep their brackets
    pub fn from_hostname(hostname: &str) -> Result<Self> {
        let trimmed = hostname
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']');

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::IpAddress(ip));
        }

        let domain = trimmed.to_ascii_lowercase();
        if !SniUtils::validate_hostname(&domain) {
            return Err(MitmError::InvalidHost(hostname.to_string()));
        }
        Ok(Self::Domain(domain))
    }

    /// localhost, 127.0.0.0/8 or ::1
    pub fn is_loopback(&self) -> bool {
        match self {
            Self::Domain(domain) => domain == "localhost" || domain.ends_with(".localhost"),
            Self::IpAddress(ip) => ip.is_loopback(),
        }
    }
}

impl fmt::Display for HostIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(domain) => f.write_str(domain),
            Self::IpAddress(ip) => write!(f, "{}", ip),
        }
    }
}

/// Output of a [`LeafSigner`]
pub struct SignedLeaf {
    /// Leaf first, then any intermediates
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivatePkcs8KeyDer<'static>,
    pub not_after: SystemTime,
}

/// Signs leaf certificates for intercepted hosts
///
/// Runs on the blocking pool; implementations may do CPU-heavy or blocking
/// work.
pub trait LeafSigner: Send + Sync + 'static {
    fn sign_leaf(&self, host: &HostIdentifier, validity: Duration) -> Result<SignedLeaf>;
}

/// Signs leaves with a root certificate and key loaded from PEM
pub struct RootSigner {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
}

impl RootSigner {
    /// Load the root from PEM text
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;

        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(MitmError::ca_load(
                "certificate is not a CA (basicConstraints CA:TRUE required)",
            ));
        }

        // Issuer name and key come from the loaded root; the re-signed
        // certificate is only used as the issuer handle for rcgen.
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_load(format!("Failed to rebuild CA certificate: {}", e)))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Load the root from a certificate file and a key file
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        info!(cert_path = %cert_path.display(), key_path = %key_path.display(), "Loading CA");

        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            MitmError::ca_load(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            MitmError::ca_load(format!("Failed to read {}: {}", key_path.display(), e))
        })?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Root certificate PEM as loaded (for client installation)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Unique serial number from crypto RNG + timestamp
    fn generate_serial_number() -> u64 {
        use rand::Rng;
        let random_part: u32 = rand::thread_rng().gen();
        let timestamp_part = chrono::Utc::now().timestamp() as u32;

        ((timestamp_part as u64) << 32) | (random_part as u64)
    }
}

impl LeafSigner for RootSigner {
    fn sign_leaf(&self, host: &HostIdentifier, validity: Duration) -> Result<SignedLeaf> {
        let name = host.to_string();
        let mut params = CertificateParams::default();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, name.clone());
        params.distinguished_name = distinguished_name;

        params.subject_alt_names = match host {
            HostIdentifier::Domain(domain) => {
                let dns = Ia5String::try_from(domain.clone())
                    .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;
                vec![SanType::DnsName(dns)]
            }
            HostIdentifier::IpAddress(ip) => vec![SanType::IpAddress(*ip)],
        };

        // Backdate a day for client clock skew
        let validity = time::Duration::try_from(validity)
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;
        let now = OffsetDateTime::now_utc();
        let not_after = now + validity;
        params.not_before = now - time::Duration::days(1);
        params.not_after = not_after;

        params.serial_number = Some(SerialNumber::from(Self::generate_serial_number()));
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;

        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| {
                MitmError::cert_generation(&name, format!("Failed to sign certificate: {}", e))
            })?;

        Ok(SignedLeaf {
            cert_chain: vec![cert.der().clone()],
            private_key: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
            not_after: SystemTime::from(not_after),
        })
    }
}

/// A signed leaf ready to serve, shared read-only by sessions
pub struct CertificateRecord {
    pub host: String,
    pub cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivatePkcs8KeyDer<'static>,
    pub not_after: SystemTime,
    server_config: Arc<ServerConfig>,
}

impl CertificateRecord {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() + EXPIRY_MARGIN >= self.not_after
    }

    /// Client-facing rustls config presenting this leaf
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("host", &self.host)
            .field("chain_len", &self.cert_chain.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// CA adapter configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Maximum number of cached hosts
    pub cache_size: usize,

    /// Leaf validity measured from signing time
    pub leaf_validity: Duration,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            leaf_validity: Duration::from_secs(90 * 24 * 60 * 60),
        }
    }
}

/// Certificate cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Hosts holding a live record
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Signing attempts, successful or not
    pub signings: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type Slot = Arc<OnceCell<Arc<CertificateRecord>>>;

/// Certificate Authority adapter - signs and caches leaves per host
pub struct CertificateAuthority {
    signer: Arc<dyn LeafSigner>,

    /// host -> once-cell; an empty cell means signing is in flight or failed
    cache: Mutex<LruCache<String, Slot>>,

    config: CaConfig,

    tls: TlsConfigBuilder,

    hits: AtomicU64,
    misses: AtomicU64,
    signings: AtomicU64,
}

impl CertificateAuthority {
    pub fn new(signer: Arc<dyn LeafSigner>, config: CaConfig) -> Self {
        Self::with_tls(signer, config, TlsConfigBuilder::new())
    }

    /// Use `tls` when building the client-facing server configs
    pub fn with_tls(signer: Arc<dyn LeafSigner>, config: CaConfig, tls: TlsConfigBuilder) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            signer,
            cache: Mutex::new(LruCache::new(capacity)),
            config,
            tls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            signings: AtomicU64::new(0),
        }
    }

    /// The lock only guards lookups and inserts; signing runs outside it
    fn slots(&self) -> MutexGuard<'_, LruCache<String, Slot>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leaf for `host`, signing one if absent or expired
    pub async fn certificate_for(&self, host: &str) -> Result<Arc<CertificateRecord>> {
        let ident = HostIdentifier::from_hostname(host)?;
        let key = ident.to_string();

        let slot = {
            let mut cache = self.slots();
            let existing = cache.get(&key).cloned();
            match existing {
                Some(slot) if slot.get().map_or(true, |record| !record.is_expired()) => slot,
                stale => {
                    if stale.is_some() {
                        debug!(host = %key, "Certificate cache hit but expired, regenerating");
                    }
                    let fresh: Slot = Arc::new(OnceCell::new());
                    cache.put(key.clone(), Arc::clone(&fresh));
                    fresh
                }
            }
        };

        if let Some(record) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(host = %key, "Certificate cache hit");
            return Ok(Arc::clone(record));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let record = slot.get_or_try_init(|| self.sign(ident)).await?;
        Ok(Arc::clone(record))
    }

    async fn sign(&self, ident: HostIdentifier) -> Result<Arc<CertificateRecord>> {
        self.signings.fetch_add(1, Ordering::Relaxed);
        let host = ident.to_string();
        debug!(host = %host, "Generating new certificate");

        let signer = Arc::clone(&self.signer);
        let validity = self.config.leaf_validity;
        let leaf = tokio::task::spawn_blocking(move || signer.sign_leaf(&ident, validity))
            .await
            .map_err(|e| MitmError::cert_generation(&host, format!("signing task failed: {}", e)))??;

        let server_config = self
            .tls
            .build_client_facing(
                leaf.cert_chain.clone(),
                PrivateKeyDer::Pkcs8(leaf.private_key.clone_key()),
            )
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?
            .server_config();

        info!(host = %host, "Certificate generated and cached");

        Ok(Arc::new(CertificateRecord {
            host,
            cert_chain: leaf.cert_chain,
            private_key: leaf.private_key,
            not_after: leaf.not_after,
            server_config,
        }))
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.slots();
        let size = cache
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|record| !record.is_expired()))
            .count();

        CacheStats {
            size,
            capacity: cache.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            signings: self.signings.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached leaf
    pub async fn clear_cache(&self) {
        self.slots().clear();
    }
}
