use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::mitm::certificate_authority::CaConfig;
use crate::mitm::interceptor::SessionSettings;
use crate::mitm::policy_config::PolicyConfig;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listener
    pub listen_addr: SocketAddr,

    // Root CA used to sign leaf certificates
    pub ca_cert_path: String,
    pub ca_key_path: String,

    // Interception policy and upstream verification
    pub policy: PolicyConfig,

    /// Extra PEM roots trusted on the destination leg in strict mode
    pub extra_roots_path: Option<String>,

    // Timeouts and limits
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_body_size: usize,

    // Leaf certificate cache
    pub cert_cache_size: usize,
    pub leaf_validity: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let session = SessionSettings::default();
        let ca = CaConfig::default();
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ca_cert_path: "ca.pem".to_string(),
            ca_key_path: "ca-key.pem".to_string(),
            policy: PolicyConfig::default(),
            extra_roots_path: None,
            handshake_timeout: session.handshake_timeout,
            idle_timeout: session.idle_timeout,
            max_body_size: session.max_body_size,
            cert_cache_size: ca.cache_size,
            leaf_validity: ca.leaf_validity,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_addr = lookup("MITM_LISTEN_ADDR")
            .unwrap_or_else(|| defaults.listen_addr.to_string())
            .parse()
            .context("Invalid MITM_LISTEN_ADDR")?;

        let ca_cert_path = lookup("MITM_CA_CERT_PATH").unwrap_or(defaults.ca_cert_path);
        let ca_key_path = lookup("MITM_CA_KEY_PATH").unwrap_or(defaults.ca_key_path);

        // Policy file first, then the two top-level switches override it
        let mut policy = match lookup("MITM_POLICY_FILE") {
            Some(path) => PolicyConfig::from_file(&path)
                .with_context(|| format!("Invalid MITM_POLICY_FILE {}", path))?,
            None => defaults.policy,
        };
        policy
            .apply_overrides(
                lookup("MITM_MODE").as_deref(),
                lookup("MITM_TLS_VERIFICATION").as_deref(),
            )
            .context("Invalid MITM_MODE or MITM_TLS_VERIFICATION")?;

        let extra_roots_path = lookup("MITM_EXTRA_ROOTS").filter(|p| !p.trim().is_empty());

        let handshake_timeout_secs: u64 = lookup("MITM_HANDSHAKE_TIMEOUT_SECS")
            .unwrap_or_else(|| defaults.handshake_timeout.as_secs().to_string())
            .parse()
            .context("Invalid MITM_HANDSHAKE_TIMEOUT_SECS")?;
        let idle_timeout_secs: u64 = lookup("MITM_IDLE_TIMEOUT_SECS")
            .unwrap_or_else(|| defaults.idle_timeout.as_secs().to_string())
            .parse()
            .context("Invalid MITM_IDLE_TIMEOUT_SECS")?;
        let max_body_size = lookup("MITM_MAX_BODY_SIZE")
            .unwrap_or_else(|| defaults.max_body_size.to_string())
            .parse()
            .context("Invalid MITM_MAX_BODY_SIZE")?;

        let cert_cache_size: usize = lookup("MITM_CERT_CACHE_SIZE")
            .unwrap_or_else(|| defaults.cert_cache_size.to_string())
            .parse()
            .context("Invalid MITM_CERT_CACHE_SIZE")?;
        let leaf_validity_days: u64 = lookup("MITM_LEAF_VALIDITY_DAYS")
            .unwrap_or_else(|| (defaults.leaf_validity.as_secs() / 86_400).to_string())
            .parse()
            .context("Invalid MITM_LEAF_VALIDITY_DAYS")?;

        if handshake_timeout_secs == 0 || idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Timeouts must be at least one second"));
        }
        if cert_cache_size == 0 {
            return Err(anyhow::anyhow!("MITM_CERT_CACHE_SIZE must be greater than zero"));
        }
        if leaf_validity_days == 0 {
            return Err(anyhow::anyhow!("MITM_LEAF_VALIDITY_DAYS must be greater than zero"));
        }

        Ok(Self {
            listen_addr,
            ca_cert_path,
            ca_key_path,
            policy,
            extra_roots_path,
            handshake_timeout: Duration::from_secs(handshake_timeout_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            max_body_size,
            cert_cache_size,
            leaf_validity: Duration::from_secs(leaf_validity_days * 86_400),
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
            max_body_size: self.max_body_size,
        }
    }

    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            cache_size: self.cert_cache_size,
            leaf_validity: self.leaf_validity,
        }
    }
}
