//! Policy Configuration - File-based and environment-based configuration
//!
//! ```yaml
//! mode: predicate-based          # or always-intercept (default)
//! tls_verification: strict       # or permissive
//! default_decision: intercept
//! tunnel_loopback: true
//! rules:
//!   - pattern: "*.bank.example"
//!     action: tunnel-opaque
//!   - pattern: ads.example
//!     action: reject
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::policy::{
    AlwaysIntercept, HostRule, HostRulesPolicy, InterceptPolicy, InterceptionDecision,
};
use super::tls_config::TlsVerification;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// How CONNECT requests are classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Every well-formed CONNECT is intercepted
    #[default]
    AlwaysIntercept,
    /// Host rules decide, falling back to `default_decision`
    PredicateBased,
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always-intercept" | "always" => Ok(Self::AlwaysIntercept),
            "predicate-based" | "predicate" => Ok(Self::PredicateBased),
            other => Err(format!(
                "unknown policy mode '{}': expected always-intercept or predicate-based",
                other
            )),
        }
    }
}

/// Policy options `{mode, tls_verification}` plus host rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: PolicyMode,

    #[serde(default)]
    pub tls_verification: TlsVerification,

    /// Only used in predicate-based mode
    #[serde(default)]
    pub rules: Vec<HostRule>,

    #[serde(default = "default_decision")]
    pub default_decision: InterceptionDecision,

    #[serde(default = "default_true")]
    pub tunnel_loopback: bool,
}

fn default_decision() -> InterceptionDecision {
    InterceptionDecision::Intercept
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::default(),
            tls_verification: TlsVerification::default(),
            rules: Vec::new(),
            default_decision: default_decision(),
            tunnel_loopback: true,
        }
    }
}

impl PolicyConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MITM_MODE` / `MITM_TLS_VERIFICATION` style overrides
    pub fn apply_overrides(
        &mut self,
        mode: Option<&str>,
        tls_verification: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(mode) = mode {
            self.mode = mode.parse().map_err(ConfigError::ValidationError)?;
        }
        if let Some(verification) = tls_verification {
            self.tls_verification = verification
                .parse()
                .map_err(ConfigError::ValidationError)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            if rule.pattern.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Empty host pattern not allowed".to_string(),
                ));
            }
            if rule.pattern.contains('*') && rule.pattern != "*" && !rule.pattern.starts_with("*.")
            {
                return Err(ConfigError::ValidationError(format!(
                    "Wildcard must be a leading '*.' label: {}",
                    rule.pattern
                )));
            }
        }
        Ok(())
    }

    /// Build the policy this configuration describes
    pub fn build_policy(&self) -> Arc<dyn InterceptPolicy> {
        match self.mode {
            PolicyMode::AlwaysIntercept => {
                if !self.rules.is_empty() {
                    warn!(
                        rules = self.rules.len(),
                        "Host rules are ignored in always-intercept mode"
                    );
                }
                info!(mode = "always-intercept", "Interception policy configured");
                Arc::new(AlwaysIntercept)
            }
            PolicyMode::PredicateBased => {
                info!(
                    mode = "predicate-based",
                    rules = self.rules.len(),
                    default_decision = %self.default_decision,
                    tunnel_loopback = self.tunnel_loopback,
                    "Interception policy configured"
                );
                Arc::new(
                    HostRulesPolicy::new(self.rules.clone(), self.default_decision)
                        .tunnel_loopback(self.tunnel_loopback),
                )
            }
        }
    }
}
