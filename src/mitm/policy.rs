//! Interception Decision Policy
//!
//! Each CONNECT gets exactly one decision: intercept it, tunnel it opaquely,
//! or reject it. Policies are synchronous and never touch the network, so
//! one instance is shared by every connection.
//!
//! A CONNECT whose authority is not a valid `host:port` is rejected by
//! [`decide`] before the configured policy is consulted.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::certificate_authority::HostIdentifier;
use super::connect::{ConnectRequest, ConnectTarget};

/// What to do with one CONNECT request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterceptionDecision {
    /// Terminate TLS on both legs and run the handler chain
    Intercept,
    /// Relay bytes without looking at them
    TunnelOpaque,
    /// Refuse the tunnel with an error status
    Reject,
}

impl fmt::Display for InterceptionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intercept => write!(f, "intercept"),
            Self::TunnelOpaque => write!(f, "tunnel-opaque"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Decides how a well-formed CONNECT is handled
pub trait InterceptPolicy: Send + Sync {
    fn decide(&self, target: &ConnectTarget, request: &ConnectRequest) -> InterceptionDecision;

    /// Short label for logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Run `policy` for `request`; malformed requests never reach it
pub fn decide(policy: &dyn InterceptPolicy, request: &ConnectRequest) -> InterceptionDecision {
    match &request.target {
        Some(target) if request.is_connect() => {
            let decision = policy.decide(target, request);
            debug!(
                target = %target,
                policy = policy.name(),
                decision = %decision,
                "Interception decision"
            );
            decision
        }
        _ => {
            debug!(
                request_line = %request.raw_header_line,
                "Malformed CONNECT, rejecting without consulting policy"
            );
            InterceptionDecision::Reject
        }
    }
}

/// Intercept everything (the default)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysIntercept;

impl InterceptPolicy for AlwaysIntercept {
    fn decide(&self, _target: &ConnectTarget, _request: &ConnectRequest) -> InterceptionDecision {
        InterceptionDecision::Intercept
    }

    fn name(&self) -> &'static str {
        "always-intercept"
    }
}

/// Policy backed by a closure over the target
pub struct PredicatePolicy<F> {
    predicate: F,
}

impl<F> PredicatePolicy<F>
where
    F: Fn(&ConnectTarget) -> InterceptionDecision + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> InterceptPolicy for PredicatePolicy<F>
where
    F: Fn(&ConnectTarget) -> InterceptionDecision + Send + Sync,
{
    fn decide(&self, target: &ConnectTarget, _request: &ConnectRequest) -> InterceptionDecision {
        (self.predicate)(target)
    }

    fn name(&self) -> &'static str {
        "predicate"
    }
}

/// Host pattern with the decision it maps to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    /// Exact host, `*.suffix` wildcard, or `*`
    pub pattern: String,

    pub action: InterceptionDecision,

    #[serde(default)]
    pub description: Option<String>,
}

impl HostRule {
    pub fn new(pattern: impl Into<String>, action: InterceptionDecision) -> Self {
        Self {
            pattern: pattern.into(),
            action,
            description: None,
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        matches_wildcard(&self.pattern, host)
    }
}

/// Check if `host` matches `pattern` (exact or `*.domain`)
pub fn matches_wildcard(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if pattern == "*" {
        return true;
    }
    if let Some(domain) = pattern.strip_prefix("*.") {
        host == domain || host.ends_with(&format!(".{}", domain))
    } else {
        pattern == host
    }
}

/// Ordered host rules; first match wins, otherwise `fallback`
#[derive(Debug, Clone)]
pub struct HostRulesPolicy {
    rules: Vec<HostRule>,
    fallback: InterceptionDecision,
    tunnel_loopback: bool,
}

impl HostRulesPolicy {
    pub fn new(rules: Vec<HostRule>, fallback: InterceptionDecision) -> Self {
        Self {
            rules,
            fallback,
            tunnel_loopback: true,
        }
    }

    /// Tunnel loopback targets instead of intercepting them (default: on)
    pub fn tunnel_loopback(mut self, enabled: bool) -> Self {
        self.tunnel_loopback = enabled;
        self
    }

    pub fn rules(&self) -> &[HostRule] {
        &self.rules
    }
}

impl InterceptPolicy for HostRulesPolicy {
    fn decide(&self, target: &ConnectTarget, _request: &ConnectRequest) -> InterceptionDecision {
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(&target.host)) {
            return rule.action;
        }

        if self.tunnel_loopback {
            let loopback = HostIdentifier::from_hostname(&target.host)
                .map(|host| host.is_loopback())
                .unwrap_or(false);
            if loopback && self.fallback == InterceptionDecision::Intercept {
                return InterceptionDecision::TunnelOpaque;
            }
        }

        self.fallback
    }

    fn name(&self) -> &'static str {
        "host-rules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::connect::ConnectRequest;

    fn connect(authority: &str) -> ConnectRequest {
        let head = format!("CONNECT {} HTTP/1.1\r\n\r\n", authority);
        ConnectRequest::parse(head.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn test_always_intercept_any_valid_target() {
        for authority in ["example.com:443", "10.1.2.3:8443", "[::1]:443", "localhost:1"] {
            assert_eq!(
                decide(&AlwaysIntercept, &connect(authority)),
                InterceptionDecision::Intercept,
                "{}",
                authority
            );
        }
    }

    #[test]
    fn test_malformed_connect_rejected_without_predicate() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = AtomicUsize::new(0);
        let policy = PredicatePolicy::new(|_t: &ConnectTarget| {
            calls.fetch_add(1, Ordering::SeqCst);
            InterceptionDecision::Intercept
        });

        for authority in ["example.com", "example.com:0", ":443", "host:port"] {
            assert_eq!(
                decide(&policy, &connect(authority)),
                InterceptionDecision::Reject
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            decide(&policy, &connect("example.com:443")),
            InterceptionDecision::Intercept
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_connect_rejected() {
        let head = b"GET http://example.com/ HTTP/1.1\r\n\r\n";
        let (request, _) = ConnectRequest::parse(head).unwrap().unwrap();
        assert_eq!(
            decide(&AlwaysIntercept, &request),
            InterceptionDecision::Reject
        );
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches_wildcard("*.example.com", "api.example.com"));
        assert!(matches_wildcard("*.example.com", "a.b.example.com"));
        assert!(matches_wildcard("*.example.com", "example.com"));
        assert!(!matches_wildcard("*.example.com", "badexample.com"));
        assert!(matches_wildcard("Example.com", "example.COM"));
        assert!(!matches_wildcard("example.com", "api.example.com"));
        assert!(matches_wildcard("*", "anything"));
    }

    #[test]
    fn test_host_rules_first_match_wins() {
        let policy = HostRulesPolicy::new(
            vec![
                HostRule::new("blocked.example.com", InterceptionDecision::Reject),
                HostRule::new("*.example.com", InterceptionDecision::TunnelOpaque),
            ],
            InterceptionDecision::Intercept,
        );

        assert_eq!(
            decide(&policy, &connect("blocked.example.com:443")),
            InterceptionDecision::Reject
        );
        assert_eq!(
            decide(&policy, &connect("bank.example.com:443")),
            InterceptionDecision::TunnelOpaque
        );
        assert_eq!(
            decide(&policy, &connect("other.org:443")),
            InterceptionDecision::Intercept
        );
    }

    #[test]
    fn test_loopback_tunneled_unless_disabled() {
        let policy = HostRulesPolicy::new(Vec::new(), InterceptionDecision::Intercept);
        assert_eq!(
            decide(&policy, &connect("127.0.0.1:8080")),
            InterceptionDecision::TunnelOpaque
        );
        assert_eq!(
            decide(&policy, &connect("localhost:8080")),
            InterceptionDecision::TunnelOpaque
        );

        let policy = policy.tunnel_loopback(false);
        assert_eq!(
            decide(&policy, &connect("127.0.0.1:8080")),
            InterceptionDecision::Intercept
        );
    }

    #[test]
    fn test_decision_serde_names() {
        let decision: InterceptionDecision = serde_yaml::from_str("tunnel-opaque").unwrap();
        assert_eq!(decision, InterceptionDecision::TunnelOpaque);
        assert_eq!(InterceptionDecision::Reject.to_string(), "reject");
    }
}
