//! Session events - the observability hook for tunnels and intercepted sessions
//!
//! Every connection reports its lifecycle through an [`EventSink`]. The
//! default [`TracingEventSink`] turns events into structured `tracing`
//! records; peer closure is logged at debug level, never as a fault.

use std::net::SocketAddr;
use tracing::{debug, info, warn};

use super::error::{Leg, ProxyError};
use super::policy::InterceptionDecision;

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean end of stream from one leg
    PeerClosed(Leg),
    /// `Connection: close` or a close-delimited body
    ConnectionClose,
    /// A handler asked for termination
    HandlerTerminated,
    /// Idle or handshake timeout
    TimedOut,
    /// Relay finished after an opaque tunnel or protocol switch
    RelayFinished,
    /// Tunnel refused before it was established
    Rejected(u16),
    /// Session aborted by an error
    Failed(String),
}

/// Lifecycle event of one client connection
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Accepted {
        session_id: u64,
        peer: Option<SocketAddr>,
    },
    Decision {
        session_id: u64,
        target: String,
        decision: InterceptionDecision,
    },
    HandshakeOk {
        session_id: u64,
        leg: Leg,
        host: String,
    },
    HandshakeFailed {
        session_id: u64,
        leg: Leg,
        host: String,
        error: String,
    },
    RequestDecoded {
        session_id: u64,
        method: String,
        path: String,
    },
    ShortCircuited {
        session_id: u64,
        status: u16,
    },
    HandlerFault {
        session_id: u64,
        error: String,
    },
    Closed {
        session_id: u64,
        reason: CloseReason,
        exchanges: u64,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::Accepted { session_id, .. }
            | SessionEvent::Decision { session_id, .. }
            | SessionEvent::HandshakeOk { session_id, .. }
            | SessionEvent::HandshakeFailed { session_id, .. }
            | SessionEvent::RequestDecoded { session_id, .. }
            | SessionEvent::ShortCircuited { session_id, .. }
            | SessionEvent::HandlerFault { session_id, .. }
            | SessionEvent::Closed { session_id, .. } => *session_id,
        }
    }
}

impl CloseReason {
    /// Map the error that ended a session
    pub fn from_error(err: &ProxyError) -> Self {
        match err {
            ProxyError::TransportClosed { leg } => CloseReason::PeerClosed(*leg),
            ProxyError::Timeout { .. } => CloseReason::TimedOut,
            other => CloseReason::Failed(other.to_string()),
        }
    }
}

/// Receives session events; must not block
pub trait EventSink: Send + Sync {
    fn record(&self, event: SessionEvent);
}

/// Logs events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: SessionEvent) {
        match event {
            SessionEvent::Accepted { session_id, peer } => {
                debug!(session_id, peer = ?peer, "Connection accepted");
            }
            SessionEvent::Decision {
                session_id,
                target,
                decision,
            } => {
                info!(session_id, target = %target, decision = %decision, "CONNECT classified");
            }
            SessionEvent::HandshakeOk {
                session_id,
                leg,
                host,
            } => {
                debug!(session_id, leg = %leg, target_host = %host, "TLS handshake successful");
            }
            SessionEvent::HandshakeFailed {
                session_id,
                leg,
                host,
                error,
            } => {
                warn!(
                    session_id,
                    leg = %leg,
                    target_host = %host,
                    error = %error,
                    "TLS handshake failed"
                );
            }
            SessionEvent::RequestDecoded {
                session_id,
                method,
                path,
            } => {
                debug!(session_id, method = %method, path = %path, "Request decoded");
            }
            SessionEvent::ShortCircuited { session_id, status } => {
                info!(session_id, status, "Request short-circuited by handler");
            }
            SessionEvent::HandlerFault { session_id, error } => {
                warn!(session_id, error = %error, "Handler fault contained");
            }
            SessionEvent::Closed {
                session_id,
                reason,
                exchanges,
            } => match reason {
                CloseReason::Failed(error) => {
                    warn!(session_id, exchanges, error = %error, "Session aborted");
                }
                reason => {
                    debug!(session_id, exchanges, reason = ?reason, "Session closed");
                }
            },
        }
    }
}

/// Sends each event to several sinks
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn record(&self, event: SessionEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}
