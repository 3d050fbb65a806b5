//! HTTP handler chain run on every intercepted exchange
//!
//! Handlers execute in registration order. The first short-circuit or
//! termination stops the chain; a request-side short-circuit also skips the
//! response handlers. Errors and panics are contained here and turned into a
//! synthesized `502 Bad Gateway`.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::error::ProxyError;
use super::http_parser::{HttpRequest, HttpResponse};

/// Handler failure; contained by the chain
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Which intercepted session an exchange belongs to
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub session_id: u64,
    /// Host from the CONNECT authority
    pub host: String,
    pub port: u16,
}

/// Result of a request handler
#[derive(Debug)]
pub enum RequestOutcome {
    /// Pass the (possibly modified) request to the next handler
    Continue(HttpRequest),
    /// Answer the client directly; the destination never sees the request
    ShortCircuit(HttpResponse),
    /// Close the session without answering
    Terminate,
}

/// Result of a response handler
#[derive(Debug)]
pub enum ResponseOutcome {
    /// Pass the (possibly modified) response to the next handler
    Continue(HttpResponse),
    /// Send this response and skip the remaining handlers
    ShortCircuit(HttpResponse),
    /// Close the session without answering
    Terminate,
}

/// Hook into intercepted HTTP/1 traffic
#[async_trait]
pub trait HttpHandler: Send + Sync {
    /// Label used in logs
    fn name(&self) -> &str {
        "handler"
    }

    async fn on_request(
        &self,
        _ctx: &HandlerContext,
        request: HttpRequest,
    ) -> Result<RequestOutcome, HandlerError> {
        Ok(RequestOutcome::Continue(request))
    }

    async fn on_response(
        &self,
        _ctx: &HandlerContext,
        _request: &HttpRequest,
        response: HttpResponse,
    ) -> Result<ResponseOutcome, HandlerError> {
        Ok(ResponseOutcome::Continue(response))
    }
}

/// What the session does with a request after the chain ran
#[derive(Debug)]
pub enum RequestVerdict {
    Forward(HttpRequest),
    /// Write `response` to the client instead of forwarding; `fault` is set
    /// when the response was synthesized for a failing handler
    Respond {
        response: HttpResponse,
        fault: Option<ProxyError>,
    },
    Terminate,
}

/// What the session does with a response after the chain ran
#[derive(Debug)]
pub enum ResponseVerdict {
    Send {
        response: HttpResponse,
        fault: Option<ProxyError>,
    },
    Terminate,
}

/// Ordered handler list shared by every session
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn HttpHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.push(handler);
        self
    }

    pub fn push(&mut self, handler: Arc<dyn HttpHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run request handlers in order
    pub async fn run_request(&self, ctx: &HandlerContext, mut request: HttpRequest) -> RequestVerdict {
        for handler in &self.handlers {
            let result = AssertUnwindSafe(handler.on_request(ctx, request))
                .catch_unwind()
                .await;

            request = match flatten(result) {
                Ok(RequestOutcome::Continue(next)) => next,
                Ok(RequestOutcome::ShortCircuit(response)) => {
                    debug!(
                        session_id = ctx.session_id,
                        target_host = %ctx.host,
                        handler = handler.name(),
                        status = response.status_code,
                        "Request short-circuited"
                    );
                    return RequestVerdict::Respond {
                        response,
                        fault: None,
                    };
                }
                Ok(RequestOutcome::Terminate) => {
                    debug!(
                        session_id = ctx.session_id,
                        handler = handler.name(),
                        "Request handler terminated session"
                    );
                    return RequestVerdict::Terminate;
                }
                Err(fault) => {
                    warn!(
                        session_id = ctx.session_id,
                        target_host = %ctx.host,
                        handler = handler.name(),
                        error = %fault,
                        "Request handler failed"
                    );
                    return RequestVerdict::Respond {
                        response: HttpResponse::bad_gateway("request handler failed"),
                        fault: Some(ProxyError::HandlerFault(format!(
                            "{}: {}",
                            handler.name(),
                            fault
                        ))),
                    };
                }
            };
        }
        RequestVerdict::Forward(request)
    }

    /// Run response handlers in order
    pub async fn run_response(
        &self,
        ctx: &HandlerContext,
        request: &HttpRequest,
        mut response: HttpResponse,
    ) -> ResponseVerdict {
        for handler in &self.handlers {
            let result = AssertUnwindSafe(handler.on_response(ctx, request, response))
                .catch_unwind()
                .await;

            response = match flatten(result) {
                Ok(ResponseOutcome::Continue(next)) => next,
                Ok(ResponseOutcome::ShortCircuit(replacement)) => {
                    return ResponseVerdict::Send {
                        response: replacement,
                        fault: None,
                    };
                }
                Ok(ResponseOutcome::Terminate) => return ResponseVerdict::Terminate,
                Err(fault) => {
                    warn!(
                        session_id = ctx.session_id,
                        target_host = %ctx.host,
                        handler = handler.name(),
                        error = %fault,
                        "Response handler failed"
                    );
                    return ResponseVerdict::Send {
                        response: HttpResponse::bad_gateway("response handler failed"),
                        fault: Some(ProxyError::HandlerFault(format!(
                            "{}: {}",
                            handler.name(),
                            fault
                        ))),
                    };
                }
            };
        }
        ResponseVerdict::Send {
            response,
            fault: None,
        }
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

fn flatten<T>(
    result: Result<Result<T, HandlerError>, Box<dyn Any + Send>>,
) -> Result<T, String> {
    match result {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
