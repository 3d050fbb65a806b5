//! Buffered HTTP/1 reader over one leg of an intercepted session
//!
//! Reads are cancel-safe: bytes land in the internal buffer and a message is
//! only consumed once it has been parsed completely, so a `read_*` future
//! dropped inside `tokio::select!` loses nothing.
//!
//! The idle timeout bounds each socket read, not the whole message: a slow
//! body that keeps trickling in never trips it.

use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::http_parser::{
    parse_http1_request, parse_http1_response, HttpRequest, HttpResponse, ParseError, Parsed,
};

const READ_CHUNK: usize = 8 * 1024;

pub struct HttpReader<R> {
    inner: R,
    buf: BytesMut,
    max_body: usize,
    idle: Option<Duration>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> HttpReader<R> {
    pub fn new(inner: R, max_body: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_body,
            idle: None,
            eof: false,
        }
    }

    /// Fail message reads with `TimedOut` when no byte arrives for `idle`
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Start with bytes that were already read off the stream
    pub fn with_prefix(inner: R, prefix: &[u8], max_body: usize) -> Self {
        let mut reader = Self::new(inner, max_body);
        reader.buf.extend_from_slice(prefix);
        reader
    }

    /// Next request, or `None` on a clean close between messages
    pub async fn read_request(&mut self) -> Result<Option<HttpRequest>, ParseError> {
        let mut need = 1;
        loop {
            if self.buf.len() >= need {
                match parse_http1_request(&self.buf, self.max_body)? {
                    Parsed::Complete(mut request, len) => {
                        let wire = self.buf.split_to(len).freeze();
                        request.attach_wire(wire);
                        return Ok(Some(request));
                    }
                    Parsed::Partial { need: more } => need = more,
                }
            }
            if self.eof {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ParseError::Incomplete)
                };
            }
            self.fill(true).await?;
        }
    }

    /// Next response to a request made with `request_method`
    pub async fn read_response(
        &mut self,
        request_method: &str,
    ) -> Result<Option<HttpResponse>, ParseError> {
        let head_only = request_method.eq_ignore_ascii_case("HEAD");
        let mut need = 1;
        loop {
            if self.buf.len() >= need || self.eof {
                match parse_http1_response(&self.buf, head_only, self.eof, self.max_body)? {
                    Parsed::Complete(mut response, len) => {
                        let wire = self.buf.split_to(len).freeze();
                        response.attach_wire(wire);
                        return Ok(Some(response));
                    }
                    Parsed::Partial { need: more } => {
                        if self.eof {
                            return if self.buf.is_empty() {
                                Ok(None)
                            } else {
                                Err(ParseError::Incomplete)
                            };
                        }
                        need = more;
                    }
                }
            }
            self.fill(true).await?;
        }
    }

    /// Read whatever is available into the buffer; returns the byte count,
    /// zero once the peer has closed
    ///
    /// Not bounded by the idle timeout: a client may sit quietly while its
    /// request is being answered.
    pub async fn read_more(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.fill(false).await
    }

    async fn fill(&mut self, timed: bool) -> io::Result<usize> {
        if self.buf.capacity() - self.buf.len() < READ_CHUNK / 2 {
            self.buf.reserve(READ_CHUNK);
        }
        let read = self.inner.read_buf(&mut self.buf);
        let n = match self.idle.filter(|_| timed) {
            Some(idle) => tokio::time::timeout(idle, read).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "no data within idle timeout")
            })??,
            None => read.await?,
        };
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Bytes read but not yet consumed as a message
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Give back the stream plus any unconsumed bytes
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}
