//! CONNECT tunnel: request parsing and ownership of the client socket
//!
//! A [`ConnectionTunnel`] is created once the CONNECT head has been read. It
//! owns the raw client stream until the session (intercepted or opaque)
//! consumes it. Bytes the client sent eagerly after the head are kept and
//! replayed ahead of the socket by [`Rewind`].

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::error::{Leg, ProxyError, TimeoutStage};
use super::http_parser::{Headers, MAX_HEADERS, MAX_HEAD_SIZE};

/// Destination named by a CONNECT authority
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `host:port` from a CONNECT authority
pub fn parse_authority(authority: &str) -> Result<ConnectTarget, String> {
    // Split by last colon to handle IPv6 addresses like [::1]:443
    let parts: Vec<&str> = authority.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err("Authority must be in host:port format".to_string());
    }

    let port_str = parts[0];
    let mut host = parts[1];

    if let Some(inner) = host.strip_prefix('[') {
        host = inner
            .strip_suffix(']')
            .ok_or_else(|| "Unterminated IPv6 literal".to_string())?;
    } else if host.contains(':') {
        return Err("IPv6 hosts must be bracketed".to_string());
    }

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let port: u16 = port_str.parse().map_err(|_| {
        format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port_str
        )
    })?;

    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

/// First request read off a client connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub method: String,

    /// Request target as sent (`host:port` for CONNECT)
    pub authority: String,

    /// `None` when the authority is not a valid `host:port`
    pub target: Option<ConnectTarget>,

    /// Request line without CRLF
    pub raw_header_line: String,

    pub headers: Headers,
}

impl ConnectRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn target_host(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.host.as_str())
    }

    /// Parse a complete head; returns the request and the head length
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ProxyError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::MalformedConnect(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::MalformedConnect("missing method".to_string()))?
            .to_string();
        let authority = req
            .path
            .ok_or_else(|| ProxyError::MalformedConnect("missing request target".to_string()))?
            .to_string();

        let mut headers = Headers::new();
        for header in req.headers.iter() {
            headers.append_bytes(header.name, Bytes::copy_from_slice(header.value));
        }

        let line_end = buf
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(head_len);
        let raw_header_line = String::from_utf8_lossy(&buf[..line_end])
            .trim_end()
            .to_string();

        let target = if method.eq_ignore_ascii_case("CONNECT") {
            parse_authority(&authority).ok()
        } else {
            None
        };

        Ok(Some((
            Self {
                method,
                authority,
                target,
                raw_header_line,
                headers,
            },
            head_len,
        )))
    }

    /// Read one request head; returns it plus any bytes read past the head
    pub async fn read_from<S>(stream: &mut S) -> Result<(Self, Bytes), ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| ProxyError::from_io(Leg::Client, e))?;

            if n == 0 {
                if buf.is_empty() {
                    return Err(ProxyError::TransportClosed { leg: Leg::Client });
                }
                return Err(ProxyError::MalformedConnect(
                    "connection closed inside request head".to_string(),
                ));
            }

            if let Some((request, head_len)) = Self::parse(&buf)? {
                let leftover = buf.split_off(head_len).freeze();
                return Ok((request, leftover));
            }

            if buf.len() >= MAX_HEAD_SIZE {
                return Err(ProxyError::MalformedConnect(format!(
                    "request head exceeds {} bytes",
                    MAX_HEAD_SIZE
                )));
            }
        }
    }
}

/// Stream that yields `prefix` before reading from the inner stream
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Accepted CONNECT request plus the client connection it arrived on
pub struct ConnectionTunnel<S> {
    request: ConnectRequest,
    stream: Rewind<S>,
}

impl<S> ConnectionTunnel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the request head off `stream` within `head_timeout`
    ///
    /// An unparseable head is answered with `400 Bad Request` before the
    /// error is returned.
    pub async fn accept(mut stream: S, head_timeout: Duration) -> Result<Self, ProxyError> {
        let read = tokio::time::timeout(head_timeout, ConnectRequest::read_from(&mut stream)).await;
        let (request, leftover) = match read {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(err @ ProxyError::MalformedConnect(_))) => {
                let (status, reason) = err.tunnel_status();
                let _ = write_status(&mut stream, status, reason).await;
                return Err(err);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(ProxyError::Timeout {
                    stage: TimeoutStage::ConnectHead,
                    after: head_timeout,
                })
            }
        };

        Ok(Self {
            request,
            stream: Rewind::new(stream, leftover),
        })
    }

    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Tell the client the tunnel is open
    pub async fn establish(&mut self) -> io::Result<()> {
        self.stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        self.stream.flush().await
    }

    /// Answer with an error status and close the tunnel
    pub async fn reject(mut self, status: u16, reason: &str) -> io::Result<()> {
        write_status(&mut self.stream, status, reason).await
    }

    pub fn into_parts(self) -> (ConnectRequest, Rewind<S>) {
        (self.request, self.stream)
    }
}

async fn write_status<S>(stream: &mut S, status: u16, reason: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
