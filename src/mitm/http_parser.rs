//! HTTP/1.1 message model for MITM inspection
//!
//! Requests and responses decoded off a TLS leg keep the exact bytes they
//! came from. A message nobody touched is written back verbatim; once a
//! handler changes anything it is re-encoded and its framing recomputed
//! (`Content-Length` rewritten, chunked bodies re-chunked).

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of headers in one message head
pub const MAX_HEADERS: usize = 128;

/// Maximum size of a message head (request/status line plus headers)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_CHUNK_LINE: usize = 4096;

/// HTTP parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid HTTP format")]
    InvalidFormat,

    #[error("Incomplete HTTP message")]
    Incomplete,

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    #[error("Header parse error: {0}")]
    InvalidHeader(String),

    #[error("Message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("Body too large: {current} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { current: usize, limit: usize },

    #[error("Invalid chunked encoding: {0}")]
    InvalidChunk(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::Status => ParseError::InvalidStatusCode(e.to_string()),
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::TooManyHeaders => ParseError::InvalidHeader(e.to_string()),
            _ => ParseError::InvalidFormat,
        }
    }
}

/// Ordered, case-preserving header list with case-insensitive lookup
///
/// Values are kept as raw bytes: obs-text (non-UTF-8 octets) is legal on
/// the wire and must survive a round trip. The `&str` accessors skip such
/// values; `get_bytes` sees everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_raw(raw: &[httparse::Header<'_>]) -> Self {
        let entries = raw
            .iter()
            .map(|h| (h.name.to_string(), Bytes::copy_from_slice(h.value)))
            .collect();
        Self { entries }
    }

    /// First value for `name`, if it is valid UTF-8
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_bytes(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// First value for `name` as raw bytes
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Every UTF-8 value for `name`, in wire order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value: String = value.into();
        self.append_bytes(name, Bytes::from(value));
    }

    pub fn append_bytes(&mut self, name: impl Into<String>, value: Bytes) {
        self.entries.push((name.into(), value));
    }

    /// Replace the first `name` in place and drop any repeats; append if absent
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value: String = value.into();
        let value = Bytes::from(value);
        match self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(idx) => {
                self.entries[idx].1 = value;
                let mut seen = 0usize;
                self.entries.retain(|(k, _)| {
                    if k.eq_ignore_ascii_case(&name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove every `name`; returns whether anything was removed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a comma-separated header such as `Connection` lists `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .last()
            .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    fn content_length(&self) -> Result<Option<usize>, ParseError> {
        let mut found: Option<usize> = None;
        let raw = self
            .entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        let mut values = Vec::new();
        for (_, value) in raw {
            let value = std::str::from_utf8(value)
                .map_err(|_| ParseError::InvalidHeader("non-ASCII Content-Length".to_string()))?;
            values.extend(value.split(','));
        }
        for value in values {
            let len: usize = value
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidHeader(format!("Content-Length: {}", value)))?;
            match found {
                Some(prev) if prev != len => {
                    return Err(ParseError::InvalidHeader(
                        "conflicting Content-Length values".to_string(),
                    ))
                }
                _ => found = Some(len),
            }
        }
        Ok(found)
    }

    fn write_to(&self, out: &mut BytesMut) {
        for (name, value) in &self.entries {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
    }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    ContentLength(usize),
    Chunked,
    /// Response body runs until the destination closes
    CloseDelimited,
}

/// Bytes a message was decoded from plus a snapshot to detect edits
#[derive(Debug)]
struct Original<T> {
    bytes: Bytes,
    message: T,
}

/// Parsed HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,

    /// Request target (/path?query)
    pub path: String,

    /// HTTP version (HTTP/1.1, HTTP/1.0)
    pub version: String,

    pub headers: Headers,

    /// Decoded body (chunked bodies are de-chunked)
    pub body: Bytes,

    original: Option<Arc<Original<HttpRequest>>>,
}

/// Parsed HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,

    /// Status code (200, 404, etc.)
    pub status_code: u16,

    /// Reason phrase (OK, Not Found, etc.)
    pub reason: String,

    pub headers: Headers,

    pub body: Bytes,

    /// Answer to a HEAD request: never carries a body
    head_only: bool,

    original: Option<Arc<Original<HttpResponse>>>,
}

/// Outcome of a parse attempt over buffered bytes
#[derive(Debug)]
pub enum Parsed<T> {
    /// A full message and the number of bytes it occupied
    Complete(T, usize),
    /// More input needed; try again once the buffer holds `need` bytes
    Partial { need: usize },
}

enum BodyStatus {
    Complete { body: Bytes, end: usize },
    Partial { need: usize },
}

/// Parse one HTTP/1.x request from the front of `buf`
pub fn parse_http1_request(buf: &[u8], max_body: usize) -> Result<Parsed<HttpRequest>, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return partial_head(buf),
    };

    let mut request = HttpRequest {
        method: req.method.ok_or(ParseError::InvalidFormat)?.to_string(),
        path: req.path.ok_or(ParseError::InvalidFormat)?.to_string(),
        version: version_string(req.version),
        headers: Headers::from_raw(req.headers),
        body: Bytes::new(),
        original: None,
    };

    let framing = request.framing()?;
    match decode_body(buf, head_len, framing, false, max_body)? {
        BodyStatus::Complete { body, end } => {
            request.body = body;
            Ok(Parsed::Complete(request, end))
        }
        BodyStatus::Partial { need } => Ok(Parsed::Partial { need }),
    }
}

/// Parse one HTTP/1.x response from the front of `buf`
///
/// `head_only` marks a response to HEAD. `eof` tells the parser the
/// destination has closed, which completes a close-delimited body.
pub fn parse_http1_response(
    buf: &[u8],
    head_only: bool,
    eof: bool,
    max_body: usize,
) -> Result<Parsed<HttpResponse>, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut slots);
    let head_len = match resp.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return partial_head(buf),
    };

    let status_code = resp.code.ok_or(ParseError::InvalidFormat)?;
    let mut response = HttpResponse {
        version: version_string(resp.version),
        status_code,
        reason: resp.reason.unwrap_or_default().to_string(),
        headers: Headers::from_raw(resp.headers),
        body: Bytes::new(),
        head_only,
        original: None,
    };

    let framing = response.framing()?;
    match decode_body(buf, head_len, framing, eof, max_body)? {
        BodyStatus::Complete { body, end } => {
            response.body = body;
            Ok(Parsed::Complete(response, end))
        }
        BodyStatus::Partial { need } => Ok(Parsed::Partial { need }),
    }
}

fn partial_head<T>(buf: &[u8]) -> Result<Parsed<T>, ParseError> {
    if buf.len() >= MAX_HEAD_SIZE {
        return Err(ParseError::HeadTooLarge {
            limit: MAX_HEAD_SIZE,
        });
    }
    Ok(Parsed::Partial {
        need: buf.len() + 1,
    })
}

fn version_string(minor: Option<u8>) -> String {
    format!("HTTP/1.{}", minor.unwrap_or(1))
}

fn check_limit(current: usize, limit: usize) -> Result<(), ParseError> {
    if current > limit {
        return Err(ParseError::BodyTooLarge { current, limit });
    }
    Ok(())
}

fn decode_body(
    buf: &[u8],
    start: usize,
    framing: BodyFraming,
    eof: bool,
    max_body: usize,
) -> Result<BodyStatus, ParseError> {
    match framing {
        BodyFraming::Empty => Ok(BodyStatus::Complete {
            body: Bytes::new(),
            end: start,
        }),
        BodyFraming::ContentLength(len) => {
            check_limit(len, max_body)?;
            let end = start + len;
            if buf.len() < end {
                return Ok(BodyStatus::Partial { need: end });
            }
            Ok(BodyStatus::Complete {
                body: Bytes::copy_from_slice(&buf[start..end]),
                end,
            })
        }
        BodyFraming::Chunked => decode_chunked(buf, start, max_body),
        BodyFraming::CloseDelimited => {
            check_limit(buf.len() - start, max_body)?;
            if !eof {
                return Ok(BodyStatus::Partial {
                    need: buf.len() + 1,
                });
            }
            Ok(BodyStatus::Complete {
                body: Bytes::copy_from_slice(&buf[start..]),
                end: buf.len(),
            })
        }
    }
}

fn decode_chunked(buf: &[u8], start: usize, max_body: usize) -> Result<BodyStatus, ParseError> {
    let mut pos = start;
    let mut body = BytesMut::new();

    loop {
        let (consumed, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(found)) => found,
            Ok(httparse::Status::Partial) => {
                if buf.len() - pos > MAX_CHUNK_LINE {
                    return Err(ParseError::InvalidChunk(
                        "chunk size line too long".to_string(),
                    ));
                }
                return Ok(BodyStatus::Partial {
                    need: buf.len() + 1,
                });
            }
            Err(_) => {
                return Err(ParseError::InvalidChunk(
                    "malformed chunk size".to_string(),
                ))
            }
        };
        pos += consumed;

        if size == 0 {
            return finish_trailers(buf, pos, body);
        }

        let size = usize::try_from(size)
            .map_err(|_| ParseError::InvalidChunk("chunk size overflow".to_string()))?;
        check_limit(body.len().saturating_add(size), max_body)?;

        let data_end = pos + size;
        if buf.len() < data_end + 2 {
            return Ok(BodyStatus::Partial { need: data_end + 2 });
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk(
                "missing CRLF after chunk data".to_string(),
            ));
        }
        body.extend_from_slice(&buf[pos..data_end]);
        pos = data_end + 2;
    }
}

fn finish_trailers(buf: &[u8], mut pos: usize, body: BytesMut) -> Result<BodyStatus, ParseError> {
    loop {
        match find_crlf(&buf[pos..]) {
            Some(0) => {
                return Ok(BodyStatus::Complete {
                    body: body.freeze(),
                    end: pos + 2,
                })
            }
            Some(line_len) => pos += line_len + 2,
            None => {
                if buf.len() - pos > MAX_HEAD_SIZE {
                    return Err(ParseError::HeadTooLarge {
                        limit: MAX_HEAD_SIZE,
                    });
                }
                return Ok(BodyStatus::Partial {
                    need: buf.len() + 1,
                });
            }
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Fix up framing headers for a re-encoded body; returns whether to chunk
fn reframe(headers: &mut Headers, body: &Bytes, always_length: bool) -> bool {
    if headers.is_chunked() {
        headers.remove("content-length");
        return true;
    }
    if always_length || !body.is_empty() || headers.contains("content-length") {
        headers.set("Content-Length", body.len().to_string());
    }
    false
}

fn write_body(out: &mut BytesMut, body: &Bytes, chunked: bool) {
    if chunked {
        if !body.is_empty() {
            out.put_slice(format!("{:x}\r\n", body.len()).as_bytes());
            out.put_slice(body);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"0\r\n\r\n");
    } else {
        out.put_slice(body);
    }
}

fn keep_alive(version: &str, headers: &Headers) -> bool {
    if headers.has_token("connection", "close") {
        return false;
    }
    if version == "HTTP/1.0" {
        return headers.has_token("connection", "keep-alive");
    }
    true
}

impl HttpRequest {
    /// Build a request from scratch (HTTP/1.1, no headers, empty body)
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            original: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub(crate) fn attach_wire(&mut self, bytes: Bytes) {
        let mut snapshot = self.clone();
        snapshot.original = None;
        self.original = Some(Arc::new(Original {
            bytes,
            message: snapshot,
        }));
    }

    fn same_content(&self, other: &HttpRequest) -> bool {
        self.method == other.method
            && self.path == other.path
            && self.version == other.version
            && self.headers == other.headers
            && self.body == other.body
    }

    /// Exact bytes this request was decoded from
    pub fn wire_bytes(&self) -> Option<&Bytes> {
        self.original.as_ref().map(|o| &o.bytes)
    }

    /// True for synthesized requests and decoded ones a handler changed
    pub fn is_modified(&self) -> bool {
        match &self.original {
            Some(original) => !original.message.same_content(self),
            None => true,
        }
    }

    /// Body framing declared by the headers
    pub fn framing(&self) -> Result<BodyFraming, ParseError> {
        let has_te = self.headers.contains("transfer-encoding");
        let content_length = self.headers.content_length()?;
        if has_te && content_length.is_some() {
            return Err(ParseError::InvalidHeader(
                "both Transfer-Encoding and Content-Length present".to_string(),
            ));
        }
        if has_te {
            if !self.headers.is_chunked() {
                return Err(ParseError::InvalidHeader(
                    "request Transfer-Encoding must end with chunked".to_string(),
                ));
            }
            return Ok(BodyFraming::Chunked);
        }
        Ok(match content_length {
            Some(0) | None => BodyFraming::Empty,
            Some(len) => BodyFraming::ContentLength(len),
        })
    }

    /// Serialize for the destination leg
    pub fn encode(&self) -> Bytes {
        if let Some(original) = &self.original {
            if original.message.same_content(self) {
                return original.bytes.clone();
            }
        }

        let mut headers = self.headers.clone();
        let chunked = reframe(&mut headers, &self.body, false);

        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.put_slice(format!("{} {} {}\r\n", self.method, self.path, self.version).as_bytes());
        headers.write_to(&mut out);
        write_body(&mut out, &self.body, chunked);
        out.freeze()
    }

    /// Whether the client expects the connection to stay open afterwards
    pub fn keep_alive(&self) -> bool {
        keep_alive(&self.version, &self.headers)
    }

    /// Drop hop-by-hop proxy headers before forwarding
    pub fn strip_proxy_headers(&mut self) {
        self.headers.remove("proxy-connection");
        self.headers.remove("proxy-authorization");
    }

    pub fn is_upgrade(&self) -> bool {
        self.headers.has_token("connection", "upgrade") && self.headers.contains("upgrade")
    }
}

impl HttpResponse {
    /// Build a response from scratch (HTTP/1.1, no headers, empty body)
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            head_only: false,
            original: None,
        }
    }

    /// Plain-text 502 used when a handler faults
    pub fn bad_gateway(detail: &str) -> Self {
        Self::new(502, "Bad Gateway")
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(format!("502 Bad Gateway: {}\n", detail))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub(crate) fn attach_wire(&mut self, bytes: Bytes) {
        let mut snapshot = self.clone();
        snapshot.original = None;
        self.original = Some(Arc::new(Original {
            bytes,
            message: snapshot,
        }));
    }

    /// Mark as the answer to a HEAD request, so no body is written
    pub(crate) fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    fn same_content(&self, other: &HttpResponse) -> bool {
        self.version == other.version
            && self.status_code == other.status_code
            && self.reason == other.reason
            && self.headers == other.headers
            && self.body == other.body
    }

    /// Exact bytes this response was decoded from
    pub fn wire_bytes(&self) -> Option<&Bytes> {
        self.original.as_ref().map(|o| &o.bytes)
    }

    /// True for synthesized responses and decoded ones a handler changed
    pub fn is_modified(&self) -> bool {
        match &self.original {
            Some(original) => !original.message.same_content(self),
            None => true,
        }
    }

    /// 1xx, 204, 304 and HEAD answers never carry a body
    pub fn carries_body(&self) -> bool {
        !(self.head_only
            || self.is_informational()
            || self.status_code == 204
            || self.status_code == 304)
    }

    /// Body framing declared by the status and headers
    pub fn framing(&self) -> Result<BodyFraming, ParseError> {
        if !self.carries_body() {
            return Ok(BodyFraming::Empty);
        }
        if self.headers.contains("transfer-encoding") {
            if self.headers.is_chunked() {
                return Ok(BodyFraming::Chunked);
            }
            return Ok(BodyFraming::CloseDelimited);
        }
        Ok(match self.headers.content_length()? {
            Some(0) => BodyFraming::Empty,
            Some(len) => BodyFraming::ContentLength(len),
            None => BodyFraming::CloseDelimited,
        })
    }

    /// Serialize for the client leg
    pub fn encode(&self) -> Bytes {
        if let Some(original) = &self.original {
            if original.message.same_content(self) {
                return original.bytes.clone();
            }
        }

        let mut headers = self.headers.clone();
        let carries_body = self.carries_body();
        let chunked = carries_body && reframe(&mut headers, &self.body, true);

        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.put_slice(
            format!("{} {} {}\r\n", self.version, self.status_code, self.reason).as_bytes(),
        );
        headers.write_to(&mut out);
        if carries_body {
            write_body(&mut out, &self.body, chunked);
        }
        out.freeze()
    }

    /// Whether the connection can carry another exchange afterwards
    pub fn keep_alive(&self) -> bool {
        if matches!(self.sent_framing(), Ok(BodyFraming::CloseDelimited)) {
            return false;
        }
        keep_alive(&self.version, &self.headers)
    }

    /// Framing of the bytes `encode` produces, which differs from `framing`
    /// once a re-encode adds `Content-Length`
    fn sent_framing(&self) -> Result<BodyFraming, ParseError> {
        if !self.is_modified() || !self.carries_body() {
            return self.framing();
        }
        let mut headers = self.headers.clone();
        if reframe(&mut headers, &self.body, true) {
            return Ok(BodyFraming::Chunked);
        }
        if headers.contains("transfer-encoding") {
            return Ok(BodyFraming::CloseDelimited);
        }
        Ok(BodyFraming::ContentLength(self.body.len()))
    }

    /// 1xx interim response
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status_code)
    }
}
