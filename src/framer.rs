//! Request framing: deciding, from a stream of bytes, where one request ends.
//!
//! Bytes are accumulated until the blank line ending the header block is
//! seen. The head is parsed once, then the framer keeps reading until the
//! declared `Content-Length` worth of body has arrived. Anything received
//! past that point stays buffered and starts the next request.
use std::io::{self, Read};

use bytes::Bytes;
use memchr::memmem;
use percent_encoding::percent_decode_str;

use crate::error::ProtocolError;
use crate::http::{Headers, Request, CONTENT_LENGTH};
use crate::server::ConnectionInfo;

const HEADER_END: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 4096;

/// Size limits applied while framing.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        FrameLimits {
            max_header_size: 8192,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Outcome of trying to frame the buffered bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Framing {
    Complete(Request),
    NeedMoreData,
}

/// Why [`RequestFramer::read_request`] gave up.
#[derive(Debug)]
pub enum FrameError {
    /// The transport failed or closed mid-request. No response is possible.
    Transport(io::Error),
    /// The bytes are not a valid request. Answer with an error and close.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for FrameError {
    fn from(err: ProtocolError) -> Self {
        FrameError::Protocol(err)
    }
}

/// Parsed request line and headers, waiting for the body.
#[derive(Debug)]
struct Head {
    method: String,
    path: String,
    query: Option<String>,
    version: String,
    headers: Headers,
    /// Offset of the first body byte in the buffer.
    body_start: usize,
    content_length: usize,
}

/// Accumulates bytes from one connection and cuts them into requests.
#[derive(Debug)]
pub struct RequestFramer {
    buf: Vec<u8>,
    head: Option<Head>,
    /// Where to resume searching for the header terminator.
    scanned: usize,
    limits: FrameLimits,
}

impl RequestFramer {
    pub fn new(limits: FrameLimits) -> Self {
        RequestFramer {
            buf: Vec::with_capacity(READ_CHUNK),
            head: None,
            scanned: 0,
            limits,
        }
    }

    /// Appends received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True when bytes of a not yet complete request are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Tries to cut one request out of the buffered bytes.
    pub fn advance(&mut self) -> Result<Framing, ProtocolError> {
        if self.head.is_none() {
            let from = self.scanned.saturating_sub(HEADER_END.len() - 1);
            let end = match memmem::find(&self.buf[from..], HEADER_END) {
                Some(pos) => from + pos,
                None => {
                    if self.buf.len() > self.limits.max_header_size {
                        return Err(ProtocolError::HeadersTooLarge(self.limits.max_header_size));
                    }
                    self.scanned = self.buf.len();
                    return Ok(Framing::NeedMoreData);
                }
            };

            if end > self.limits.max_header_size {
                return Err(ProtocolError::HeadersTooLarge(self.limits.max_header_size));
            }

            let head = parse_head(&self.buf[..end], end + HEADER_END.len())?;
            if head.content_length > self.limits.max_body_size {
                return Err(ProtocolError::BodyTooLarge {
                    declared: head.content_length,
                    limit: self.limits.max_body_size,
                });
            }
            self.head = Some(head);
        }

        let complete = match &self.head {
            Some(head) => self.buf.len() >= head.body_start + head.content_length,
            None => false,
        };
        if !complete {
            return Ok(Framing::NeedMoreData);
        }

        match self.head.take() {
            Some(head) => Ok(Framing::Complete(self.split_request(head))),
            None => Ok(Framing::NeedMoreData),
        }
    }

    fn split_request(&mut self, head: Head) -> Request {
        let end = head.body_start + head.content_length;
        let body = Bytes::copy_from_slice(&self.buf[head.body_start..end]);
        self.buf.drain(..end);
        self.scanned = 0;

        Request {
            method: head.method,
            path: head.path,
            query: head.query,
            version: head.version,
            headers: head.headers,
            body,
            info: ConnectionInfo::default(),
        }
    }

    /// Reads from `reader` until one whole request is framed.
    ///
    /// Returns `Ok(None)` when the peer closes the stream cleanly between
    /// requests. A close in the middle of a request is a transport error.
    pub fn read_request<R: Read>(&mut self, reader: &mut R) -> Result<Option<Request>, FrameError> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Framing::Complete(request) = self.advance()? {
                return Ok(Some(request));
            }

            let n = match reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !self.has_partial() => 0,
                Err(e) => return Err(FrameError::Transport(e)),
            };

            if n == 0 {
                if self.has_partial() {
                    return Err(FrameError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-request",
                    )));
                }
                return Ok(None);
            }

            self.feed(&chunk[..n]);
        }
    }
}

fn parse_head(block: &[u8], body_start: usize) -> Result<Head, ProtocolError> {
    let text = std::str::from_utf8(block).map_err(|_| ProtocolError::InvalidRequestLine)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ProtocolError::InvalidRequestLine)?;
    let mut parts = request_line.split(' ').filter(|part| !part.is_empty());
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(ProtocolError::InvalidRequestLine),
    };

    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ProtocolError::InvalidRequestLine);
    }
    if !version.starts_with("HTTP/") {
        return Err(ProtocolError::InvalidVersion);
    }

    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (target, None),
    };
    let path = decode_path(raw_path)?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(ProtocolError::InvalidHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProtocolError::InvalidHeader);
        }
        headers.insert(name.to_string(), value.trim().to_string());
    }

    let content_length = match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ProtocolError::InvalidContentLength)?,
        None => 0,
    };

    Ok(Head {
        method: method.to_string(),
        path,
        query,
        version: version.to_string(),
        headers,
        body_start,
        content_length,
    })
}

/// Percent-decodes a path, rejecting truncated escapes and non-UTF-8 results.
fn decode_path(raw: &str) -> Result<String, ProtocolError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while let Some(pos) = memchr::memchr(b'%', &bytes[i..]) {
        let at = i + pos;
        let valid = bytes.len() > at + 2
            && bytes[at + 1].is_ascii_hexdigit()
            && bytes[at + 2].is_ascii_hexdigit();
        if !valid {
            return Err(ProtocolError::InvalidPath);
        }
        i = at + 3;
    }

    percent_decode_str(raw)
        .decode_utf8()
        .map(|path| path.into_owned())
        .map_err(|_| ProtocolError::InvalidPath)
}
