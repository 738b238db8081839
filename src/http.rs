use std::collections::BTreeMap;

pub use bytes::Bytes;

use crate::server::ConnectionInfo;

/// Header names as sent on the wire. Lookups are case-sensitive.
pub type Headers = BTreeMap<String, String>;

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const CONNECTION: &str = "Connection";

/// A fully framed HTTP request.
///
/// Produced by the [`RequestFramer`](crate::RequestFramer) and read-only
/// afterwards. The body is always completely buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: String,
    pub(crate) headers: Headers,
    pub(crate) body: Bytes,
    pub(crate) info: ConnectionInfo,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Percent-decoded path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string after `?`, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Version token from the request line, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The connection this request arrived on.
    pub fn connection(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Whether the client asked to keep the connection open.
    ///
    /// `Connection: close` always closes; no `Connection` header keeps the
    /// connection open only for HTTP/1.1; any other value keeps it open.
    pub fn keep_alive(&self) -> bool {
        match self.header(CONNECTION) {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(_) => true,
            None => self.version == "HTTP/1.1",
        }
    }

    /// Whether `Accept-Encoding` lists gzip.
    pub fn accepts_gzip(&self) -> bool {
        self.header(ACCEPT_ENCODING)
            .map(|value| value.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false)
    }

    pub(crate) fn set_connection_info(&mut self, info: ConnectionInfo) {
        self.info = info;
    }
}

/// An HTTP response filled in by the dispatch callback.
///
/// Defaults to `200 OK` with no headers and an empty body. Framing headers
/// (`Content-Length`, `Transfer-Encoding`) are computed by the encoder; a
/// handler only chooses between fixed and chunked framing and whether the
/// body may be gzipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Headers,
    body: Bytes,
    chunked: bool,
    gzip: bool,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// A response with `status`, its canonical reason and the reason as a
    /// plain-text body.
    pub fn error(status: u16) -> Self {
        let mut response = Response::new();
        response.set_status(status);
        response.set_header("Content-Type", "text/plain");
        response.set_body(reason_phrase(status));
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Sets the status code together with its canonical reason phrase.
    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self.reason = reason_phrase(status).to_string();
        self
    }

    pub fn set_status_with_reason(&mut self, status: u16, reason: impl Into<String>) -> &mut Self {
        self.status = status;
        self.reason = reason.into();
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Sets a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Marks the response for chunked transfer encoding.
    pub fn set_chunked(&mut self, chunked: bool) -> &mut Self {
        self.chunked = chunked;
        self
    }

    /// True when marked chunked directly or through a
    /// `Transfer-Encoding: chunked` header, matched in any case.
    pub fn is_chunked(&self) -> bool {
        self.chunked
            || self.headers.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case(TRANSFER_ENCODING)
                    && value.to_ascii_lowercase().contains("chunked")
            })
    }

    /// Marks the body for gzip compression before it is framed.
    pub fn set_gzip(&mut self, gzip: bool) -> &mut Self {
        self.gzip = gzip;
        self
    }

    pub fn wants_gzip(&self) -> bool {
        self.gzip
    }

    pub(crate) fn take_body(&mut self) -> Bytes {
        std::mem::take(&mut self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: 200,
            reason: "OK".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            chunked: false,
            gzip: false,
        }
    }
}

/// Canonical reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
