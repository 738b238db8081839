use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::encoder::ResponseEncoder;
use crate::error::ProtocolError;
use crate::executor::panic_message;
use crate::framer::{FrameError, FrameLimits, RequestFramer};
use crate::http::{Request, Response, CONNECTION, CONTENT_ENCODING};
use crate::net::Connection;
use crate::server::{ConnectionInfo, Service};

/// Per-server settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub limits: FrameLimits,
    pub encoder: ResponseEncoder,
    /// When false every response closes its connection.
    pub keep_alive: bool,
    pub idle_timeout: Option<Duration>,
    /// 0 means unlimited.
    pub max_requests: usize,
    pub gzip: bool,
    pub gzip_min_size: usize,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        SessionSettings {
            limits: FrameLimits {
                max_header_size: config.max_header_size,
                max_body_size: config.max_body_size,
            },
            encoder: ResponseEncoder::new(config.chunk_size),
            keep_alive: config.keep_alive,
            idle_timeout: config.keep_alive_timeout(),
            max_requests: config.max_requests_per_connection,
            gzip: config.gzip,
            gzip_min_size: config.gzip_min_size,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings::from_config(&ServerConfig::default())
    }
}

enum State {
    ReadingRequest,
    Dispatching(Request),
    WritingResponse(Request, Response),
    Continue,
    Close,
}

/// One accepted connection's lifetime: read a request, dispatch it, write
/// the response, and either go around again or close.
///
/// A session runs entirely on the worker thread that picked it up.
pub struct ConnectionSession {
    conn: Connection,
    framer: RequestFramer,
    service: Arc<dyn Service>,
    settings: Arc<SessionSettings>,
    running: Arc<AtomicBool>,
    info: ConnectionInfo,
    served: usize,
}

impl ConnectionSession {
    pub fn new(
        conn: Connection,
        service: Arc<dyn Service>,
        settings: Arc<SessionSettings>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let info = ConnectionInfo {
            local: conn.local_endpoint(),
            remote: conn.remote_endpoint(),
            secure: conn.is_secure(),
        };

        ConnectionSession {
            framer: RequestFramer::new(settings.limits),
            conn,
            service,
            settings,
            running,
            info,
            served: 0,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Drives the connection until it closes. The connection is always
    /// released on return.
    ///
    /// # Errors
    /// Transport failures while reading a request or writing a response.
    /// An idle timeout or a peer closing between requests is not an error.
    pub fn run(mut self) -> io::Result<()> {
        let result = self.drive();
        self.conn.close();
        log::debug!(
            "connection {:?} closed after {} requests",
            self.info.remote,
            self.served
        );
        result
    }

    fn drive(&mut self) -> io::Result<()> {
        self.conn.set_read_timeout(self.settings.idle_timeout)?;
        let mut state = State::ReadingRequest;

        loop {
            state = match state {
                State::ReadingRequest => match self.framer.read_request(&mut self.conn) {
                    Ok(Some(mut request)) => {
                        request.set_connection_info(self.info);
                        State::Dispatching(request)
                    }
                    Ok(None) => State::Close,
                    Err(FrameError::Protocol(err)) => {
                        self.reject(&err);
                        State::Close
                    }
                    Err(FrameError::Transport(e)) if is_timeout(&e) && !self.framer.has_partial() => {
                        log::debug!("connection {:?} idle, closing", self.info.remote);
                        State::Close
                    }
                    Err(FrameError::Transport(e)) => return Err(e),
                },

                State::Dispatching(request) => {
                    let response = self.dispatch(&request);
                    State::WritingResponse(request, response)
                }

                State::WritingResponse(request, mut response) => {
                    let keep_alive = self.prepare(&request, &mut response);
                    self.settings
                        .encoder
                        .write_response(&mut response, &mut self.conn)?;

                    log::trace!(
                        "{} {} {} -> {}",
                        request.method(),
                        request.path(),
                        request.version(),
                        response.status()
                    );

                    if keep_alive {
                        State::Continue
                    } else {
                        State::Close
                    }
                }

                State::Continue => State::ReadingRequest,

                State::Close => return Ok(()),
            };
        }
    }

    /// Runs the handler. Errors and panics both become a 500.
    fn dispatch(&self, request: &Request) -> Response {
        let mut response = Response::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.service.call(request, &mut response)
        }));

        match outcome {
            Ok(Ok(())) => response,
            Ok(Err(e)) => {
                log::warn!(
                    "handler failed for {} {}: {}",
                    request.method(),
                    request.path(),
                    e
                );
                Response::error(500)
            }
            Err(panic) => {
                log::error!(
                    "handler panicked for {} {}: {}",
                    request.method(),
                    request.path(),
                    panic_message(&*panic)
                );
                Response::error(500)
            }
        }
    }

    /// Decides keep-alive, stamps the `Connection` header and applies the
    /// gzip policy. Returns whether the connection stays open.
    fn prepare(&mut self, request: &Request, response: &mut Response) -> bool {
        self.served += 1;

        let under_limit =
            self.settings.max_requests == 0 || self.served < self.settings.max_requests;
        let keep_alive = self.settings.keep_alive
            && under_limit
            && self.running.load(Ordering::SeqCst)
            && keep_alive_disposition(request, response.status());

        response.set_header(CONNECTION, if keep_alive { "keep-alive" } else { "close" });

        if self.settings.gzip
            && request.accepts_gzip()
            && response.body().len() >= self.settings.gzip_min_size
            && response.header(CONTENT_ENCODING).is_none()
        {
            response.set_gzip(true);
        }

        keep_alive
    }

    /// Answers a malformed request. The connection closes afterwards, so a
    /// failed write here is only logged.
    fn reject(&mut self, err: &ProtocolError) {
        log::debug!("malformed request from {:?}: {}", self.info.remote, err);

        let mut response = Response::error(err.status());
        response.set_header(CONNECTION, "close");
        if let Err(e) = self
            .settings
            .encoder
            .write_response(&mut response, &mut self.conn)
        {
            log::debug!("failed to send {} response: {}", err.status(), e);
        }
    }
}

/// Whether the request allows another request on the same connection.
/// A 404 always closes.
pub fn keep_alive_disposition(request: &Request, status: u16) -> bool {
    status != 404 && request.keep_alive()
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
