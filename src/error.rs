use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Represents errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// A job was submitted after the pool started tearing down
    #[error("job submitted to a pool that is shutting down")]
    ShutDown,

    /// A pool needs at least one worker
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
}

/// A malformed request. The session answers with [`ProtocolError::status`]
/// and closes the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed request line")]
    InvalidRequestLine,

    #[error("unsupported protocol version")]
    InvalidVersion,

    #[error("malformed header line")]
    InvalidHeader,

    #[error("Content-Length is not a valid length")]
    InvalidContentLength,

    #[error("request path is not valid percent-encoded UTF-8")]
    InvalidPath,

    #[error("header block exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("declared body of {declared} bytes exceeds limit of {limit}")]
    BodyTooLarge { declared: usize, limit: usize },
}

impl ProtocolError {
    /// Status code sent back to the client for this error.
    pub fn status(&self) -> u16 {
        match self {
            ProtocolError::HeadersTooLarge(_) => 431,
            ProtocolError::BodyTooLarge { .. } => 413,
            _ => 400,
        }
    }
}

/// Failures while loading the TLS certificate and key.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{kind} file not found: {path:?}")]
    NotFound { kind: &'static str, path: PathBuf },

    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("no certificate found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[cfg(feature = "tls")]
    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Startup failures. None of these are recoverable: the server does not start.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("tls requested but the `tls` feature is disabled")]
    TlsUnavailable,

    #[error("failed to bind {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },

    #[error("worker pool error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Error type returned by a dispatch callback. The engine turns it into a 500.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Type alias for Results using ExecutorError as the error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests the conversion and formatting of ServerError with IO errors
    #[test]
    fn test_server_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let err = ServerError::from(io_err);

        assert!(matches!(err, ServerError::Io(_)));
        assert_eq!(err.to_string(), "io error: test error");
    }

    /// Tests that executor errors nest into startup errors
    #[test]
    fn test_executor_error_nesting() {
        let err = ServerError::from(ExecutorError::InvalidWorkerCount);
        assert_eq!(
            err.to_string(),
            "worker pool error: worker count must be at least 1"
        );
    }

    /// Tests the status code each protocol error answers with
    #[test]
    fn test_protocol_error_status() {
        assert_eq!(ProtocolError::InvalidRequestLine.status(), 400);
        assert_eq!(ProtocolError::InvalidContentLength.status(), 400);
        assert_eq!(ProtocolError::InvalidPath.status(), 400);
        assert_eq!(ProtocolError::HeadersTooLarge(8192).status(), 431);
        assert_eq!(
            ProtocolError::BodyTooLarge { declared: 10, limit: 5 }.status(),
            413
        );
    }
}
