use serde::Deserialize;
use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServerError;
use crate::net::Endpoint;

/// Configuration for the server.
///
/// Built once at startup and handed to [`Server`](crate::Server) by value.
/// It can be initialized from environment variables with the "FERRULE_"
/// prefix or from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// IPv4 address to bind. Defaults to "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,
    /// Listening port. Defaults to 8080.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Fixed number of worker threads. Defaults to the CPU count.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listen backlog. Defaults to 128.
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Whether connections may serve more than one request.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Idle read timeout in seconds for an open connection. 0 disables it.
    #[serde(default = "default_keep_alive_timeout_secs")]
    pub keep_alive_timeout_secs: u64,
    /// Requests served on one connection before it is closed. 0 means unlimited.
    #[serde(default = "default_max_requests")]
    pub max_requests_per_connection: usize,
    /// Maximum size of a request header block. Defaults to 8kb.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Maximum declared request body. Defaults to 10mb.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Payload size of each chunk in chunked responses. Defaults to 1024.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Allow gzip responses for clients that accept them.
    #[serde(default = "default_true")]
    pub gzip: bool,
    /// Bodies smaller than this are never compressed.
    #[serde(default = "default_gzip_min_size")]
    pub gzip_min_size: usize,
    /// PEM certificate chain. TLS is enabled when both paths are set.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key.
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub tls_handshake_timeout_secs: u64,
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "FERRULE_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("FERRULE"));

        builder.build()?.try_into()
    }

    /// Validates `host` and `port` into the endpoint to listen on.
    pub fn endpoint(&self) -> Result<Endpoint, ServerError> {
        Endpoint::parse(&self.host, self.port)
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }

    /// The certificate and key paths, when both are configured.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        secs(self.keep_alive_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Option<Duration> {
        secs(self.tls_handshake_timeout_secs)
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// One worker per CPU.
fn default_workers() -> usize {
    num_cpus::get()
}

fn default_backlog() -> i32 {
    128
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_timeout_secs() -> u64 {
    5
}

fn default_max_requests() -> usize {
    100
}

fn default_max_header_size() -> usize {
    8192
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_chunk_size() -> usize {
    1024
}

fn default_gzip_min_size() -> usize {
    256
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

/// Provides default values for all configuration options.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            backlog: default_backlog(),
            keep_alive: true,
            keep_alive_timeout_secs: default_keep_alive_timeout_secs(),
            max_requests_per_connection: default_max_requests(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            chunk_size: default_chunk_size(),
            gzip: true,
            gzip_min_size: default_gzip_min_size(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}
