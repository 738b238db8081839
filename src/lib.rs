#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//! - [`Server`]: owns the configuration, the listening socket, the acceptor
//!   thread and the worker pool
//! - [`Executor`]: fixed pool of worker threads fed from a FIFO queue
//! - [`ConnectionSession`]: the per-connection keep-alive loop
//! - [`RequestFramer`] / [`ResponseEncoder`]: HTTP/1.1 wire format
//! - [`Connection`] / [`Listener`]: blocking TCP sockets, optionally TLS
//!
//! ## Features
//! - `tls`: rustls-backed HTTPS (enabled by default)

pub use crate::config::ServerConfig;
pub use crate::encoder::ResponseEncoder;
pub use crate::error::{ExecutorError, HandlerError, ProtocolError, ServerError, TlsError};
pub use crate::executor::Executor;
pub use crate::framer::{FrameError, FrameLimits, Framing, RequestFramer};
pub use crate::http::{reason_phrase, Bytes, Headers, Request, Response};
pub use crate::net::{Connection, Endpoint, Listener};
pub use crate::server::{ConnectionInfo, Server, Service};
pub use crate::session::{ConnectionSession, SessionSettings};
#[cfg(feature = "tls")]
pub use crate::tls::TlsAcceptor;

mod config;
mod encoder;
mod error;
mod executor;
mod framer;
mod http;
mod net;
mod server;
mod session;
#[cfg(feature = "tls")]
mod tls;

#[cfg(test)]
mod testing;
