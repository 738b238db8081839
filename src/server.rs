//! Server lifecycle: bind, accept, hand connections to the worker pool and
//! stop cleanly.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::{HandlerError, ServerError};
use crate::executor::Executor;
use crate::http::{Request, Response};
use crate::net::{Connection, Endpoint, Listener};
use crate::session::{ConnectionSession, SessionSettings};
#[cfg(feature = "tls")]
use crate::tls::TlsAcceptor;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// doesn't spin the acceptor thread.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handles one request.
///
/// The service fills in `response`; returning `Err` turns the response into
/// a 500. Implemented for every
/// `Fn(&Request, &mut Response) -> Result<(), HandlerError>` closure.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: &Request, response: &mut Response) -> Result<(), HandlerError>;
}

impl<F> Service for F
where
    F: Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn call(&self, request: &Request, response: &mut Response) -> Result<(), HandlerError> {
        self(request, response)
    }
}

/// Answers everything with 404 until a dispatch is installed.
struct NotFound;

impl Service for NotFound {
    fn call(&self, _: &Request, response: &mut Response) -> Result<(), HandlerError> {
        response.set_status(404).set_body("Not Found");
        Ok(())
    }
}

/// Addresses of the connection a request arrived on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: Option<Endpoint>,
    pub remote: Option<Endpoint>,
    pub secure: bool,
}

/// An HTTP/1.1 server.
///
/// One acceptor thread accepts connections and queues each one as a job on a
/// fixed [`Executor`]; a worker runs the connection's keep-alive loop to
/// completion.
///
/// ```no_run
/// use ferrule::{Response, Server, ServerConfig};
///
/// let mut server = Server::new(ServerConfig::default());
/// server.set_dispatch(|_request, response: &mut Response| {
///     response.set_body("Hello, World!");
///     Ok(())
/// });
/// server.start()?;
/// # Ok::<(), ferrule::ServerError>(())
/// ```
pub struct Server {
    config: ServerConfig,
    service: Arc<dyn Service>,
    running: Arc<AtomicBool>,
    executor: Option<Arc<Executor>>,
    acceptor: Option<JoinHandle<()>>,
    local: Option<Endpoint>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            service: Arc::new(NotFound),
            running: Arc::new(AtomicBool::new(false)),
            executor: None,
            acceptor: None,
            local: None,
        }
    }

    /// A server with default settings listening on `endpoint`.
    pub fn bind(endpoint: Endpoint) -> Self {
        let config = ServerConfig {
            host: endpoint.ip().to_string(),
            port: endpoint.port(),
            ..ServerConfig::default()
        };
        Server::new(config)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Serves over TLS with the given PEM certificate chain and key.
    pub fn tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.config.tls_cert_path = Some(cert_path.into());
        self.config.tls_key_path = Some(key_path.into());
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Installs the request handler. Must be called before
    /// [`start`](Server::start); connections accepted earlier keep the
    /// handler they started with.
    pub fn set_dispatch<F>(&mut self, dispatch: F)
    where
        F: Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.service = Arc::new(dispatch);
    }

    pub fn set_service<S: Service>(&mut self, service: S) {
        self.service = Arc::new(service);
    }

    pub fn is_running(&self) -> bool {
        self.acceptor.is_some()
    }

    /// The bound address once started. Useful with port 0.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local
    }

    /// Binds the listening socket, starts the worker pool and the acceptor
    /// thread, and returns.
    ///
    /// # Errors
    /// Fails on an invalid address, unreadable TLS material, a bind or
    /// listen failure, or when already running. Nothing is left running on
    /// failure.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.acceptor.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let endpoint = self.config.endpoint()?;
        let listener = self.listener(endpoint)?;
        let local = listener.local_endpoint();
        let executor = Arc::new(Executor::new(self.config.workers)?);
        let settings = Arc::new(SessionSettings::from_config(&self.config));

        self.running.store(true, Ordering::SeqCst);
        let acceptor = {
            let executor = executor.clone();
            let service = self.service.clone();
            let running = self.running.clone();
            thread::Builder::new()
                .name("ferrule-acceptor".to_string())
                .spawn(move || accept_loop(listener, executor, service, settings, running))
        };

        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                executor.shutdown();
                return Err(ServerError::Io(e));
            }
        };

        log::info!(
            "listening on {} ({} workers, tls: {})",
            local.map(|e| e.to_string()).unwrap_or_else(|| endpoint.to_string()),
            executor.workers(),
            self.config.tls_paths().is_some()
        );

        self.executor = Some(executor);
        self.acceptor = Some(acceptor);
        self.local = local;
        Ok(())
    }

    /// Stops accepting, waits for in-flight connections to finish their
    /// current request, drops connections still queued and joins every
    /// thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        if let Some(local) = self.local {
            wake(local);
        }
        if acceptor.join().is_err() {
            log::error!("acceptor thread panicked");
        }

        if let Some(executor) = self.executor.take() {
            executor.shutdown();
        }
        log::info!("server stopped");
    }

    /// Starts with `service` and blocks the calling thread on the accept
    /// loop.
    pub fn serve<S: Service>(mut self, service: S) -> Result<(), ServerError> {
        self.set_service(service);
        self.start()?;

        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                log::error!("acceptor thread panicked");
            }
        }
        if let Some(executor) = self.executor.take() {
            executor.shutdown();
        }
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn listener(&self, endpoint: Endpoint) -> Result<Listener, ServerError> {
        let acceptor = match self.config.tls_paths() {
            Some((cert, key)) => Some(TlsAcceptor::from_pem_files(cert, key)?),
            None => None,
        };

        let listener = bind(endpoint, self.config.backlog)?;
        Ok(match acceptor {
            Some(acceptor) => listener.with_tls(acceptor, self.config.tls_handshake_timeout()),
            None => listener,
        })
    }

    #[cfg(not(feature = "tls"))]
    fn listener(&self, endpoint: Endpoint) -> Result<Listener, ServerError> {
        if self.config.tls_paths().is_some() {
            return Err(ServerError::TlsUnavailable);
        }
        bind(endpoint, self.config.backlog)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(endpoint: Endpoint, backlog: i32) -> Result<Listener, ServerError> {
    Listener::bind(endpoint, backlog).map_err(|source| ServerError::Bind {
        endpoint: endpoint.to_string(),
        source,
    })
}

fn accept_loop(
    listener: Listener,
    executor: Arc<Executor>,
    service: Arc<dyn Service>,
    settings: Arc<SessionSettings>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let conn = match listener.accept() {
            Ok(Some(conn)) => conn,
            Ok(None) => continue,
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        if !running.load(Ordering::SeqCst) {
            break;
        }

        log::debug!("accepted connection from {:?}", conn.remote_endpoint());
        let session = ConnectionSession::new(conn, service.clone(), settings.clone(), running.clone());
        let job = move || {
            let remote = session.info().remote;
            if let Err(e) = session.run() {
                log::debug!("connection {:?} failed: {}", remote, e);
            }
        };

        if let Err(e) = executor.execute(job) {
            log::error!("failed to queue connection: {}", e);
            break;
        }
    }

    log::debug!("accept loop exited");
}

/// Unblocks an acceptor waiting in `accept` by connecting to it.
fn wake(local: Endpoint) {
    let target = if local.ip().is_unspecified() {
        Endpoint::localhost(local.port())
    } else {
        local
    };

    let result = Connection::tcp().and_then(|mut conn| {
        conn.connect(target)?;
        conn.close();
        Ok::<_, io::Error>(())
    });
    if let Err(e) = result {
        log::debug!("failed to wake acceptor on {}: {}", target, e);
    }
}
