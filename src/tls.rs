//! TLS server context and certificate loading.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use socket2::Socket;

use crate::error::TlsError;

/// Shared rustls server configuration, loaded once at startup and used to
/// wrap every accepted connection.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    /// Loads a PEM certificate chain and private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        Self::from_der(certs, key)
    }

    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor {
            config: Arc::new(config),
        })
    }

    /// Drives the handshake to completion on a freshly accepted socket.
    pub(crate) fn handshake(
        &self,
        mut socket: Socket,
    ) -> io::Result<StreamOwned<ServerConnection, Socket>> {
        let mut session = ServerConnection::new(self.config.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        while session.is_handshaking() {
            let (read, written) = session.complete_io(&mut socket)?;
            if read == 0 && written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during tls handshake",
                ));
            }
        }

        Ok(StreamOwned::new(session, socket))
    }
}

fn open(kind: &'static str, path: &Path) -> Result<BufReader<File>, TlsError> {
    if !path.exists() {
        return Err(TlsError::NotFound {
            kind,
            path: path.to_path_buf(),
        });
    }
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open("certificate", path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open("private key", path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::{Endpoint, Listener};
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, RootCertStore};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::path::PathBuf;
    use std::thread;

    pub(crate) fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    pub(crate) fn acceptor() -> TlsAcceptor {
        TlsAcceptor::from_pem_files(&fixture("server.pem"), &fixture("server.key")).unwrap()
    }

    /// A client stream trusting the test CA, connected to `endpoint`.
    pub(crate) fn client(endpoint: Endpoint) -> StreamOwned<ClientConnection, TcpStream> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&fixture("ca.pem")).unwrap() {
            roots.add(cert).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = ServerName::try_from("localhost").unwrap();
        let session = ClientConnection::new(Arc::new(config), name).unwrap();
        let sock = TcpStream::connect(endpoint.to_string()).unwrap();
        StreamOwned::new(session, sock)
    }

    /// Tests loading the fixture certificate and key.
    #[test]
    fn test_load_pem_files() {
        assert!(load_certs(&fixture("server.pem")).unwrap().len() >= 1);
        assert!(load_key(&fixture("server.key")).is_ok());
        let _ = acceptor();
    }

    /// Tests that missing files and files without the expected PEM blocks
    /// are reported distinctly.
    #[test]
    fn test_load_errors() {
        let missing = TlsAcceptor::from_pem_files(&fixture("nope.pem"), &fixture("server.key"));
        assert!(matches!(missing, Err(TlsError::NotFound { kind: "certificate", .. })));

        let no_certs = load_certs(&fixture("server.key"));
        assert!(matches!(no_certs, Err(TlsError::NoCertificates(_))));

        let no_key = load_key(&fixture("server.pem"));
        assert!(matches!(no_key, Err(TlsError::NoPrivateKey(_))));
    }

    /// Tests that accept performs the handshake and the resulting connection
    /// carries application data both ways.
    #[test]
    fn test_tls_accept_roundtrip() {
        let listener = Listener::bind(Endpoint::localhost(0), 16)
            .unwrap()
            .with_tls(acceptor(), Some(std::time::Duration::from_secs(5)));
        let endpoint = listener.local_endpoint().unwrap();
        assert!(listener.is_secure());

        let client = thread::spawn(move || {
            let mut stream = client(endpoint);
            stream.write_all(b"hello over tls").unwrap();
            stream.flush().unwrap();
            let mut reply = [0u8; 5];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        let mut conn = listener.accept().unwrap().expect("handshake succeeds");
        assert!(conn.is_secure());

        let mut buf = vec![0u8; 14];
        let mut read = 0;
        while read < buf.len() {
            read += conn.receive(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"hello over tls");
        conn.send(b"world").unwrap();

        assert_eq!(&client.join().unwrap(), b"world");
        assert!(conn.duplicate().is_err());
    }

    /// Tests that a plaintext client on a TLS listener is discarded without
    /// producing a connection.
    #[test]
    fn test_tls_handshake_failure_discarded() {
        let listener = Listener::bind(Endpoint::localhost(0), 16)
            .unwrap()
            .with_tls(acceptor(), Some(std::time::Duration::from_secs(5)));
        let endpoint = listener.local_endpoint().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(endpoint.to_string()).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        assert!(listener.accept().unwrap().is_none());
        client.join().unwrap();
    }
}
