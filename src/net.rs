//! Blocking transport layer.
//!
//! A [`Connection`] owns exactly one OS socket and, once upgraded, the TLS
//! session bound to it. Reads and writes look the same either way. The
//! [`Listener`] wraps a listening connection and optionally performs the
//! server side of a TLS handshake on everything it accepts.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{AddrParseError, Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

#[cfg(feature = "tls")]
use crate::tls::TlsAcceptor;

/// `AF_INET`, the only address family an [`Endpoint`] carries.
pub const FAMILY_INET: u16 = 2;

/// An immutable IPv4 address and port.
///
/// Two endpoints are equal when their wire encodings
/// ([`to_bytes`](Endpoint::to_bytes)) are equal.
#[derive(Clone, Copy)]
pub struct Endpoint {
    addr: SocketAddrV4,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Endpoint {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    /// Parses a dotted-quad IPv4 literal.
    pub fn parse(ip: &str, port: u16) -> Result<Self, AddrParseError> {
        Ok(Endpoint::new(ip.parse()?, port))
    }

    /// `127.0.0.1:port`
    pub fn localhost(port: u16) -> Self {
        Endpoint::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn family(&self) -> u16 {
        FAMILY_INET
    }

    /// Family tag, port and address in network byte order.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..2].copy_from_slice(&FAMILY_INET.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.port().to_be_bytes());
        bytes[4..].copy_from_slice(&self.ip().octets());
        bytes
    }

    /// The OS-level `sockaddr` for this endpoint.
    pub fn to_sockaddr(&self) -> SockAddr {
        SockAddr::from(self.addr)
    }

    /// Returns `None` for anything that is not IPv4.
    pub fn from_sockaddr(addr: &SockAddr) -> Option<Self> {
        addr.as_socket_ipv4().map(Endpoint::from)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Endpoint { addr }
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddrV4>().map(Endpoint::from)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.addr)
    }
}

enum Transport {
    Plain(Socket),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, Socket>>),
}

/// One OS socket, optionally carrying a TLS session.
///
/// The connection is the only owner of its handle; the socket is closed
/// exactly once, by [`close`](Connection::close) or on drop. A TLS session
/// is always released before its socket.
pub struct Connection {
    transport: Option<Transport>,
    connected: bool,
    local: Option<Endpoint>,
    remote: Option<Endpoint>,
}

impl Connection {
    /// Creates an unbound IPv4 TCP socket with `SO_REUSEADDR` set.
    pub fn tcp() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        Ok(Connection::from_socket(socket))
    }

    fn from_socket(socket: Socket) -> Self {
        Connection {
            transport: Some(Transport::Plain(socket)),
            connected: false,
            local: None,
            remote: None,
        }
    }

    fn socket(&self) -> io::Result<&Socket> {
        match &self.transport {
            Some(Transport::Plain(socket)) => Ok(socket),
            #[cfg(feature = "tls")]
            Some(Transport::Tls(stream)) => Ok(&stream.sock),
            None => Err(closed()),
        }
    }

    /// Binds to `endpoint` and records the address the OS actually assigned.
    pub fn bind(&mut self, endpoint: Endpoint) -> io::Result<()> {
        let socket = self.socket()?;
        socket.bind(&endpoint.to_sockaddr())?;
        let local = socket
            .local_addr()
            .ok()
            .and_then(|addr| Endpoint::from_sockaddr(&addr));
        self.local = local.or(Some(endpoint));
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.socket()?.listen(backlog)
    }

    /// Blocks until a client connects and returns it as a plaintext
    /// connection with both endpoints filled in.
    pub fn accept(&self) -> io::Result<Connection> {
        let (socket, addr) = self.socket()?.accept()?;
        let local = socket
            .local_addr()
            .ok()
            .and_then(|addr| Endpoint::from_sockaddr(&addr));

        let mut conn = Connection::from_socket(socket);
        conn.remote = Endpoint::from_sockaddr(&addr);
        conn.local = local;
        conn.connected = true;
        Ok(conn)
    }

    /// Connects to `endpoint`. The local endpoint is read back afterwards
    /// since the OS picks the port and interface.
    pub fn connect(&mut self, endpoint: Endpoint) -> io::Result<()> {
        let socket = self.socket()?;
        socket.connect(&endpoint.to_sockaddr())?;
        let local = socket
            .local_addr()
            .ok()
            .and_then(|addr| Endpoint::from_sockaddr(&addr));

        self.local = local;
        self.remote = Some(endpoint);
        self.connected = true;
        Ok(())
    }

    /// Writes every byte of `bytes` and flushes any buffered TLS records.
    /// Short writes are retried; only a hard error fails the send.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }

    /// Reads at most `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// stream. Interrupted reads are retried.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let result = match self.transport.as_mut() {
                Some(Transport::Plain(socket)) => socket.read(buf),
                #[cfg(feature = "tls")]
                Some(Transport::Tls(stream)) => stream.read(buf),
                None => return Err(closed()),
            };

            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    /// Bounds how long [`receive`](Connection::receive) may block.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket()?.set_read_timeout(timeout)
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.transport.is_some()
    }

    pub fn is_secure(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Some(Transport::Tls(_)) = &self.transport {
            return true;
        }
        false
    }

    /// Duplicates the OS handle into a second, independent owner.
    ///
    /// Only plaintext connections can be duplicated; a TLS session has a
    /// single owner.
    pub fn duplicate(&self) -> io::Result<Connection> {
        match &self.transport {
            Some(Transport::Plain(socket)) => {
                let mut copy = Connection::from_socket(socket.try_clone()?);
                copy.connected = self.connected;
                copy.local = self.local;
                copy.remote = self.remote;
                Ok(copy)
            }
            #[cfg(feature = "tls")]
            Some(Transport::Tls(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot duplicate a TLS connection",
            )),
            None => Err(closed()),
        }
    }

    /// Releases the TLS session (after sending close_notify) and then this
    /// handle's socket. Handles from [`duplicate`](Connection::duplicate)
    /// stay usable. Calling it again is a no-op.
    pub fn close(&mut self) {
        self.connected = false;

        match self.transport.take() {
            Some(Transport::Plain(socket)) => drop(socket),
            #[cfg(feature = "tls")]
            Some(Transport::Tls(stream)) => {
                let rustls::StreamOwned { mut conn, mut sock } = *stream;
                conn.send_close_notify();
                while conn.wants_write() {
                    if conn.write_tls(&mut sock).is_err() {
                        break;
                    }
                }
                drop(conn);
                drop(sock);
            }
            None => {}
        }
    }

    /// Runs the server side of a TLS handshake on this accepted connection.
    ///
    /// `timeout` bounds each read during the handshake and is cleared once
    /// the session is established.
    #[cfg(feature = "tls")]
    pub(crate) fn into_tls(
        mut self,
        acceptor: &TlsAcceptor,
        timeout: Option<Duration>,
    ) -> io::Result<Connection> {
        let socket = match self.transport.take() {
            Some(Transport::Plain(socket)) => socket,
            Some(other) => {
                self.transport = Some(other);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "connection is already secured",
                ));
            }
            None => return Err(closed()),
        };

        socket.set_read_timeout(timeout)?;
        let stream = acceptor.handshake(socket)?;
        stream.sock.set_read_timeout(None)?;

        self.transport = Some(Transport::Tls(Box::new(stream)));
        Ok(self)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.receive(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.transport.as_mut() {
            Some(Transport::Plain(socket)) => socket.write(buf),
            #[cfg(feature = "tls")]
            Some(Transport::Tls(stream)) => stream.write(buf),
            None => Err(closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(Transport::Plain(socket)) => socket.flush(),
            #[cfg(feature = "tls")]
            Some(Transport::Tls(stream)) => stream.flush(),
            None => Err(closed()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .field("secure", &self.is_secure())
            .finish()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

/// A bound, listening socket. When a TLS acceptor is attached every accepted
/// connection is handshaken before it is handed out.
pub struct Listener {
    socket: Connection,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
    #[cfg(feature = "tls")]
    handshake_timeout: Option<Duration>,
}

impl Listener {
    /// Creates, binds and listens in one step.
    pub fn bind(endpoint: Endpoint, backlog: i32) -> io::Result<Self> {
        let mut socket = Connection::tcp()?;
        socket.bind(endpoint)?;
        socket.listen(backlog)?;

        Ok(Listener {
            socket,
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            handshake_timeout: None,
        })
    }

    /// Attaches the TLS context used for every accepted connection.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsAcceptor, handshake_timeout: Option<Duration>) -> Self {
        self.tls = Some(acceptor);
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Waits for the next client.
    ///
    /// Returns `Ok(None)` when a TLS handshake fails: that client is dropped
    /// and never seen by the caller. `Err` is reserved for the listening
    /// socket itself failing to accept.
    pub fn accept(&self) -> io::Result<Option<Connection>> {
        let conn = self.socket.accept()?;

        #[cfg(feature = "tls")]
        if let Some(acceptor) = &self.tls {
            let remote = conn.remote_endpoint();
            return match conn.into_tls(acceptor, self.handshake_timeout) {
                Ok(conn) => Ok(Some(conn)),
                Err(e) => {
                    log::debug!("tls handshake with {:?} failed: {}", remote, e);
                    Ok(None)
                }
            };
        }

        Ok(Some(conn))
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.socket.local_endpoint()
    }

    pub fn is_secure(&self) -> bool {
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn listener() -> (Listener, Endpoint) {
        let listener = Listener::bind(Endpoint::localhost(0), 16).unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        (listener, endpoint)
    }

    /// Tests the wire encoding and byte-wise equality of endpoints.
    #[test]
    fn test_endpoint_encoding() {
        let a = Endpoint::parse("10.0.0.1", 8080).unwrap();
        assert_eq!(a.to_bytes(), [0, 2, 0x1f, 0x90, 10, 0, 0, 1]);
        assert_eq!(a.family(), FAMILY_INET);

        let b: Endpoint = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Endpoint::parse("10.0.0.1", 8081).unwrap());

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(a.to_string(), "10.0.0.1:8080");
    }

    /// Tests the round trip through the OS sockaddr type.
    #[test]
    fn test_endpoint_sockaddr() {
        let endpoint = Endpoint::localhost(4242);
        let addr = endpoint.to_sockaddr();
        assert_eq!(Endpoint::from_sockaddr(&addr), Some(endpoint));
        assert!(Endpoint::parse("localhost", 80).is_err());
    }

    /// Tests bind with port 0 reports the port picked by the OS.
    #[test]
    fn test_bind_reports_assigned_port() {
        let (listener, endpoint) = listener();
        assert_ne!(endpoint.port(), 0);
        assert_eq!(endpoint.ip(), Ipv4Addr::LOCALHOST);
        assert!(!listener.is_secure());
    }

    /// Tests connect/accept populate both endpoints on each side and data
    /// flows in both directions.
    #[test]
    fn test_connect_accept_exchange() {
        let (listener, endpoint) = listener();

        let client = thread::spawn(move || {
            let mut conn = Connection::tcp().unwrap();
            conn.connect(endpoint).unwrap();
            assert!(conn.is_connected());
            assert_eq!(conn.remote_endpoint(), Some(endpoint));
            let local = conn.local_endpoint().unwrap();
            assert_ne!(local.port(), 0);

            conn.send(b"ping").unwrap();
            let mut buf = [0u8; 4];
            let n = conn.receive(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"pong");
            local
        });

        let mut server = listener.accept().unwrap().unwrap();
        assert!(server.is_connected());
        assert!(!server.is_secure());
        assert_eq!(server.local_endpoint(), Some(endpoint));

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += server.receive(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
        server.send(b"pong").unwrap();

        let client_local = client.join().unwrap();
        assert_eq!(server.remote_endpoint(), Some(client_local));
    }

    /// Tests close is idempotent and the connection is unusable afterwards.
    #[test]
    fn test_close_idempotent() {
        let (listener, endpoint) = listener();
        let mut client = Connection::tcp().unwrap();
        client.connect(endpoint).unwrap();
        let mut server = listener.accept().unwrap().unwrap();

        server.close();
        server.close();
        assert!(!server.is_connected());
        assert_eq!(
            server.send(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        let mut buf = [0u8; 8];
        assert_eq!(client.receive(&mut buf).unwrap(), 0);
    }

    /// Tests an explicitly duplicated handle is an independent owner.
    #[test]
    fn test_duplicate_handle() {
        let (listener, endpoint) = listener();
        let mut client = Connection::tcp().unwrap();
        client.connect(endpoint).unwrap();
        let server = listener.accept().unwrap().unwrap();

        let mut copy = server.duplicate().unwrap();
        drop(server);

        assert_eq!(copy.remote_endpoint(), client.local_endpoint());
        copy.send(b"dup").unwrap();
        let mut buf = [0u8; 3];
        let mut read = 0;
        while read < 3 {
            read += client.receive(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"dup");
    }

    /// Tests closing one of two duplicated handles leaves the other open.
    #[test]
    fn test_close_keeps_duplicate_open() {
        let (listener, endpoint) = listener();
        let mut client = Connection::tcp().unwrap();
        client.connect(endpoint).unwrap();
        let mut server = listener.accept().unwrap().unwrap();

        let mut copy = server.duplicate().unwrap();
        server.close();
        assert!(!server.is_connected());

        copy.send(b"still here").unwrap();
        let mut buf = [0u8; 10];
        let mut read = 0;
        while read < buf.len() {
            read += client.receive(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"still here");

        copy.close();
        assert_eq!(client.receive(&mut buf).unwrap(), 0);
    }

    /// Tests a read timeout surfaces as an error rather than blocking.
    #[test]
    fn test_read_timeout() {
        let (listener, endpoint) = listener();
        let mut client = Connection::tcp().unwrap();
        client.connect(endpoint).unwrap();
        let mut server = listener.accept().unwrap().unwrap();

        server
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let err = server.receive(&mut [0u8; 8]).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }
}
