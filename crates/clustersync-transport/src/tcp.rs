use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::NodeStream;

/// How long a wake-up dial to our own listener may take before giving up.
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// TCP listening endpoint for the server side of a cluster connection.
///
/// Provides bind/accept for the server and a blocking dial for clients.
pub struct TcpEndpoint {
    listener: TcpListener,
    address: String,
    port: u16,
}

impl TcpEndpoint {
    /// Wildcard address used by servers (listen on every interface).
    pub const ANY_ADDRESS: &'static str = "0.0.0.0";

    /// Bind and listen on `address:port`.
    ///
    /// Port `0` asks the OS for an ephemeral port; [`TcpEndpoint::port`]
    /// reports the one actually bound.
    pub fn bind(address: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((address, port)).map_err(|e| TransportError::Bind {
            address: address.to_string(),
            port,
            source: e,
        })?;

        let bound_port = listener
            .local_addr()
            .map_err(|e| TransportError::Bind {
                address: address.to_string(),
                port,
                source: e,
            })?
            .port();

        info!(address, port = bound_port, "listening on tcp port");

        Ok(Self {
            listener,
            address: address.to_string(),
            port: bound_port,
        })
    }

    /// Accept an incoming connection (blocking).
    ///
    /// Interrupted system calls are retried.
    pub fn accept(&self) -> Result<NodeStream> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, port = self.port, "accepted connection");
                    return Ok(NodeStream::from_tcp(stream));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    debug!(port = self.port, "re-accept after interrupted system call");
                    continue;
                }
                Err(err) => return Err(TransportError::Accept(err)),
            }
        }
    }

    /// Connect to a listening endpoint (blocking, single attempt).
    pub fn connect(address: &str, port: u16) -> Result<NodeStream> {
        let connect_err = |source| TransportError::Connect {
            address: address.to_string(),
            port,
            source,
        };

        let addrs: Vec<SocketAddr> = (address, port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .filter(SocketAddr::is_ipv4)
            .collect();

        let mut last_err = std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            "address resolved to no IPv4 endpoints",
        );
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    debug!(%addr, "connected to tcp endpoint");
                    return Ok(NodeStream::from_tcp(stream));
                }
                Err(err) => last_err = err,
            }
        }

        Err(connect_err(last_err))
    }

    /// Unblock a thread parked in [`TcpEndpoint::accept`].
    ///
    /// Dials the listener over loopback; the accepting side is expected to
    /// check its own termination flag before using the stream it gets back.
    pub fn wake(&self) {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        match TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
            Ok(_) => debug!(port = self.port, "woke blocked acceptor"),
            Err(err) => debug!(port = self.port, error = %err, "acceptor wake-up dial failed"),
        }
    }

    /// The port this endpoint is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address this endpoint is bound to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEndpoint")
            .field("address", &self.address)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::Shutdown;

    #[test]
    fn test_bind_accept_connect() {
        let listener = TcpEndpoint::bind("127.0.0.1", 0).unwrap();
        let port = listener.port();
        assert_ne!(port, 0);

        let handle = std::thread::spawn(move || {
            let mut client = TcpEndpoint::connect("127.0.0.1", port).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_bind_port_in_use() {
        let first = TcpEndpoint::bind("127.0.0.1", 0).unwrap();
        let result = TcpEndpoint::bind("127.0.0.1", first.port());
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let scratch = TcpEndpoint::bind("127.0.0.1", 0).unwrap();
            scratch.port()
        };
        let result = TcpEndpoint::connect("127.0.0.1", port);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn test_wake_unblocks_accept() {
        let listener = std::sync::Arc::new(TcpEndpoint::bind("127.0.0.1", 0).unwrap());
        let acceptor = {
            let listener = std::sync::Arc::clone(&listener);
            std::thread::spawn(move || listener.accept().is_ok())
        };

        std::thread::sleep(Duration::from_millis(50));
        listener.wake();
        assert!(acceptor.join().unwrap());
    }

    #[test]
    fn test_shutdown_unblocks_reader_clone() {
        let listener = TcpEndpoint::bind("127.0.0.1", 0).unwrap();
        let port = listener.port();
        let _client = TcpEndpoint::connect("127.0.0.1", port).unwrap();
        let server = listener.accept().unwrap();
        let mut reader = server.try_clone().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).unwrap_or(0)
        });

        std::thread::sleep(Duration::from_millis(50));
        server.shutdown(Shutdown::Both).unwrap();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn test_socket_options_apply() {
        let listener = TcpEndpoint::bind("127.0.0.1", 0).unwrap();
        let client = TcpEndpoint::connect("127.0.0.1", listener.port()).unwrap();
        client.set_nodelay(true).unwrap();
        client.set_keepalive(true).unwrap();
        assert!(client.peer_addr().is_ok());
    }
}
