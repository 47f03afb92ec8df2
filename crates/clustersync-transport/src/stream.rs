use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A connected node stream, usable through `Read` and `Write`.
///
/// This is the fundamental I/O type returned by transport operations.
/// Clones share the same socket, so shutting down one clone unblocks a reader
/// parked on another.
pub struct NodeStream {
    inner: TcpStream,
}

impl Read for NodeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for NodeStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl NodeStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self { inner: stream }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Enable or disable `TCP_NODELAY` (disabling Nagle's algorithm).
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.inner.set_nodelay(nodelay).map_err(Into::into)
    }

    /// Enable `SO_KEEPALIVE` on the socket.
    #[cfg(unix)]
    pub fn set_keepalive(&self, enabled: bool) -> Result<()> {
        use std::os::fd::AsRawFd;

        let fd = self.inner.as_raw_fd();
        let flag: libc::c_int = i32::from(enabled);

        // SAFETY: `flag` is a valid readable c_int for the given length and `fd`
        // is an open TCP socket owned by this stream.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                (&flag as *const libc::c_int).cast::<libc::c_void>(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }

    /// Enable `SO_KEEPALIVE` on the socket.
    ///
    /// No-op on platforms without a libc socket API.
    #[cfg(not(unix))]
    pub fn set_keepalive(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    /// Shut down the read half, write half or both halves of the connection.
    ///
    /// `NotConnected` is treated as success: the peer is already gone.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        match self.inner.shutdown(how) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self::from_tcp(cloned))
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }

    /// Local address of this end of the connection.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Into::into)
    }
}

impl std::fmt::Debug for NodeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStream")
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}
