/// Errors that can occur in TCP transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the listening port.
    #[error("failed to bind to {address}:{port}: {source}")]
    Bind {
        address: String,
        port: u16,
        source: std::io::Error,
    },

    /// Failed to resolve or connect to the remote endpoint.
    #[error("failed to connect to {address}:{port}: {source}")]
    Connect {
        address: String,
        port: u16,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
