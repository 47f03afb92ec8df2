use clustersync_frame::{CompressionError, FrameError};
use clustersync_transport::TransportError;

use crate::role::ConnectionRole;

/// Errors that can occur in cluster node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A server connection could not bind its listening port.
    #[error("connection {id} ({role}) failed to bind port {port}: {source}")]
    Bind {
        id: usize,
        role: ConnectionRole,
        port: u16,
        source: TransportError,
    },

    /// A client connection stopped dialing before it reached the server.
    #[error("connection {id} ({role}) failed to dial {address}:{port}: {source}")]
    Dial {
        id: usize,
        role: ConnectionRole,
        address: String,
        port: u16,
        source: TransportError,
    },

    /// Writing to a peer failed; the connection is marked disconnected.
    #[error("connection {id} ({role}) send failed: {source}")]
    Send {
        id: usize,
        role: ConnectionRole,
        source: FrameError,
    },

    /// Reading from a peer failed; the session ends.
    #[error("connection {id} ({role}) receive failed: {source}")]
    Receive {
        id: usize,
        role: ConnectionRole,
        source: FrameError,
    },

    /// Compressing an outbound payload failed.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Missing port or address, port reuse, or an invalid topology.
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer sent something the frame-lock protocol does not allow.
    #[error("protocol error on connection {id} ({role}): {detail}")]
    Protocol {
        id: usize,
        role: ConnectionRole,
        detail: String,
    },

    /// The addressed connection has no live session.
    #[error("connection {0} is not connected")]
    NotConnected(usize),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Topology file could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Topology file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
