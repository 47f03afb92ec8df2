use crate::compress::CompressionError;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header carries a tag byte this protocol does not define.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// A `Disconnect` tag arrived without the sentinel byte pattern.
    #[error("disconnect header does not carry the sentinel pattern")]
    MalformedSentinel,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A receive buffer could not be grown to the requested size.
    #[error("failed to grow receive buffer to {requested} bytes")]
    BufferAllocation { requested: usize },

    /// Compressing or inflating a payload failed.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
