//! Message framing for cluster connections.
//!
//! Every sync and data-transfer message starts with a fixed 13-byte header:
//! - a 1-byte tag ([`MessageTag`])
//! - a 4-byte little-endian sync frame number or package id
//! - a 4-byte little-endian payload length (bytes actually on the wire)
//! - a 4-byte little-endian original length (compressed payloads only)
//!
//! Payloads may be DEFLATE-compressed (zlib container). Receive buffers only
//! ever grow, so jittery payload sizes never cause reallocation churn.

pub mod buffer;
pub mod compress;
pub mod error;
pub mod header;
pub mod reader;
pub mod writer;

pub use buffer::GrowBuffer;
pub use compress::{compress_bound, compress_into, decompress_into, CompressionError, CompressionLevel};
pub use error::{FrameError, Result};
pub use header::{
    frame_payload, is_disconnect_sentinel, unframe, FrameConfig, Header, MessageTag,
    DEFAULT_MAX_PAYLOAD, DISCONNECT_SENTINEL, HEADER_SIZE,
};
pub use reader::{Message, MessageReader};
pub use writer::MessageWriter;
