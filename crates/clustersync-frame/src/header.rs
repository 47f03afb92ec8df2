use bytes::{BufMut, Bytes, BytesMut};

use tracing::debug;

use crate::compress::{compress_bound, compress_into, CompressionError, CompressionLevel};
use crate::error::{FrameError, Result};

/// Header: tag (1) + id (4) + payload length (4) + original length (4) = 13 bytes.
pub const HEADER_SIZE: usize = 13;

/// Default maximum payload size: 256 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 256 * 1024 * 1024;

/// Header sent by a peer that is closing the link gracefully.
///
/// The first 8 bytes are the recognizable part: the `Disconnect` tag, CAN,
/// CR LF, ESC, CR LF, NUL. Receivers ignore the remaining bytes.
pub const DISCONNECT_SENTINEL: [u8; HEADER_SIZE] = [
    MessageTag::Disconnect as u8,
    0x18,
    b'\r',
    b'\n',
    0x1B,
    b'\r',
    b'\n',
    0x00,
    MessageTag::Default as u8,
    MessageTag::Default as u8,
    MessageTag::Default as u8,
    MessageTag::Default as u8,
    MessageTag::Default as u8,
];

/// Message type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    /// No-op / padding byte.
    Default = 0,
    /// Data-transfer acknowledgement.
    Ack = 6,
    /// Uncompressed payload.
    Data = 17,
    /// Cluster-complete notification.
    Connected = 18,
    /// Graceful shutdown sentinel.
    Disconnect = 19,
    /// DEFLATE-compressed payload.
    CompressedData = 21,
}

impl MessageTag {
    /// Parse a tag byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Default),
            6 => Ok(Self::Ack),
            17 => Ok(Self::Data),
            18 => Ok(Self::Connected),
            19 => Ok(Self::Disconnect),
            21 => Ok(Self::CompressedData),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    /// Whether a payload follows a header with this tag.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Data | Self::CompressedData)
    }
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type.
    pub tag: MessageTag,
    /// Sync frame number (sync role) or package id (data-transfer role).
    pub id: i32,
    /// Number of payload bytes following the header on the wire.
    pub payload_len: u32,
    /// Uncompressed payload length. Zero unless `tag` is `CompressedData`.
    pub original_len: u32,
}

impl Header {
    /// Header for an uncompressed payload of `payload_len` bytes.
    pub fn data(id: i32, payload_len: u32) -> Self {
        Self {
            tag: MessageTag::Data,
            id,
            payload_len,
            original_len: 0,
        }
    }

    /// Zero-payload "ready" message a client stamps with its own frame counter.
    pub fn client_ready(frame: i32) -> Self {
        Self::data(frame, 0)
    }

    /// Acknowledgement of a received data-transfer package.
    pub fn ack(package_id: i32) -> Self {
        Self {
            tag: MessageTag::Ack,
            id: package_id,
            payload_len: 0,
            original_len: 0,
        }
    }

    /// Cluster-complete notification.
    pub fn connected() -> Self {
        Self {
            tag: MessageTag::Connected,
            id: 0,
            payload_len: 0,
            original_len: 0,
        }
    }

    /// Encode into the 13-byte wire layout.
    ///
    /// ```text
    /// ┌─────────┬──────────────┬───────────────┬────────────────┐
    /// │ Tag     │ Frame / id   │ Payload len   │ Original len   │
    /// │ (1B)    │ (4B LE i32)  │ (4B LE u32)   │ (4B LE u32)    │
    /// └─────────┴──────────────┴───────────────┴────────────────┘
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [MessageTag::Default as u8; HEADER_SIZE];
        out[0] = self.tag as u8;
        out[1..5].copy_from_slice(&self.id.to_le_bytes());
        out[5..9].copy_from_slice(&self.payload_len.to_le_bytes());
        if self.tag == MessageTag::CompressedData {
            out[9..13].copy_from_slice(&self.original_len.to_le_bytes());
        }
        out
    }
}

/// Returns true if `header` starts with the disconnect sentinel pattern.
pub fn is_disconnect_sentinel(header: &[u8]) -> bool {
    header.len() >= 8 && header[..8] == DISCONNECT_SENTINEL[..8]
}

/// Parse a raw header. Pure, no I/O.
///
/// A disconnect sentinel decodes to a `Disconnect` header with zero lengths,
/// whatever its length fields contain.
pub fn unframe(raw: &[u8; HEADER_SIZE]) -> Result<Header> {
    let tag = MessageTag::from_byte(raw[0])?;
    let id = i32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);

    if tag == MessageTag::Disconnect {
        if !is_disconnect_sentinel(raw) {
            return Err(FrameError::MalformedSentinel);
        }
        return Ok(Header {
            tag,
            id,
            payload_len: 0,
            original_len: 0,
        });
    }

    let payload_len = u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]);
    let original_len = if tag == MessageTag::CompressedData {
        u32::from_le_bytes([raw[9], raw[10], raw[11], raw[12]])
    } else {
        0
    };

    Ok(Header {
        tag,
        id,
        payload_len,
        original_len,
    })
}

/// Frame a payload: header followed by the payload bytes.
///
/// With `compression` set, the payload is deflated into a buffer sized by
/// [`compress_bound`], the tag becomes `CompressedData` and the header's
/// fourth field carries the original length so the receiver can size its
/// inflate buffer up front.
pub fn frame_payload(
    payload: &[u8],
    id: i32,
    compression: Option<CompressionLevel>,
) -> Result<Bytes> {
    let original_len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    let Some(level) = compression else {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        dst.put_slice(&Header::data(id, original_len).encode());
        dst.put_slice(payload);
        return Ok(dst.freeze());
    };

    let capacity = HEADER_SIZE + compress_bound(payload.len());
    let mut dst = Vec::new();
    dst.try_reserve_exact(capacity)
        .map_err(|_| CompressionError::OutOfMemory { requested: capacity })?;
    dst.resize(capacity, 0);

    let written = compress_into(payload, &mut dst[HEADER_SIZE..], level)?;
    dst.truncate(HEADER_SIZE + written);
    debug!(
        id,
        original = payload.len(),
        compressed = written,
        level = level.get(),
        "payload compressed"
    );

    let header = Header {
        tag: MessageTag::CompressedData,
        id,
        payload_len: written as u32,
        original_len,
    };
    dst[..HEADER_SIZE].copy_from_slice(&header.encode());

    Ok(Bytes::from(dst))
}

/// Configuration for the message reader and writer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes (wire or inflated). Default: 256 MiB.
    pub max_payload_size: usize,
    /// Initial size of the receive buffer. Default: 1 KiB.
    pub initial_buffer_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            initial_buffer_size: 1024,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
