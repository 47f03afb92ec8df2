//! DEFLATE compression for data-transfer payloads.
//!
//! Streams use the zlib container, so they interoperate with peers that
//! compress via `compress2` and inflate via `uncompress`.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Failure classes reported by the compressor and inflater.
///
/// None of these are fatal to a connection: the sender skips the update and
/// the receiver drops the message without acknowledging it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    /// The destination buffer cannot hold the output.
    #[error("destination buffer not large enough ({available} bytes)")]
    BufferTooSmall { available: usize },

    /// Memory for the output buffer could not be allocated.
    #[error("insufficient memory for {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The requested compression level is outside `0..=9`.
    #[error("incorrect compression level {0}")]
    BadLevel(u32),

    /// The compressed stream is malformed or truncated.
    #[error("corrupted data: {0}")]
    Corrupt(String),

    /// Any other codec failure.
    #[error("unknown compression error: {0}")]
    Unknown(String),
}

/// A validated DEFLATE compression level (`0..=9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// Store only, no compression.
    pub const NONE: Self = Self(0);
    /// Fastest compression.
    pub const BEST_SPEED: Self = Self(1);
    /// zlib's default trade-off.
    pub const DEFAULT: Self = Self(6);
    /// Smallest output.
    pub const BEST: Self = Self(9);

    /// Validate a raw level.
    pub fn new(level: u32) -> Result<Self, CompressionError> {
        if level > 9 {
            return Err(CompressionError::BadLevel(level));
        }
        Ok(Self(level))
    }

    /// The raw level value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::BEST_SPEED
    }
}

/// Upper bound on the compressed size of `len` input bytes.
///
/// Same formula as zlib's `compressBound`.
pub fn compress_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Compress `src` into `dst`, returning the number of bytes written.
///
/// `dst` should be at least [`compress_bound`]`(src.len())` bytes long.
pub fn compress_into(
    src: &[u8],
    dst: &mut [u8],
    level: CompressionLevel,
) -> Result<usize, CompressionError> {
    let mut encoder = Compress::new(Compression::new(level.get()), true);
    match encoder.compress(src, dst, FlushCompress::Finish) {
        Ok(Status::StreamEnd) => Ok(encoder.total_out() as usize),
        Ok(Status::Ok | Status::BufError) => Err(CompressionError::BufferTooSmall {
            available: dst.len(),
        }),
        Err(err) => Err(CompressionError::Unknown(err.to_string())),
    }
}

/// Inflate `src` into `dst`, returning the number of bytes written.
///
/// `dst` must be sized to the original length announced by the sender.
pub fn decompress_into(src: &[u8], dst: &mut [u8]) -> Result<usize, CompressionError> {
    if dst.is_empty() {
        return Ok(0);
    }

    let mut decoder = Decompress::new(true);
    match decoder.decompress(src, dst, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => Ok(decoder.total_out() as usize),
        Ok(Status::Ok | Status::BufError) => {
            if decoder.total_out() as usize >= dst.len() {
                Err(CompressionError::BufferTooSmall {
                    available: dst.len(),
                })
            } else {
                Err(CompressionError::Corrupt("truncated stream".to_string()))
            }
        }
        Err(err) => Err(CompressionError::Corrupt(err.to_string())),
    }
}
