use std::io::{ErrorKind, Write};

use clustersync_transport::NodeStream;
use tracing::debug;

use crate::compress::CompressionLevel;
use crate::error::{FrameError, Result};
use crate::header::{frame_payload, FrameConfig, Header, DISCONNECT_SENTINEL};
use crate::reader::transport_to_frame_error;

/// Writes complete messages to any `Write` stream.
///
/// Every send fully drains: it keeps writing until all bytes are flushed or
/// the stream reports an unrecoverable error.
pub struct MessageWriter<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: Write> MessageWriter<T> {
    /// Create a new message writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Write pre-framed bytes (blocking).
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            match self.inner.write(&bytes[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // a blocking stream reports an expired write timeout as WouldBlock
                Err(err) => {
                    debug!(written = offset, total = bytes.len(), error = %err, "send failed");
                    return Err(FrameError::Io(err));
                }
            }
        }

        self.flush()
    }

    /// Write a header-only message.
    pub fn send_header(&mut self, header: &Header) -> Result<()> {
        self.send_raw(&header.encode())
    }

    /// Frame, optionally compress, and send a payload.
    pub fn send_payload(
        &mut self,
        payload: &[u8],
        id: i32,
        compression: Option<CompressionLevel>,
    ) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let framed = frame_payload(payload, id, compression)?;
        self.send_raw(&framed)
    }

    /// Send the disconnect sentinel.
    pub fn send_disconnect(&mut self) -> Result<()> {
        self.send_raw(&DISCONNECT_SENTINEL)
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl MessageWriter<NodeStream> {
    /// Create a message writer for `NodeStream` and apply write timeout from config.
    pub fn with_config_stream(inner: NodeStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
