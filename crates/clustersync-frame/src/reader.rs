use std::io::{ErrorKind, Read};

use clustersync_transport::NodeStream;
use tracing::debug;

use crate::buffer::GrowBuffer;
use crate::compress::{decompress_into, CompressionError};
use crate::error::{FrameError, Result};
use crate::header::{unframe, FrameConfig, Header, MessageTag, HEADER_SIZE};

/// Minimum read size for headerless (external control) traffic.
const MIN_CHUNK_SIZE: usize = 8 * 1024;

/// A decoded inbound message. Payloads borrow the reader's buffers.
#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    /// A payload (inflated if it was compressed on the wire).
    Data {
        id: i32,
        payload: &'a [u8],
        compressed: bool,
    },
    /// Acknowledgement of a data-transfer package.
    Ack { id: i32 },
    /// The cluster is complete.
    Connected,
    /// The peer is closing the link.
    Disconnect,
    /// No-op / padding header.
    Noop,
}

/// Reads complete messages from any `Read` stream.
///
/// Reads exactly one header, then exactly the announced payload. The receive
/// and inflate buffers only ever grow.
pub struct MessageReader<T> {
    inner: T,
    payload: GrowBuffer,
    inflated: GrowBuffer,
    config: FrameConfig,
}

impl<T: Read> MessageReader<T> {
    /// Create a new message reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            payload: GrowBuffer::with_capacity(config.initial_buffer_size),
            inflated: GrowBuffer::with_capacity(config.initial_buffer_size),
            config,
        }
    }

    /// Read exactly one header (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_header(&mut self) -> Result<(Header, [u8; HEADER_SIZE])> {
        let mut raw = [MessageTag::Default as u8; HEADER_SIZE];
        read_full(&mut self.inner, &mut raw)?;
        Ok((unframe(&raw)?, raw))
    }

    /// Read the next complete message (blocking).
    pub fn read_message(&mut self) -> Result<Message<'_>> {
        let (header, _) = self.read_header()?;

        if !header.tag.carries_payload() {
            // Stray bytes after a control header would desync the stream.
            if header.payload_len > 0 {
                self.read_payload(header.payload_len as usize)?;
            }
            return Ok(match header.tag {
                MessageTag::Ack => Message::Ack { id: header.id },
                MessageTag::Connected => Message::Connected,
                MessageTag::Disconnect => Message::Disconnect,
                _ => Message::Noop,
            });
        }

        let wire_len = header.payload_len as usize;
        self.read_payload(wire_len)?;

        if header.tag == MessageTag::Data {
            return Ok(Message::Data {
                id: header.id,
                payload: self.payload.slice(wire_len),
                compressed: false,
            });
        }

        let original_len = header.original_len as usize;
        self.check_size(original_len)?;
        let grown = self
            .inflated
            .ensure(original_len)
            .map_err(|_| CompressionError::OutOfMemory {
                requested: original_len,
            })?;
        if grown {
            debug!(capacity = original_len, "inflate buffer grown");
        }

        let written = decompress_into(
            self.payload.slice(wire_len),
            self.inflated.slice_mut(original_len),
        )?;
        if written != original_len {
            return Err(CompressionError::Corrupt(format!(
                "inflated {written} bytes, header announced {original_len}"
            ))
            .into());
        }

        Ok(Message::Data {
            id: header.id,
            payload: self.inflated.slice(original_len),
            compressed: true,
        })
    }

    /// Read whatever bytes are available, up to the receive buffer size.
    ///
    /// Used for headerless external control traffic.
    pub fn read_chunk(&mut self) -> Result<&[u8]> {
        self.payload
            .ensure(MIN_CHUNK_SIZE)
            .map_err(|_| FrameError::BufferAllocation {
                requested: MIN_CHUNK_SIZE,
            })?;

        loop {
            match self.inner.read(self.payload.as_mut_slice()) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => return Ok(self.payload.slice(n)),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Grow the receive buffer ahead of time.
    pub fn reserve(&mut self, capacity: usize) -> Result<bool> {
        self.payload
            .ensure(capacity)
            .map_err(|_| FrameError::BufferAllocation {
                requested: capacity,
            })
    }

    /// Receive buffer capacity watermark.
    pub fn payload_capacity(&self) -> usize {
        self.payload.capacity()
    }

    /// Inflate buffer capacity watermark.
    pub fn inflated_capacity(&self) -> usize {
        self.inflated.capacity()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn read_payload(&mut self, len: usize) -> Result<()> {
        self.check_size(len)?;
        let grown = self
            .payload
            .ensure(len)
            .map_err(|_| FrameError::BufferAllocation { requested: len })?;
        if grown {
            debug!(capacity = len, "receive buffer grown");
        }
        read_full(&mut self.inner, self.payload.slice_mut(len))
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }
}

impl MessageReader<NodeStream> {
    /// Create a message reader for `NodeStream` and apply read timeout from config.
    pub fn with_config_stream(inner: NodeStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

fn read_full<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

pub(crate) fn transport_to_frame_error(err: clustersync_transport::TransportError) -> FrameError {
    match err {
        clustersync_transport::TransportError::Io(io)
        | clustersync_transport::TransportError::Accept(io) => FrameError::Io(io),
        clustersync_transport::TransportError::Bind { source, .. }
        | clustersync_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
