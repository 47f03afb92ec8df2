//! External control line protocol.
//!
//! Outside tools connect to the master's control port and type commands.
//! In ASCII mode every `\r\n`-terminated line is one command, answered with
//! `OK\r\n`; CAN, ESC or one of the logout words ends the session.

use std::time::{Duration, Instant};

use clustersync_frame::{
    FrameConfig, FrameError, MessageReader, MessageWriter, DEFAULT_MAX_PAYLOAD,
};
use clustersync_transport::TcpEndpoint;
use tracing::debug;

use crate::error::{NodeError, Result};

/// Reply to every accepted command line.
pub const REPLY_OK: &[u8] = b"OK\r\n";

/// Banner sent to an external control peer once it connects.
pub const GREETING: &[u8] = b"Connected to clustersync!\r\n";

const CAN: char = '\u{18}';
const ESC: char = '\u{1b}';
const LOGOUT_WORDS: [&str; 4] = ["logout", "close", "exit", "quit"];
const LINE_END: &str = "\r\n";

/// Commands extracted from one chunk of input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedInput {
    pub commands: Vec<String>,
    /// The session must end: the peer logged out or overflowed the buffer.
    pub close: bool,
    /// An unterminated line grew past the parser's limit.
    pub overflow: bool,
}

/// Accumulates ASCII control input across reads.
///
/// Unterminated input is buffered up to `limit` bytes; past that the session
/// is closed.
#[derive(Debug)]
pub struct AsciiCommandParser {
    pending: String,
    limit: usize,
}

impl Default for AsciiCommandParser {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PAYLOAD)
    }
}

impl AsciiCommandParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: String::new(),
            limit,
        }
    }

    /// Append `chunk` and extract every complete line.
    ///
    /// A logout request anywhere in the buffered text wins over any complete
    /// lines buffered with it.
    pub fn feed(&mut self, chunk: &[u8]) -> ParsedInput {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        if wants_close(&self.pending) {
            self.pending.clear();
            return ParsedInput {
                close: true,
                ..ParsedInput::default()
            };
        }

        let mut commands = Vec::new();
        while let Some(end) = self.pending.find(LINE_END) {
            commands.push(self.pending[..end].to_string());
            self.pending.drain(..end + LINE_END.len());
        }

        if self.pending.len() > self.limit {
            self.pending.clear();
            return ParsedInput {
                commands,
                close: true,
                overflow: true,
            };
        }

        ParsedInput {
            commands,
            ..ParsedInput::default()
        }
    }

    /// Bytes of an incomplete line still buffered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn wants_close(text: &str) -> bool {
    text.contains(CAN) || text.contains(ESC) || LOGOUT_WORDS.iter().any(|word| text.contains(word))
}

/// Send one command to a master's external control port and collect the reply.
///
/// Returns everything the master sent (greeting included) once the `OK` line
/// arrives, the master hangs up, or `timeout` elapses.
pub fn send_command(address: &str, port: u16, command: &str, timeout: Duration) -> Result<String> {
    let stream = TcpEndpoint::connect(address, port)?;
    let reader_stream = stream.try_clone()?;

    let config = FrameConfig {
        read_timeout: Some(timeout),
        write_timeout: Some(timeout),
        ..FrameConfig::default()
    };
    let mut writer = MessageWriter::with_config_stream(stream, config.clone())?;
    let mut reader = MessageReader::with_config_stream(reader_stream, config)?;

    let line = format!("{}{LINE_END}", command.trim_end());
    writer.send_raw(line.as_bytes())?;
    debug!(address, port, command = %command.trim_end(), "sent external control command");

    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    while !ends_with_ok(&reply) {
        if Instant::now() >= deadline {
            return Err(NodeError::Frame(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply from external control port",
            ))));
        }
        match reader.read_chunk() {
            Ok(chunk) => reply.extend_from_slice(chunk),
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(String::from_utf8_lossy(&reply).into_owned())
}

fn ends_with_ok(reply: &[u8]) -> bool {
    reply.windows(REPLY_OK.len()).any(|window| window == REPLY_OK)
}
