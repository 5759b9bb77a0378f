//! Preamble scanning and command classification
//!
//! An rsh-style client opens with four NUL-terminated fields:
//! `<stderr-port>\0<client-user>\0<server-user>\0<command>\0`. The bytes
//! ahead of the command are not line oriented, so the scan is byte at a
//! time until the buffer both contains `rcp ` and ends in NUL.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::error::{RcpError, Result};
use crate::frame_io::FrameIo;
use crate::protocol::{COMMAND_MARKER, MAX_PREAMBLE, RECEIVE_PREFIX, SEND_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `rcp -t <target>`: the client pushes files into `target`.
    Receive(String),
    /// `rcp -f <source>`: the client pulls `source`.
    Send(String),
}

impl Command {
    pub fn parse(text: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(text)
            .map_err(|_| RcpError::MalformedCommand("command is not UTF-8".into()))?;
        if let Some(path) = text.strip_prefix(RECEIVE_PREFIX) {
            Ok(Command::Receive(path.to_string()))
        } else if let Some(path) = text.strip_prefix(SEND_PREFIX) {
            Ok(Command::Send(path.to_string()))
        } else {
            Err(RcpError::MalformedCommand(format!("unknown command {text:?}")))
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Receive(p) => write!(f, "{RECEIVE_PREFIX}{p}"),
            Command::Send(p) => write!(f, "{SEND_PREFIX}{p}"),
        }
    }
}

/// The four rsh fields, command already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub stderr_port: String,
    pub client_user: String,
    pub server_user: String,
    pub command: Command,
}

impl Preamble {
    /// Split a completed preamble buffer on NUL and classify field 3.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let fields: Vec<&[u8]> = raw.split(|b| *b == 0).collect();
        if fields.len() < 4 {
            return Err(RcpError::MalformedCommand(format!(
                "expected 4 fields, got {}",
                fields.len()
            )));
        }
        let lossy = |b: &[u8]| String::from_utf8_lossy(b).into_owned();
        Ok(Self {
            stderr_port: lossy(fields[0]),
            client_user: lossy(fields[1]),
            server_user: lossy(fields[2]),
            command: Command::parse(fields[3])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    ScanningPreamble,
    CommandComplete,
}

/// Accumulates preamble bytes until the command is complete.
#[derive(Debug, Default)]
pub struct PreambleScanner {
    buf: Vec<u8>,
}

impl PreambleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Result<ScanState> {
        if self.buf.len() >= MAX_PREAMBLE {
            return Err(RcpError::MalformedCommand(format!(
                "preamble exceeds {MAX_PREAMBLE} bytes"
            )));
        }
        self.buf.push(byte);
        if byte == 0 && contains(&self.buf, COMMAND_MARKER) {
            Ok(ScanState::CommandComplete)
        } else {
            Ok(ScanState::ScanningPreamble)
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Read the preamble within `budget` of `started`.
///
/// `Ok(None)` means the peer closed before sending a complete command.
pub async fn read_preamble<S>(
    io: &mut FrameIo<S>,
    started: Instant,
    budget: Duration,
) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut scanner = PreambleScanner::new();
    loop {
        let Some(byte) = io.read_byte_within(started, budget).await? else {
            tracing::debug!(partial = scanner.bytes().len(), "peer closed during preamble");
            return Ok(None);
        };
        if scanner.push(byte)? == ScanState::CommandComplete {
            return Ok(Some(scanner.into_bytes()));
        }
    }
}

/// Render bytes as a hex dump for debug logging.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x} ", i * 16));
        for b in chunk {
            out.push_str(&format!(" {b:02x}"));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}
