//! Shared protocol constants and the `C` control line for rcp transfers

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};

use crate::error::{RcpError, Result};

// Command prefixes carried in the fourth preamble field (trailing space is significant)
pub const RECEIVE_PREFIX: &str = "rcp -t ";
pub const SEND_PREFIX: &str = "rcp -f ";

// Marker that must appear in the preamble before it can be considered complete
pub const COMMAND_MARKER: &[u8] = b"rcp ";

// Preamble bytes accepted before the command is declared malformed
pub const MAX_PREAMBLE: usize = 64 * 1024;

// Working buffer for file payloads in both directions
pub const CHUNK_SIZE: usize = 32 * 1024;

// Directories created on behalf of a receive session
pub const DIR_MODE: u32 = 0o755;

pub mod status {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
}

// Control line tags
pub mod line {
    pub const FILE: u8 = b'C';
    pub const END: u8 = b'E';
}

pub mod timeouts {
    use std::time::Duration;

    // Rolling window applied to every read/write after the preamble
    pub const IO_SECS: u64 = 30;

    // Total budget for receiving the preamble, measured from accept
    pub const PREAMBLE_SECS: u64 = 30;

    // Pause between the two handshake status bytes of a receive session
    pub const HANDSHAKE_GAP: Duration = Duration::from_millis(100);
}

/// A single file announcement: `C<mode> <size> <name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Permission bits only; setuid, setgid and sticky are never honored.
    pub mode: u32,
    pub size: i64,
    /// Raw name bytes as sent by the peer, not necessarily UTF-8.
    pub name: OsString,
}

impl FileHeader {
    /// Parse a trimmed control line starting with `C`.
    ///
    /// The name is everything after the second space, so it may itself
    /// contain spaces.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let body = line
            .strip_prefix(&[self::line::FILE])
            .ok_or_else(|| violation("not a file header", line))?
            .trim_ascii();

        let mut parts = body.splitn(3, |b| *b == b' ');
        let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(violation("invalid file info format", line));
        };

        let mode = std::str::from_utf8(mode)
            .ok()
            .and_then(|m| u32::from_str_radix(m, 8).ok())
            .ok_or_else(|| violation("invalid file mode", mode))?;
        let size: i64 = std::str::from_utf8(size)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| violation("invalid file size", size))?;
        if size < 0 {
            return Err(RcpError::ProtocolViolation(format!("negative file size {size}")));
        }
        if name.is_empty() {
            return Err(RcpError::ProtocolViolation("empty file name".into()));
        }

        Ok(Self {
            mode: mode & 0o777,
            size,
            name: name_from_wire(name),
        })
    }

    /// Encode as sent by the source side, permission bits only.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("C{:04o} {} ", self.mode & 0o777, self.size).into_bytes();
        out.extend_from_slice(&name_to_wire(&self.name));
        out.push(b'\n');
        out
    }
}

fn violation(what: &str, raw: &[u8]) -> RcpError {
    RcpError::ProtocolViolation(format!("{what}: {:?}", String::from_utf8_lossy(raw)))
}

#[cfg(unix)]
fn name_from_wire(raw: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(raw.to_vec())
}

#[cfg(not(unix))]
fn name_from_wire(raw: &[u8]) -> OsString {
    String::from_utf8_lossy(raw).into_owned().into()
}

#[cfg(unix)]
fn name_to_wire(name: &OsStr) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(name.as_bytes())
}

#[cfg(not(unix))]
fn name_to_wire(name: &OsStr) -> Cow<'_, [u8]> {
    Cow::Owned(name.to_string_lossy().into_owned().into_bytes())
}
