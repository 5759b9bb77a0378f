use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RcpError>;

#[derive(Error, Debug)]
pub enum RcpError {
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("path {} escapes root", path.display())]
    PathEscape { path: PathBuf },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("short read: received {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },
    #[error("unexpected end-of-file marker: {0}")]
    UnexpectedTerminator(u8),
    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RcpError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Warnings the legacy protocol tolerates without ending the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ShortRead { .. } | Self::UnexpectedTerminator(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_size_and_terminator_mismatches_are_recoverable() {
        assert!(RcpError::ShortRead { expected: 5, received: 2 }.is_recoverable());
        assert!(RcpError::UnexpectedTerminator(7).is_recoverable());
        assert!(!RcpError::MalformedCommand("x".into()).is_recoverable());
        assert!(!RcpError::PathEscape { path: "/etc".into() }.is_recoverable());
        assert!(!RcpError::Timeout {
            op: "read",
            after: Duration::from_secs(1)
        }
        .is_recoverable());
    }

    #[test]
    fn filesystem_error_names_the_path() {
        let e = RcpError::fs(
            "/srv/data/a.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = e.to_string();
        assert!(msg.contains("/srv/data/a.txt"));
        assert!(msg.contains("denied"));
    }
}
