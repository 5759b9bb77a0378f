//! Send side of the protocol (`rcp -f`): the client pulls a single file

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{RcpError, Result};
use crate::frame_io::FrameIo;
use crate::path_guard::{PathResolver, ResolvedPath};
use crate::protocol::{status, FileHeader, CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub path: PathBuf,
    pub declared: u64,
    pub sent: u64,
}

pub struct SendSession<'a, S> {
    io: &'a mut FrameIo<S>,
    source: ResolvedPath,
}

impl<'a, S> SendSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Resolve the source path. Containment failures are silent on the wire,
    /// like the receive side.
    pub fn open(io: &'a mut FrameIo<S>, resolver: &PathResolver, raw_source: &str) -> Result<Self> {
        let source = resolver.resolve(raw_source)?;
        debug!(source = %source.as_path().display(), "resolved source path");
        Ok(Self { io, source })
    }

    pub async fn run(self) -> Result<SendSummary> {
        let path = self.source.as_path().to_path_buf();
        let (file, header) = match open_source(&path).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %path.display(), "cannot send file: {e}");
                self.io.write_status(status::FAILURE).await?;
                return Err(e);
            }
        };
        self.transfer(file, header).await
    }

    async fn transfer(self, mut file: File, header: FileHeader) -> Result<SendSummary> {
        let path = self.source.as_path();

        self.io.write_status(status::OK).await?;
        let line = header.encode();
        self.io.write_all(&line).await?;
        debug!(header = %String::from_utf8_lossy(&line).trim_end(), "sent file info");

        match self.io.read_byte().await? {
            status::OK => {}
            other => {
                return Err(RcpError::ProtocolViolation(format!(
                    "client rejected file info with status {other}"
                )))
            }
        }

        let declared = header.size as u64;
        let mut sent = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while sent < declared {
            let want = (declared - sent).min(CHUNK_SIZE as u64) as usize;
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| RcpError::fs(path, e))?;
            if n == 0 {
                break;
            }
            self.io.write_all(&buf[..n]).await?;
            sent += n as u64;
        }
        if sent != declared {
            warn!(path = %path.display(), sent, declared, "source ended before declared size");
        }

        self.io.write_status(status::OK).await?;
        match self.io.read_byte().await {
            Ok(status::OK) => {}
            Ok(other) => warn!("final acknowledgement was {other}"),
            Err(e) => warn!("no final acknowledgement from client: {e}"),
        }
        info!(path = %path.display(), sent, "file sent");

        Ok(SendSummary {
            path: path.to_path_buf(),
            declared,
            sent,
        })
    }
}

async fn open_source(path: &Path) -> Result<(File, FileHeader)> {
    let file = File::open(path).await.map_err(|e| RcpError::fs(path, e))?;
    let md = file.metadata().await.map_err(|e| RcpError::fs(path, e))?;
    if !md.is_file() {
        return Err(RcpError::fs(
            path,
            std::io::Error::new(std::io::ErrorKind::Other, "not a regular file"),
        ));
    }

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        md.permissions().mode() & 0o777
    };
    #[cfg(not(unix))]
    let mode = if md.permissions().readonly() { 0o444 } else { 0o644 };

    let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let header = FileHeader {
        mode,
        size: md.len() as i64,
        name,
    };
    Ok((file, header))
}
