//! Receive side of the protocol (`rcp -t`): the client pushes files to us

use std::path::{Path, PathBuf};

use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{RcpError, Result};
use crate::frame_io::FrameIo;
use crate::logger::TransferLogger;
use crate::path_guard::{PathResolver, ResolvedPath};
use crate::protocol::{line, status, timeouts, FileHeader, CHUNK_SIZE, DIR_MODE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub declared: u64,
    pub received: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub files: Vec<ReceivedFile>,
}

impl ReceiveSummary {
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.received).sum()
    }
}

pub struct ReceiveSession<'a, S> {
    io: &'a mut FrameIo<S>,
    resolver: &'a PathResolver,
    logger: &'a dyn TransferLogger,
    peer: &'a str,
    target: ResolvedPath,
    summary: ReceiveSummary,
}

impl<'a, S> ReceiveSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Resolve the target directory. Nothing is written to the peer on
    /// failure; the caller just drops the connection.
    pub fn open(
        io: &'a mut FrameIo<S>,
        resolver: &'a PathResolver,
        logger: &'a dyn TransferLogger,
        peer: &'a str,
        raw_target: &str,
    ) -> Result<Self> {
        let target = resolver.resolve(raw_target)?;
        debug!(target = %target.as_path().display(), "resolved target path");
        Ok(Self {
            io,
            resolver,
            logger,
            peer,
            target,
            summary: ReceiveSummary::default(),
        })
    }

    pub async fn run(mut self) -> Result<ReceiveSummary> {
        self.handshake().await?;

        loop {
            let raw = self.io.read_line().await?;
            if raw.is_empty() {
                info!("peer closed, ending transfer");
                break;
            }
            let ctl = raw.trim_ascii();
            debug!(line = %String::from_utf8_lossy(ctl), "control line");

            match ctl.first() {
                Some(&line::FILE) => {
                    let file = self.receive_file(ctl).await?;
                    self.logger.received(self.peer, &file.path, file.received);
                    self.summary.files.push(file);
                }
                Some(&line::END) => {
                    self.io.write_status(status::OK).await?;
                    info!(files = self.summary.files.len(), "end of transfer");
                    break;
                }
                _ => {
                    warn!(line = %String::from_utf8_lossy(ctl), "unexpected control line ignored");
                }
            }
        }
        Ok(self.summary)
    }

    async fn handshake(&mut self) -> Result<()> {
        self.io.write_status(status::OK).await?;
        tokio::time::sleep(timeouts::HANDSHAKE_GAP).await;
        self.io.write_status(status::OK).await?;
        debug!("sent handshake acknowledgements");
        Ok(())
    }

    async fn receive_file(&mut self, ctl: &[u8]) -> Result<ReceivedFile> {
        let header = FileHeader::parse(ctl)?;
        let dest = self.resolver.resolve_within(&self.target, &header.name)?;
        let path = dest.as_path();
        info!(
            path = %path.display(),
            mode = %format!("{:04o}", header.mode),
            size = header.size,
            "receiving file"
        );

        if let Some(parent) = path.parent() {
            create_dirs(parent).await?;
        }
        let mut file = create_file(path, header.mode).await?;
        self.io.write_status(status::OK).await?;

        let declared = header.size as u64;
        let mut received = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while received < declared {
            let want = (declared - received).min(CHUNK_SIZE as u64) as usize;
            let n = self.io.read_exact_or_eof(&mut buf[..want]).await?;
            if n > 0 {
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| RcpError::fs(path, e))?;
                received += n as u64;
            }
            if n < want {
                break;
            }
        }
        file.flush().await.map_err(|e| RcpError::fs(path, e))?;
        drop(file);

        if received != declared {
            tolerate(
                path,
                RcpError::ShortRead {
                    expected: declared,
                    received,
                },
            )?;
        }

        match self.io.read_byte().await {
            Ok(status::OK) => {}
            Ok(other) => tolerate(path, RcpError::UnexpectedTerminator(other))?,
            Err(e) => warn!("error reading end-of-file marker: {e}"),
        }

        self.io.write_status(status::OK).await?;
        info!(path = %path.display(), received, "file transfer completed");

        Ok(ReceivedFile {
            path: path.to_path_buf(),
            declared,
            received,
        })
    }
}

/// Log a recoverable mismatch and carry on; anything else ends the session.
fn tolerate(path: &Path, err: RcpError) -> Result<()> {
    if err.is_recoverable() {
        warn!(path = %path.display(), "{err}");
        Ok(())
    } else {
        Err(err)
    }
}

async fn create_dirs(dir: &Path) -> Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir).await.map_err(|e| RcpError::fs(dir, e))
}

/// Create or truncate `path`, leaving its permission bits equal to `mode`
/// even when the file already existed or the umask would mask them. Only the
/// `0o777` bits are ever applied.
async fn create_file(path: &Path, mode: u32) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(mode & 0o777);
    let file = opts.open(path).await.map_err(|e| RcpError::fs(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode & 0o777))
            .await
            .map_err(|e| RcpError::fs(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(file)
}
