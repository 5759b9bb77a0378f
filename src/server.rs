//! Accept loop and per-connection orchestration
//!
//! Each accepted stream gets its own task. Inside a task everything is
//! sequential: preamble, command, then exactly one receive or send session.
//! Dropping the session's [`FrameIo`] closes the connection on every path.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::command::{hex_dump, read_preamble, Command, Preamble};
use crate::config::ServerConfig;
use crate::error::RcpError;
use crate::frame_io::FrameIo;
use crate::logger::{NoopLogger, TextLogger, TransferLogger};
use crate::path_guard::PathResolver;
use crate::sink::{ReceiveSession, ReceiveSummary};
use crate::source::{SendSession, SendSummary};

/// Shared, read-only state handed to every connection task.
pub struct ServerContext {
    pub config: ServerConfig,
    pub resolver: PathResolver,
    pub logger: Arc<dyn TransferLogger>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, logger: Arc<dyn TransferLogger>) -> Self {
        let resolver = PathResolver::new(config.root.clone(), config.strict_symlinks);
        Self {
            config,
            resolver,
            logger,
        }
    }

    /// Build the audit logger named in the config, or a no-op one.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let logger: Arc<dyn TransferLogger> = match &config.transfer_log {
            Some(path) => Arc::new(
                TextLogger::new(path)
                    .with_context(|| format!("Failed to open transfer log: {}", path.display()))?,
            ),
            None => Arc::new(NoopLogger),
        };
        Ok(Self::new(config, logger))
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Peer went away before sending a complete command.
    Abandoned,
    Received(ReceiveSummary),
    Sent(SendSummary),
}

/// Drive one connection from preamble to the end of its session.
pub async fn handle_connection<S>(
    stream: S,
    peer: &str,
    ctx: &ServerContext,
) -> std::result::Result<Outcome, RcpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut io = FrameIo::new(stream, ctx.config.io_timeout);

    let raw = match read_preamble(&mut io, started, ctx.config.preamble_timeout).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(Outcome::Abandoned),
        Err(e @ RcpError::Timeout { .. }) => {
            warn!("timeout waiting for full command: {e}");
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    debug!("received full command:\n{}", hex_dump(&raw));

    let preamble = Preamble::parse(&raw)?;
    info!(
        client_user = %preamble.client_user,
        server_user = %preamble.server_user,
        command = %preamble.command,
        "command received"
    );
    ctx.logger.connect(peer, &preamble.command);

    let outcome = match preamble.command {
        Command::Receive(target) => {
            let session =
                ReceiveSession::open(&mut io, &ctx.resolver, ctx.logger.as_ref(), peer, &target)?;
            Outcome::Received(session.run().await?)
        }
        Command::Send(source) => {
            let session = SendSession::open(&mut io, &ctx.resolver, &source)?;
            let summary = session.run().await?;
            ctx.logger.sent(peer, &summary.path, summary.sent);
            Outcome::Sent(summary)
        }
    };

    if let Err(e) = io.shutdown().await {
        debug!("shutdown after session: {e}");
    }
    Ok(outcome)
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    pub async fn bind(ctx: ServerContext) -> Result<Self> {
        let bind = ctx.config.bind_addr.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            addr = %self.local_addr()?,
            root = %self.ctx.config.root.display(),
            "rcp server listening"
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down listener");
                    return Ok(());
                }
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        self.spawn_connection(stream, peer);
                    }
                    Err(e) => warn!("failed to accept connection: {e}"),
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        let peer = peer.to_string();
        let span = info_span!("conn", peer = %peer);
        tokio::spawn(
            async move {
                info!("new connection");
                match handle_connection(stream, &peer, &ctx).await {
                    Ok(Outcome::Abandoned) => info!("peer closed before sending a command"),
                    Ok(outcome) => info!(?outcome, "connection finished"),
                    Err(e) => {
                        warn!("connection aborted: {e}");
                        ctx.logger.error(&peer, &e.to_string());
                    }
                }
            }
            .instrument(span),
        );
    }
}

/// Bind per `config` and serve until the process ends.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let ctx = ServerContext::from_config(config)?;
    Server::bind(ctx).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn context(temp_dir: &TempDir) -> ServerContext {
        let mut config = ServerConfig::new(temp_dir.path()).validate().unwrap();
        config.io_timeout = Duration::from_secs(2);
        config.preamble_timeout = Duration::from_millis(200);
        ServerContext::new(config, Arc::new(NoopLogger))
    }

    #[tokio::test]
    async fn receive_then_send_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = Arc::new(context(&temp_dir));
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();

        let (mut client, server) = duplex(8 * 1024);
        let c = Arc::clone(&ctx);
        let task = tokio::spawn(async move { handle_connection(server, "t", &c).await });
        client.write_all(b"0\0u\0u\0rcp -t data\0").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client
            .write_all(format!("C0640 {} blob.bin\n", payload.len()).as_bytes())
            .await
            .unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(&payload).await.unwrap();
        client.write_u8(0).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_all(b"E\n").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        assert!(matches!(task.await.unwrap(), Ok(Outcome::Received(_))));

        let (mut client, server) = duplex(8 * 1024);
        let c = Arc::clone(&ctx);
        let task = tokio::spawn(async move { handle_connection(server, "t", &c).await });
        client.write_all(b"0\0u\0u\0rcp -f data/blob.bin\0").await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 0);
        let mut header = Vec::new();
        loop {
            let b = client.read_u8().await.unwrap();
            header.push(b);
            if b == b'\n' {
                break;
            }
        }
        assert_eq!(header, format!("C0640 {} blob.bin\n", payload.len()).into_bytes());
        client.write_u8(0).await.unwrap();
        let mut body = vec![0u8; payload.len()];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(body, payload);
        assert_eq!(client.read_u8().await.unwrap(), 0);
        client.write_u8(0).await.unwrap();

        match task.await.unwrap() {
            Ok(Outcome::Sent(summary)) => assert_eq!(summary.sent, payload.len() as u64),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_command_closes_silently() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let (mut client, server) = duplex(1024);

        client.write_all(b"0\0u\0u\0rcp -x foo\0").await.unwrap();
        let res = handle_connection(server, "t", &ctx).await;
        assert!(matches!(res, Err(RcpError::MalformedCommand(_))));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn too_few_fields_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let (mut client, server) = duplex(1024);

        client.write_all(b"u\0rcp -t .\0").await.unwrap();
        let res = handle_connection(server, "t", &ctx).await;
        assert!(matches!(res, Err(RcpError::MalformedCommand(_))));
    }

    #[tokio::test]
    async fn stalled_preamble_times_out_without_reply() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let (mut client, server) = duplex(1024);

        client.write_all(b"0\0u\0u\0rcp -t").await.unwrap();
        let res = handle_connection(server, "t", &ctx).await;
        assert!(matches!(res, Err(RcpError::Timeout { op: "preamble read", .. })));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn escaping_target_drops_connection_without_reply() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let (mut client, server) = duplex(1024);

        client.write_all(b"0\0u\0u\0rcp -t ../../tmp\0").await.unwrap();
        let res = handle_connection(server, "t", &ctx).await;
        assert!(matches!(res, Err(RcpError::PathEscape { .. })));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn early_close_is_abandoned() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let (client, server) = duplex(1024);
        drop(client);

        let res = handle_connection(server, "t", &ctx).await;
        assert!(matches!(res, Ok(Outcome::Abandoned)));
    }
}
