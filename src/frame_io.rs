//! Deadline-bounded byte I/O over a single connection
//!
//! Every operation gets a fresh window of `timeout` from the moment it is
//! called; a stalled peer therefore costs at most one window per step. The
//! preamble is the exception and is read against an absolute deadline via
//! [`FrameIo::read_byte_within`].

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{RcpError, Result};

pub struct FrameIo<S> {
    stream: BufReader<S>,
    window: Duration,
}

#[inline]
async fn timed<T, F>(op: &'static str, window: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(window, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(RcpError::Timeout { op, after: window }),
    }
}

impl<S> FrameIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, window: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            window,
        }
    }

    /// Read one byte before `started + budget`. `Ok(None)` on EOF.
    pub async fn read_byte_within(&mut self, started: Instant, budget: Duration) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        let res = timeout_at(started + budget, self.stream.read(&mut b)).await;
        match res {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(b[0])),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RcpError::Timeout {
                op: "preamble read",
                after: budget,
            }),
        }
    }

    /// Read through the next `\n`. Returns an empty buffer at EOF.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let window = self.window;
        timed("line read", window, self.stream.read_until(b'\n', &mut line)).await?;
        Ok(line)
    }

    pub async fn read_byte(&mut self) -> Result<u8> {
        let window = self.window;
        timed("status read", window, self.stream.read_u8()).await
    }

    /// Fill `buf` unless the peer closes first; returns the bytes obtained.
    /// Each underlying read gets its own window.
    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<usize> {
        let window = self.window;
        let mut filled = 0;
        while filled < buf.len() {
            let n = timed("data read", window, self.stream.read(&mut buf[filled..])).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let window = self.window;
        let stream = &mut self.stream;
        timed("write", window, async move {
            stream.write_all(buf).await?;
            stream.flush().await
        })
        .await
    }

    pub async fn write_status(&mut self, status: u8) -> Result<()> {
        self.write_all(&[status]).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        let window = self.window;
        timed("shutdown", window, self.stream.shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const WINDOW: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn read_line_and_status_bytes() {
        let (mut client, server) = duplex(1024);
        let mut io = FrameIo::new(server, WINDOW);

        client.write_all(b"C0644 5 a\n\x00").await.unwrap();
        assert_eq!(io.read_line().await.unwrap(), b"C0644 5 a\n");
        assert_eq!(io.read_byte().await.unwrap(), 0);

        io.write_status(1).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_exact_collects_partial_writes() {
        let (mut client, server) = duplex(1024);
        let mut io = FrameIo::new(server, WINDOW);

        let writer = tokio::spawn(async move {
            client.write_all(b"wor").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"ld").await.unwrap();
            client
        });

        let mut buf = [0u8; 5];
        assert_eq!(io.read_exact_or_eof(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"world");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn read_exact_stops_at_eof() {
        let (mut client, server) = duplex(1024);
        let mut io = FrameIo::new(server, WINDOW);

        client.write_all(b"ab").await.unwrap();
        drop(client);

        let mut buf = [0u8; 8];
        assert_eq!(io.read_exact_or_eof(&mut buf).await.unwrap(), 2);
        assert_eq!(io.read_line().await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let (_client, server) = duplex(1024);
        let mut io = FrameIo::new(server, Duration::from_millis(30));
        assert!(matches!(
            io.read_byte().await,
            Err(RcpError::Timeout { op: "status read", .. })
        ));
    }

    #[tokio::test]
    async fn absolute_deadline_bounds_preamble_reads() {
        let (mut client, server) = duplex(1024);
        let mut io = FrameIo::new(server, WINDOW);
        let started = Instant::now();
        let budget = Duration::from_millis(40);

        client.write_all(b"x").await.unwrap();
        assert_eq!(io.read_byte_within(started, budget).await.unwrap(), Some(b'x'));
        assert!(matches!(
            io.read_byte_within(started, budget).await,
            Err(RcpError::Timeout { .. })
        ));
    }
}
