//! Raw transport plumbing for interactive shell channels.
//!
//! A [`ChannelHandle`] wraps any `AsyncRead`/`AsyncWrite` pair in a pair of
//! background tasks: a read task forwarding output chunks into an mpsc, and
//! a write task draining an outgoing byte queue. Callers never block on
//! transport I/O, and output arrival is event-driven.

pub mod pty;
pub mod ssh;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::SessionError;

const READ_BUF_SIZE: usize = 8192;
const CHUNK_QUEUE_DEPTH: usize = 256;
const WRITE_QUEUE_DEPTH: usize = 64;

/// Clonable input half of a channel.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelWriter {
    /// Queue bytes for the shell's stdin.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| SessionError::ConnectionLost("channel write side closed".into()))
    }
}

/// Handle to a live interactive shell channel.
pub struct ChannelHandle {
    writer: ChannelWriter,
    chunk_rx: mpsc::Receiver<Vec<u8>>,
    alive: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Spawn the read/write service tasks over a split transport.
    pub fn spawn<R, W>(mut reader: R, mut writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_QUEUE_DEPTH);
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);

        let alive_read = alive.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        alive_read.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).await.is_err() {
                            // Receiver dropped: the session is gone.
                            break;
                        }
                    }
                }
            }
        });

        let alive_write = alive.clone();
        tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                    alive_write.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        Self {
            writer: ChannelWriter { tx: write_tx },
            chunk_rx,
            alive,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Clonable input half, for raw writes and credential injection.
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Queue bytes for the shell's stdin.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.writer.write(bytes).await
    }

    /// Await the next raw output chunk. `None` means the channel died.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunk_rx.recv().await
    }

    /// Discard everything currently buffered without waiting.
    pub fn drain_buffered(&mut self) {
        while self.chunk_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
impl ChannelWriter {
    /// Writer backed by a bare mpsc, for unit tests that only need to
    /// observe what would be written to the shell.
    pub(crate) fn for_tests() -> (ChannelWriter, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        (ChannelWriter { tx }, rx)
    }
}
