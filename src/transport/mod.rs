//! # Transport Seam
//!
//! The protocol engine is transport-agnostic: anything that can carry
//! whole frames in order works. A [`Transport`] owns the write side of a
//! byte stream; the read side is pumped into the protocol separately so
//! reading and writing never contend.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub mod tcp;

pub use tcp::TcpTransport;

/// Write side of a link.
#[async_trait]
pub trait Transport: Send {
    /// Write one whole frame (header + body) and flush it.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Close the write side.
    async fn close(&mut self) -> io::Result<()>;

    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

/// Transport over any async writer: in-memory duplex pipes in tests,
/// pipes, or pre-split stream halves.
pub struct StreamTransport<W> {
    writer: W,
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        debug!("wrote {} byte frame via stream transport", frame.len());
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}
