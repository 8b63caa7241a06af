//! TCP transport: the write half of a connected socket, with the low
//! latency options a chatty framed protocol wants.

use super::Transport;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

/// Write half of a TCP link.
pub struct TcpTransport {
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to a listening peer. Returns the transport plus the read
    /// half to pump into the protocol.
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<(Self, OwnedReadHalf)> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    /// Accept one connection from a bound listener.
    pub async fn accept(listener: &TcpListener) -> io::Result<(Self, OwnedReadHalf)> {
        let (stream, peer) = listener.accept().await?;
        debug!("accepted connection from {}", peer);
        Self::from_stream(stream)
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<(Self, OwnedReadHalf)> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok((Self { writer, peer }, reader))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        debug!("wrote {} byte frame to {}", frame.len(), self.peer);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
