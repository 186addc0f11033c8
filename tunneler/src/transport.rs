use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use russh::server::Msg;
use russh::{Channel, ChannelStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A `forwarded-tcpip` channel presented as a plain byte-stream connection.
///
/// This is what the probe and the proxy engine hand to the HTTP client (and
/// to the TLS connector): reads and writes go over the channel, and shutting
/// the transport down closes the channel only — the owning SSH connection
/// stays up.
pub struct ChannelTransport {
    stream: ChannelStream<Msg>,
    peer_addr: SocketAddr,
}

impl ChannelTransport {
    pub fn new(channel: Channel<Msg>, peer_addr: SocketAddr) -> Self {
        Self {
            stream: channel.into_stream(),
            peer_addr,
        }
    }

    /// Peer address of the SSH connection the channel belongs to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl AsyncRead for ChannelTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
