use std::{
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

/// An accepted connection.
#[pin_project(project = ConnectionProjected)]
pub enum Connection {
    /// A TCP connection, along with the address of the remote peer.
    Tcp(#[pin] TcpStream, SocketAddr),

    /// A Unix stream connection.
    #[cfg(unix)]
    Unix(#[pin] tokio::net::UnixStream),
}

impl Connection {
    /// Returns a displayable description of the remote peer.
    pub fn peer(&self) -> PeerAddress {
        match self {
            Self::Tcp(_, addr) => PeerAddress(Some(*addr)),
            #[cfg(unix)]
            Self::Unix(_) => PeerAddress(None),
        }
    }
}

/// The remote peer of a connection.
///
/// Unix stream peers are unnamed, and display as `unix`.
#[derive(Clone, Copy, Debug)]
pub struct PeerAddress(Option<SocketAddr>);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("unix"),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_read(cx, buf),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_write(cx, buf),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_flush(cx),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProjected::Tcp(inner, _) => inner.poll_shutdown(cx),
            #[cfg(unix)]
            ConnectionProjected::Unix(inner) => inner.poll_shutdown(cx),
        }
    }
}
