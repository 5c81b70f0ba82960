//! Stream — byte streams handed to services by `dial` and `listen`.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::error::{Result, RouterError};

/// Anything that can carry a peer connection.
pub trait Io: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> Io for T {}

/// A connected, bidirectional stream to a remote destination.
///
/// The concrete transport (router socket, in-memory duplex for tests) is
/// erased so services never learn how the router is reached.
pub struct RouterStream {
    peer: String,
    io: Pin<Box<dyn Io>>,
}

impl RouterStream {
    pub fn new(peer: impl Into<String>, io: impl Io + 'static) -> Self {
        Self {
            peer: peer.into(),
            io: Box::pin(io),
        }
    }

    /// Destination of the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for RouterStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterStream").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for RouterStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.io.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for RouterStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.io.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.io.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.io.as_mut().poll_shutdown(cx)
    }
}

/// Source of inbound streams for one listening service.
///
/// Dropping it stops the background accept loop that feeds it.
pub struct Inbound {
    destination: String,
    rx: mpsc::Receiver<RouterStream>,
    _guard: Option<DropGuard>,
}

impl Inbound {
    pub fn new(
        destination: impl Into<String>,
        rx: mpsc::Receiver<RouterStream>,
        guard: Option<DropGuard>,
    ) -> Self {
        Self {
            destination: destination.into(),
            rx,
            _guard: guard,
        }
    }

    /// Destination peers dial to reach this listener.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next inbound stream; `None` once the listener is gone.
    pub async fn next(&mut self) -> Option<RouterStream> {
        self.rx.recv().await
    }

    /// Wait at most `timeout` for the next inbound stream.
    pub async fn accept(&mut self, timeout: Duration) -> Result<RouterStream> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => Err(RouterError::Disconnected(format!(
                "listener for {} closed",
                self.destination
            ))),
            Err(_) => Err(RouterError::Timeout {
                op: "accept",
                after: timeout,
            }),
        }
    }
}
