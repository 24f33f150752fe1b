//! Remote stream variants with independent half-close

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::trace;

const DISCARD_BUFFER_SIZE: usize = 16 * 1024;

/// A connection to the destination, either dialed directly or tunneled
/// through a remote proxy
pub enum RemoteStream {
    Tcp(TcpStream),
    Tunnel(TunnelStream),
}

/// CONNECT tunnel carried by one HTTP/2 stream.
///
/// The write side is the request body; shutting it down sends END_STREAM.
/// The read side is the response body. h2 cannot stop one direction alone,
/// so after the read side is closed incoming data is consumed and thrown
/// away, which keeps returning flow-control credit to the proxy. The stream
/// is reset once both sides are released.
pub struct TunnelStream {
    io: TokioIo<Upgraded>,
    read_closed: bool,
}

impl TunnelStream {
    pub fn new(upgraded: Upgraded) -> Self {
        TunnelStream {
            io: TokioIo::new(upgraded),
            read_closed: false,
        }
    }
}

impl RemoteStream {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteStream::Tcp(_) => "tcp",
            RemoteStream::Tunnel(_) => "tunnel",
        }
    }

    /// Stop sending; the peer sees end-of-stream, reading stays possible
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Stop receiving; writing stays possible
    pub fn close_read(&mut self) -> io::Result<()> {
        match self {
            RemoteStream::Tcp(stream) => shutdown_read(stream),
            RemoteStream::Tunnel(tunnel) => {
                tunnel.read_closed = true;
                Ok(())
            }
        }
    }

    /// Release the stream in both directions
    pub fn close(self) {
        drop(self)
    }

    pub fn into_split(self) -> (RemoteReader, RemoteWriter) {
        match self {
            RemoteStream::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (RemoteReader::Tcp(r), RemoteWriter::Tcp(w))
            }
            RemoteStream::Tunnel(mut tunnel) => {
                // the discarding task below takes over from the inline drain
                let read_closed = std::mem::take(&mut tunnel.read_closed);
                let released = Arc::new(Notify::new());
                let (r, w) = tokio::io::split(tunnel);
                let mut reader = RemoteReader::Tunnel {
                    half: Some(r),
                    write_released: released.clone(),
                };
                if read_closed {
                    reader.discard_tunnel();
                }
                (reader, RemoteWriter::Tunnel { half: w, released })
            }
        }
    }
}

fn shutdown_read(stream: &TcpStream) -> io::Result<()> {
    match SockRef::from(stream).shutdown(Shutdown::Read) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStream::Tcp(stream) => f.debug_tuple("Tcp").field(stream).finish(),
            RemoteStream::Tunnel(_) => f.write_str("Tunnel"),
        }
    }
}

impl TunnelStream {
    /// Consume whatever the proxy already sent on a read-closed tunnel
    fn discard_ready(&mut self, cx: &mut Context<'_>) {
        if !self.read_closed {
            return;
        }
        let mut scratch = [0u8; DISCARD_BUFFER_SIZE];
        loop {
            let mut buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) if !buf.filled().is_empty() => continue,
                _ => return,
            }
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_closed {
            this.discard_ready(cx);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.discard_ready(cx);
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.discard_ready(cx);
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl AsyncRead for RemoteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            RemoteStream::Tunnel(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RemoteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RemoteStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            RemoteStream::Tunnel(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            RemoteStream::Tunnel(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            RemoteStream::Tunnel(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Read half of a split [`RemoteStream`]
pub enum RemoteReader {
    Tcp(OwnedReadHalf),
    Tunnel {
        /// `None` once the read side has been closed
        half: Option<ReadHalf<TunnelStream>>,
        write_released: Arc<Notify>,
    },
}

impl RemoteReader {
    /// Must be called within a tokio runtime for tunnels
    pub fn close_read(&mut self) -> io::Result<()> {
        match self {
            RemoteReader::Tcp(half) => shutdown_read(half.as_ref()),
            RemoteReader::Tunnel { .. } => {
                self.discard_tunnel();
                Ok(())
            }
        }
    }

    /// Hand the tunnel read half to a task that throws incoming data away
    /// until the proxy ends the stream or the write half is released
    fn discard_tunnel(&mut self) {
        let RemoteReader::Tunnel {
            half,
            write_released,
        } = self
        else {
            return;
        };
        let Some(mut half) = half.take() else {
            return;
        };
        let write_released = write_released.clone();

        tokio::spawn(async move {
            let mut scratch = vec![0u8; DISCARD_BUFFER_SIZE];
            let mut discarded = 0usize;
            loop {
                tokio::select! {
                    _ = write_released.notified() => break,
                    read = half.read(&mut scratch) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => discarded += n,
                    },
                }
            }
            trace!("tunnel read side released after discarding {} bytes", discarded);
        });
    }
}

impl AsyncRead for RemoteReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteReader::Tcp(half) => Pin::new(half).poll_read(cx, buf),
            RemoteReader::Tunnel { half: Some(half), .. } => Pin::new(half).poll_read(cx, buf),
            RemoteReader::Tunnel { half: None, .. } => Poll::Ready(Ok(())),
        }
    }
}

/// Write half of a split [`RemoteStream`]
pub enum RemoteWriter {
    Tcp(OwnedWriteHalf),
    Tunnel {
        half: WriteHalf<TunnelStream>,
        /// Signalled on drop so a discarding read half lets go too
        released: Arc<Notify>,
    },
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        if let RemoteWriter::Tunnel { released, .. } = self {
            released.notify_one();
        }
    }
}

impl RemoteWriter {
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl AsyncWrite for RemoteWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RemoteWriter::Tcp(half) => Pin::new(half).poll_write(cx, buf),
            RemoteWriter::Tunnel { half, .. } => Pin::new(half).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteWriter::Tcp(half) => Pin::new(half).poll_flush(cx),
            RemoteWriter::Tunnel { half, .. } => Pin::new(half).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteWriter::Tcp(half) => Pin::new(half).poll_shutdown(cx),
            RemoteWriter::Tunnel { half, .. } => Pin::new(half).poll_shutdown(cx),
        }
    }
}
