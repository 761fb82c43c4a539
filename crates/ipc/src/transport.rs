//! Line framing for the control pipe.
//!
//! Both directions of the parent/child channel carry one JSON document
//! per frame, LF-terminated. serde_json never emits a raw newline inside
//! a document, so the line boundary is unambiguous; [`ControlPipe`]
//! enforces that contract on send rather than trusting callers.

use futures::{SinkExt, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Framed, LinesCodec};

/// Duplex control channel over a pair of unidirectional pipe ends: in
/// the parent the child's stdout/stdin, in the child its own
/// stdin/stdout.
#[derive(Debug)]
pub struct ControlPipe<R, W> {
    frames: Framed<Duplex<R, W>, LinesCodec>,
}

impl<R, W> ControlPipe<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            frames: Framed::new(Duplex { reader, writer }, LinesCodec::new()),
        }
    }

    /// Write one frame: a single serialized JSON document. A payload
    /// with an embedded newline would desynchronize both sides, so it is
    /// refused here instead of corrupting the stream.
    pub async fn send_line(&mut self, line: String) -> io::Result<()> {
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control frame contains a newline",
            ));
        }
        self.frames.send(line).await.map_err(io::Error::other)
    }

    /// Next frame, without the terminator. `None` once the peer closed
    /// its end.
    pub async fn recv_line(&mut self) -> Option<io::Result<String>> {
        self.frames
            .next()
            .await
            .map(|result| result.map_err(io::Error::other))
    }

    /// Flush and shut down the write side, signalling EOF to the peer.
    /// The read side stays usable for draining.
    pub async fn close(&mut self) -> io::Result<()> {
        SinkExt::<String>::close(&mut self.frames)
            .await
            .map_err(io::Error::other)
    }
}

/// Read/write glue so a single codec can frame both pipe ends.
#[derive(Debug)]
struct Duplex<R, W> {
    reader: R,
    writer: W,
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for Duplex<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for Duplex<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
