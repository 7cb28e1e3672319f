//! Byte-stream view of a channel.
//!
//! Wraps a message channel in `AsyncRead + AsyncWrite` so it can be spliced
//! with ordinary sockets (`tokio::io::copy_bidirectional` and friends).
//! Message boundaries disappear: writes become data frames, reads drain
//! frames as a contiguous byte stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::channel::Channel;
use crate::error::MuxError;
use crate::transport::MessageTransport;

type PendingRecv =
    Pin<Box<dyn Future<Output = Result<Option<Bytes>, MuxError>> + Send + 'static>>;
type PendingOp = Pin<Box<dyn Future<Output = Result<(), MuxError>> + Send + 'static>>;

/// A channel as a bidirectional byte stream.
///
/// `poll_shutdown` half-closes the channel; reads keep flowing until the peer
/// ends its side. Dropping the stream without a shutdown closes the channel
/// outright.
pub struct ChannelStream<T: MessageTransport> {
    channel: Arc<Channel<T>>,

    read_buf: Bytes,
    read_eof: bool,
    pending_recv: Option<PendingRecv>,

    pending_send: Option<PendingOp>,
    pending_shutdown: Option<PendingOp>,
    write_closed: bool,
}

fn io_error(e: MuxError) -> std::io::Error {
    let kind = match e {
        MuxError::SessionClosed | MuxError::SendAfterShutdown => std::io::ErrorKind::BrokenPipe,
        _ => std::io::ErrorKind::Other,
    };
    std::io::Error::new(kind, e)
}

impl<T: MessageTransport> ChannelStream<T> {
    pub fn new(channel: Arc<Channel<T>>) -> Self {
        tracing::debug!(channel_id = channel.id(), "channel stream created");
        Self {
            channel,
            read_buf: Bytes::new(),
            read_eof: false,
            pending_recv: None,
            pending_send: None,
            pending_shutdown: None,
            write_closed: false,
        }
    }

    pub fn channel(&self) -> &Arc<Channel<T>> {
        &self.channel
    }
}

impl<T: MessageTransport> Drop for ChannelStream<T> {
    fn drop(&mut self) {
        if self.write_closed && self.read_eof {
            return;
        }
        // Best-effort close so the peer is not left waiting forever. Only
        // possible from within a runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            handle.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }
}

impl<T: MessageTransport> AsyncRead for ChannelStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_eof {
            return Poll::Ready(Ok(()));
        }

        // Drain buffered bytes first.
        if !self.read_buf.is_empty() {
            let to_copy = std::cmp::min(self.read_buf.len(), buf.remaining());
            buf.put_slice(&self.read_buf.split_to(to_copy));
            return Poll::Ready(Ok(()));
        }

        let channel = self.channel.clone();
        let fut = self
            .pending_recv
            .get_or_insert_with(|| Box::pin(async move { channel.receive().await }));
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.pending_recv = None;
                match result {
                    Ok(Some(payload)) => {
                        self.read_buf = payload;
                        self.poll_read(cx, buf)
                    }
                    Ok(None) => {
                        self.read_eof = true;
                        tracing::debug!(channel_id = self.channel.id(), "stream read EOF");
                        Poll::Ready(Ok(()))
                    }
                    Err(MuxError::SessionClosed) => {
                        // Session teardown reads as a clean end of stream.
                        self.read_eof = true;
                        Poll::Ready(Ok(()))
                    }
                    Err(e) => Poll::Ready(Err(io_error(e))),
                }
            }
        }
    }
}

impl<T: MessageTransport> AsyncWrite for ChannelStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream write side closed",
            )));
        }

        // Drive any pending send first.
        if let Some(fut) = self.pending_send.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => self.pending_send = None,
                Poll::Ready(Err(e)) => {
                    self.pending_send = None;
                    return Poll::Ready(Err(io_error(e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let channel = self.channel.clone();
        let payload = Bytes::copy_from_slice(data);
        let len = payload.len();
        let mut fut: PendingOp = Box::pin(async move { channel.send(payload).await });

        // Poll once so small writes complete without an extra wakeup.
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(len)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io_error(e))),
            Poll::Pending => {
                self.pending_send = Some(fut);
                // The write is owned by the pending future now; report it
                // accepted so the caller does not resubmit the same bytes.
                Poll::Ready(Ok(len))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Some(fut) = self.pending_send.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.pending_send = None;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Err(e)) => {
                    self.pending_send = None;
                    Poll::Ready(Err(io_error(e)))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }

        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let channel = self.channel.clone();
        let fut = self
            .pending_shutdown
            .get_or_insert_with(|| Box::pin(async move { channel.half_close().await }));
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.pending_shutdown = None;
                self.write_closed = true;
                tracing::debug!(channel_id = self.channel.id(), "stream shutdown");
                match result {
                    Ok(()) => Poll::Ready(Ok(())),
                    Err(e) => Poll::Ready(Err(io_error(e))),
                }
            }
        }
    }
}
