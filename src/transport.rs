//! The message-transport contract consumed by a session.
//!
//! The multiplexer assumes an already-ordered, already-reliable transport
//! that preserves message boundaries (e.g. a WebSocket-like connection).
//! Everything else about the transport is out of scope; a session only ever
//! sends one discrete message, receives one discrete message (or the
//! end-of-stream marker), and closes.

use std::future::Future;

use bytes::Bytes;

use crate::error::TransportError;

/// How to close a transport (or a channel acting as one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Tear down both directions.
    Full,
    /// Stop sending; the peer may still deliver data to us.
    SendHalf,
}

/// One discrete-message, ordered, reliable duplex connection.
///
/// `send_message` must be atomic per message relative to other senders, or
/// externally serialized; a session serializes its own sends, so any
/// transport whose send is atomic per call satisfies this.
pub trait MessageTransport: Send + Sync + 'static {
    /// Transmit one discrete message, preserving boundaries and order.
    fn send_message(
        &self,
        msg: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Yield the next discrete message, or `Ok(None)` once the peer has shut
    /// down the stream.
    fn recv_message(&self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Close the connection fully or half-close the send side.
    fn close(&self, mode: CloseMode) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn is_closed(&self) -> bool;
}

pub mod mem;
