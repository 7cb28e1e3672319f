//! Error types.

use core::fmt;

use crate::codec::IdWidth;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The transport is closed (locally or by the peer).
    Closed,
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Frame encoding/decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message ended before a complete id or opcode could be read.
    Truncated,
    /// A channel id does not fit the wire width in effect.
    IdOutOfRange { id: i32, width: IdWidth },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::IdOutOfRange { id, width } => {
                write!(f, "channel id {id} does not fit {}-byte width", width.bytes())
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors surfaced to callers of a session or channel.
#[derive(Debug)]
pub enum MuxError {
    Transport(TransportError),
    Codec(CodecError),
    /// The owning session is gone: the transport closed or the read loop
    /// exited, and the channel was force-transitioned to its terminal state.
    SessionClosed,
    /// `send` was called after the channel was half-closed or closed locally.
    SendAfterShutdown,
    /// `receive` was called again after the end-of-data marker was delivered.
    ReceiveAfterEnd,
    /// A second `receive` was started while one was already outstanding.
    ReceiveBusy,
    /// No free channel id remains in the full 32-bit positive range.
    ChannelIdsExhausted,
    /// An explicitly requested channel id is already in use.
    ChannelExists(i32),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::SendAfterShutdown => write!(f, "send on half-closed or closed channel"),
            Self::ReceiveAfterEnd => write!(f, "receive after end of data"),
            Self::ReceiveBusy => write!(f, "a receive is already outstanding on this channel"),
            Self::ChannelIdsExhausted => write!(f, "no free channel id"),
            Self::ChannelExists(id) => write!(f, "channel id {id} already in use"),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for MuxError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<CodecError> for MuxError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
