//! wiremux: many ordered, flow-controlled, half-closable channels over one
//! message transport.
//!
//! This crate defines:
//! - The transport contract a session runs over ([`MessageTransport`],
//!   [`CloseMode`]) and an in-process pair for tests ([`MemTransport`])
//! - The frame codec with its variable-width signed channel ids
//!   ([`IdWidth`], [`ChannelOp`], [`SessionOp`])
//! - Sessions and their read loop ([`MuxSession`], [`MuxConfig`],
//!   [`IncomingChannels`])
//! - Channels ([`Channel`], [`ChannelStatus`], [`ChannelStats`]) and their
//!   byte-stream ([`ChannelStream`]) and nested-transport ([`ChannelLink`])
//!   views
//! - Errors ([`MuxError`], [`TransportError`], [`CodecError`])
//!
//! A session owns one transport and drives it from a single read loop
//! ([`MuxSession::run`]); everything else is a handle. Both sides may create
//! channels at any time with no handshake round-trip.

mod channel;
mod channel_stream;
mod codec;
mod error;
mod queue;
mod session;
mod transport;

pub use channel::{Channel, ChannelLink, ChannelState, ChannelStats, ChannelStatus};
pub use channel_stream::ChannelStream;
pub use codec::{ChannelOp, IdWidth, SessionOp};
pub use error::{CodecError, MuxError, TransportError};
pub use session::{IncomingChannels, MuxConfig, MuxSession, MAIN_CHANNEL_ID};
pub use transport::mem::MemTransport;
pub use transport::{CloseMode, MessageTransport};
