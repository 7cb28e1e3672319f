//! MuxSession: owns the transport, the channel table, and the one read loop.
//!
//! The key invariant is that only [`MuxSession::run`] calls
//! `transport.recv_message()`. Channels never touch the transport directly;
//! frames they emit funnel through the session's serialized send path, which
//! also owns the send-direction id width so header construction is always
//! consistent with the width in effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelEvent};
use crate::codec::{self, ChannelOp, IdWidth, SessionOp, WireFrame};
use crate::error::{MuxError, TransportError};
use crate::transport::{CloseMode, MessageTransport};

/// Process-unique session ids, for logging only.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// The implicit channel that exists for the life of the session.
pub const MAIN_CHANNEL_ID: i32 = 0;

/// Session construction parameters.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Receive-buffer byte threshold per channel; crossing it sends one
    /// `BlockSend`, dropping back below it sends one `ResumeSend`.
    pub max_recv_buffer: usize,
    /// Announce locally created channels with an explicit `Create` opcode.
    /// Off by default; the peer recognizes new channels implicitly on their
    /// first frame.
    pub announce_channels: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_recv_buffer: 128 * 1024,
            announce_channels: false,
        }
    }
}

/// Queue of remotely initiated channels, yielded as the read loop first sees
/// them.
pub struct IncomingChannels<T: MessageTransport> {
    rx: mpsc::UnboundedReceiver<Arc<Channel<T>>>,
}

impl<T: MessageTransport> IncomingChannels<T> {
    /// The next channel the peer created, or `None` once the session is gone.
    pub async fn next(&mut self) -> Option<Arc<Channel<T>>> {
        self.rx.recv().await
    }
}

struct ChannelTable<T: MessageTransport> {
    map: HashMap<i32, Arc<Channel<T>>>,
    /// Allocation cursor: scanning resumes after the last allocated id.
    last_id: i32,
}

impl<T: MessageTransport> ChannelTable<T> {
    /// Find a free positive id within `1..=max`, scanning forward from the
    /// cursor and wrapping once.
    fn allocate(&mut self, max: i32) -> Option<i32> {
        let start = if self.last_id >= 1 && self.last_id < max {
            self.last_id + 1
        } else {
            1
        };
        let mut candidate = start;
        loop {
            if !self.map.contains_key(&candidate) {
                self.last_id = candidate;
                return Some(candidate);
            }
            candidate = if candidate < max { candidate + 1 } else { 1 };
            if candidate == start {
                return None;
            }
        }
    }
}

struct SendState {
    /// Wire width of ids in frames this side emits. Only ever widens.
    id_width: IdWidth,
}

/// A multiplexing session bound to one open transport.
pub struct MuxSession<T: MessageTransport> {
    id: u64,
    transport: T,
    config: MuxConfig,
    table: Mutex<ChannelTable<T>>,
    /// Serializes frame construction and transmission, and guards
    /// send-width transitions.
    send: tokio::sync::Mutex<SendState>,
    incoming: Mutex<Option<mpsc::UnboundedSender<Arc<Channel<T>>>>>,
    closed: AtomicBool,
}

impl<T: MessageTransport> MuxSession<T> {
    /// Bind a session to an open transport.
    ///
    /// The main channel (id 0) exists immediately. The returned
    /// [`IncomingChannels`] queue yields channels the peer creates.
    ///
    /// Nothing moves until the caller spawns [`MuxSession::run`].
    pub fn new(transport: T, config: MuxConfig) -> (Arc<Self>, IncomingChannels<T>) {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let main = Arc::new(Channel::new(
                MAIN_CHANNEL_ID,
                weak.clone(),
                id,
                config.max_recv_buffer,
            ));
            let mut map = HashMap::new();
            map.insert(MAIN_CHANNEL_ID, main);
            Self {
                id,
                transport,
                config,
                table: Mutex::new(ChannelTable { map, last_id: 0 }),
                send: tokio::sync::Mutex::new(SendState {
                    id_width: IdWidth::One,
                }),
                incoming: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            }
        });
        tracing::debug!(session_id = id, "mux session created");
        (session, IncomingChannels { rx })
    }

    /// Process-unique id, for logging.
    pub fn session_id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The implicit channel with id 0. `None` only after teardown.
    pub fn main_channel(&self) -> Option<Arc<Channel<T>>> {
        self.table.lock().map.get(&MAIN_CHANNEL_ID).cloned()
    }

    /// Number of live channels, the main channel included.
    pub fn channel_count(&self) -> usize {
        self.table.lock().map.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the underlying transport; the read loop exits and tears the
    /// session down.
    pub async fn close(&self) {
        let _ = self.transport.close(CloseMode::Full).await;
    }

    /// Create a channel with the next free locally allocated id, widening the
    /// send id width when the current range is exhausted.
    pub async fn create_channel(self: &Arc<Self>) -> Result<Arc<Channel<T>>, MuxError> {
        self.create_inner(None).await
    }

    /// Create a channel with an explicitly chosen positive id.
    pub async fn create_channel_with_id(
        self: &Arc<Self>,
        id: i32,
    ) -> Result<Arc<Channel<T>>, MuxError> {
        self.create_inner(Some(id)).await
    }

    async fn create_inner(
        self: &Arc<Self>,
        explicit: Option<i32>,
    ) -> Result<Arc<Channel<T>>, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        if let Some(id) = explicit {
            if id <= 0 {
                return Err(MuxError::ChannelExists(id));
            }
        }

        let mut send = self.send.lock().await;
        let key = loop {
            let max = send.id_width.max_channel_id();
            match explicit {
                Some(id) if id <= max => {
                    if self.table.lock().map.contains_key(&id) {
                        return Err(MuxError::ChannelExists(id));
                    }
                    break id;
                }
                Some(_) => {}
                None => {
                    if let Some(id) = self.table.lock().allocate(max) {
                        break id;
                    }
                }
            }

            // Announce at the old width, then widen; the peer switches its
            // receive width on the announcement and decodes everything after
            // it at the new width.
            let wider = send.id_width.widen().ok_or(MuxError::ChannelIdsExhausted)?;
            let op = match wider {
                IdWidth::Two => SessionOp::ExtendIdLength16,
                _ => SessionOp::ExtendIdLength32,
            };
            let msg = codec::encode_session_op(op, send.id_width)?;
            self.transport.send_message(msg).await?;
            tracing::debug!(
                session_id = self.id,
                width_bytes = wider.bytes(),
                "send id width extended"
            );
            send.id_width = wider;
        };

        let channel = Arc::new(Channel::new(
            key,
            Arc::downgrade(self),
            self.id,
            self.config.max_recv_buffer,
        ));
        self.table.lock().map.insert(key, channel.clone());
        tracing::debug!(session_id = self.id, channel_id = key, "channel created");

        if self.config.announce_channels {
            let msg = codec::encode_channel_op(key, ChannelOp::Create, send.id_width)?;
            self.transport.send_message(msg).await?;
        }

        Ok(channel)
    }

    /// Serialized send path for data frames.
    pub(crate) async fn send_data(&self, key: i32, payload: Bytes) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let send = self.send.lock().await;
        let msg = codec::encode_data(key, &payload, send.id_width)?;
        tracing::trace!(
            session_id = self.id,
            channel_id = key,
            payload_len = payload.len(),
            "send data"
        );
        self.transport.send_message(msg).await?;
        Ok(())
    }

    /// Serialized send path for channel-scoped control opcodes.
    pub(crate) async fn send_channel_op(&self, key: i32, op: ChannelOp) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let send = self.send.lock().await;
        let msg = codec::encode_channel_op(key, op, send.id_width)?;
        tracing::debug!(session_id = self.id, channel_id = key, ?op, "send channel op");
        self.transport.send_message(msg).await?;
        Ok(())
    }

    async fn send_session_op(&self, op: SessionOp) -> Result<(), MuxError> {
        let send = self.send.lock().await;
        let msg = codec::encode_session_op(op, send.id_width)?;
        tracing::debug!(session_id = self.id, ?op, "send session op");
        self.transport.send_message(msg).await?;
        Ok(())
    }

    /// Drop a channel from the table, freeing its id for reuse. The main
    /// channel is never removed.
    pub(crate) fn remove_channel(&self, key: i32) {
        if key == MAIN_CHANNEL_ID {
            return;
        }
        if self.table.lock().map.remove(&key).is_some() {
            tracing::debug!(session_id = self.id, channel_id = key, "channel removed");
        }
    }

    fn lookup(&self, key: i32) -> Option<Arc<Channel<T>>> {
        self.table.lock().map.get(&key).cloned()
    }

    /// Look up a channel, lazily creating remote-initiated ones (negative
    /// keys) on first sight.
    fn lookup_or_create(self: &Arc<Self>, key: i32) -> Option<Arc<Channel<T>>> {
        let channel = {
            let mut table = self.table.lock();
            if let Some(channel) = table.map.get(&key) {
                return Some(channel.clone());
            }
            if key >= 0 {
                // Positive keys are ours to allocate; an unknown one is a
                // stray frame for a channel already removed.
                return None;
            }
            let channel = Arc::new(Channel::new(
                key,
                Arc::downgrade(self),
                self.id,
                self.config.max_recv_buffer,
            ));
            table.map.insert(key, channel.clone());
            channel
        };
        tracing::debug!(session_id = self.id, channel_id = key, "remote channel created");

        if let Some(tx) = self.incoming.lock().as_ref() {
            if tx.send(channel.clone()).is_err() {
                tracing::debug!(
                    session_id = self.id,
                    channel_id = key,
                    "incoming-channel receiver dropped"
                );
            }
        }
        Some(channel)
    }

    /// Run the read loop: the only place `recv_message` is called.
    ///
    /// Exits on transport end-of-stream or error; either way every live
    /// channel is force-transitioned to `ParentClosed` and the transport is
    /// closed before returning.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        tracing::debug!(session_id = self.id, "read loop started");
        let mut recv_width = IdWidth::One;
        let result = loop {
            let msg = match self.transport.recv_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::debug!(session_id = self.id, "transport end of stream");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(session_id = self.id, error = %e, "transport error");
                    break Err(e);
                }
            };
            self.dispatch(msg, &mut recv_width).await;
        };
        self.teardown().await;
        result
    }

    async fn dispatch(self: &Arc<Self>, msg: Bytes, recv_width: &mut IdWidth) {
        let frame = match codec::decode_frame(msg, *recv_width) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = self.id, error = %e, "dropping undecodable frame");
                return;
            }
        };
        match frame {
            WireFrame::Data { key, payload } => self.on_data(key, payload).await,
            WireFrame::ChannelControl { key, op_byte } => self.on_channel_op(key, op_byte).await,
            WireFrame::SessionControl { op_byte } => {
                self.on_session_op(op_byte, recv_width).await
            }
        }
    }

    async fn on_data(self: &Arc<Self>, key: i32, payload: Bytes) {
        let Some(channel) = self.lookup_or_create(key) else {
            tracing::warn!(
                session_id = self.id,
                channel_id = key,
                payload_len = payload.len(),
                "data frame for unknown channel"
            );
            return;
        };
        if let Some(op) = channel.enqueue_data(payload) {
            if let Err(e) = self.send_channel_op(key, op).await {
                tracing::warn!(session_id = self.id, channel_id = key, error = %e, "failed to send BlockSend");
            }
        }
    }

    async fn on_channel_op(self: &Arc<Self>, key: i32, op_byte: u8) {
        let Some(op) = ChannelOp::from_byte(op_byte) else {
            tracing::warn!(
                session_id = self.id,
                channel_id = key,
                op_byte,
                "unknown channel opcode"
            );
            if let Err(e) = self.send_channel_op(key, ChannelOp::UnknownOpcode).await {
                tracing::debug!(session_id = self.id, error = %e, "failed to report unknown opcode");
            }
            return;
        };

        match op {
            ChannelOp::Create => {
                // Idempotent: the channel may already exist from an earlier
                // data frame.
                self.lookup_or_create(key);
            }
            ChannelOp::Eof | ChannelOp::Close => {
                // A peer may open-and-immediately-half-close with no data
                // frame in between, so these also materialize the channel.
                let Some(channel) = self.lookup_or_create(key) else {
                    tracing::warn!(
                        session_id = self.id,
                        channel_id = key,
                        ?op,
                        "opcode for unknown channel"
                    );
                    return;
                };
                let event = if op == ChannelOp::Eof {
                    ChannelEvent::PeerEof
                } else {
                    ChannelEvent::PeerClose
                };
                let effects = channel.apply_event(event);
                if let Some(reply) = effects.send {
                    if let Err(e) = self.send_channel_op(key, reply).await {
                        tracing::warn!(session_id = self.id, channel_id = key, error = %e, "failed to send close-handshake reply");
                    }
                }
                if effects.remove {
                    self.remove_channel(key);
                }
            }
            ChannelOp::BlockSend | ChannelOp::ResumeSend => {
                let Some(channel) = self.lookup(key) else {
                    tracing::warn!(
                        session_id = self.id,
                        channel_id = key,
                        ?op,
                        "flow-control opcode for unknown channel"
                    );
                    return;
                };
                channel.set_send_gate(op == ChannelOp::BlockSend);
            }
            ChannelOp::UnknownOpcode => {
                tracing::warn!(
                    session_id = self.id,
                    channel_id = key,
                    "peer reported an opcode it did not understand"
                );
            }
        }
    }

    async fn on_session_op(&self, op_byte: u8, recv_width: &mut IdWidth) {
        match SessionOp::from_byte(op_byte) {
            Some(SessionOp::ExtendIdLength16) => {
                self.on_extend(IdWidth::Two, recv_width).await;
            }
            Some(SessionOp::ExtendIdLength32) => {
                self.on_extend(IdWidth::Four, recv_width).await;
            }
            Some(SessionOp::UnknownOpcode) => {
                tracing::warn!(
                    session_id = self.id,
                    "peer reported a session opcode it did not understand"
                );
            }
            None => {
                tracing::warn!(session_id = self.id, op_byte, "unknown session opcode");
                if let Err(e) = self.send_session_op(SessionOp::UnknownOpcode).await {
                    tracing::debug!(session_id = self.id, error = %e, "failed to report unknown session opcode");
                }
            }
        }
    }

    /// The peer announced a wider send width. Match our receive width, and
    /// if our own send side is still narrower, widen it too and re-announce
    /// so the peer's receive width stays in sync.
    async fn on_extend(&self, announced: IdWidth, recv_width: &mut IdWidth) {
        if announced <= *recv_width {
            // Widths are monotonic; an equal or narrower announcement is a
            // protocol anomaly, not a narrowing.
            tracing::warn!(
                session_id = self.id,
                announced_bytes = announced.bytes(),
                current_bytes = recv_width.bytes(),
                "ignoring non-widening id extension"
            );
            return;
        }
        *recv_width = announced;
        tracing::debug!(
            session_id = self.id,
            width_bytes = announced.bytes(),
            "recv id width extended"
        );

        let mut send = self.send.lock().await;
        if send.id_width < announced {
            let op = match announced {
                IdWidth::Two => SessionOp::ExtendIdLength16,
                _ => SessionOp::ExtendIdLength32,
            };
            match codec::encode_session_op(op, send.id_width) {
                Ok(msg) => {
                    if let Err(e) = self.transport.send_message(msg).await {
                        tracing::warn!(session_id = self.id, error = %e, "failed to re-announce id width");
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = self.id, error = %e, "failed to encode id-width announcement");
                }
            }
            send.id_width = announced;
        }
    }

    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session_id = self.id, "session teardown");
        let channels: Vec<_> = {
            let mut table = self.table.lock();
            table.map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.parent_closed();
        }
        *self.incoming.lock() = None;
        let _ = self.transport.close(CloseMode::Full).await;
    }
}
