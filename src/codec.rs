//! Frame codec: channel id widths, the reserved sentinel, and opcodes.
//!
//! One transport message is one frame. A frame starts with a signed channel
//! id encoded big-endian at the width currently in effect for its direction
//! (1, 2 or 4 bytes). Each side transmits its *local* signed key verbatim;
//! the receiver negates every non-sentinel wire id before using it as a
//! table key, so the two independently allocated positive id spaces never
//! collide.
//!
//! The sentinel (the minimum value representable at the current width) never
//! names a real channel. A frame whose leading id is the sentinel carries a
//! control payload: another encoded id (the target) followed by an opcode
//! byte. A target equal to the sentinel scopes the opcode to the session
//! itself (id-width negotiation).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Wire width of an encoded channel id, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdWidth {
    One,
    Two,
    Four,
}

impl IdWidth {
    pub fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// The reserved control id at this width: the minimum representable value.
    pub fn sentinel(self) -> i32 {
        match self {
            Self::One => i8::MIN as i32,
            Self::Two => i16::MIN as i32,
            Self::Four => i32::MIN,
        }
    }

    /// Largest positive channel id allocatable at this width.
    pub fn max_channel_id(self) -> i32 {
        match self {
            Self::One => i8::MAX as i32,
            Self::Two => i16::MAX as i32,
            Self::Four => i32::MAX,
        }
    }

    /// The next wider width, if any. Widths only ever grow.
    pub fn widen(self) -> Option<IdWidth> {
        match self {
            Self::One => Some(Self::Two),
            Self::Two => Some(Self::Four),
            Self::Four => None,
        }
    }
}

/// Control opcodes scoped to one target channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    /// Explicit announcement of a newly created channel.
    Create,
    /// Half-close: the sender will transmit no more data on the channel.
    Eof,
    /// Backpressure: the receiver's buffer is full, stop sending.
    BlockSend,
    /// Backpressure released.
    ResumeSend,
    /// Full-close handshake step.
    Close,
    /// Reply to an opcode the sender did not understand.
    UnknownOpcode,
}

impl ChannelOp {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Create => 0x01,
            Self::Eof => 0x02,
            Self::BlockSend => 0x03,
            Self::ResumeSend => 0x04,
            Self::Close => 0x05,
            Self::UnknownOpcode => 0x06,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Create),
            0x02 => Some(Self::Eof),
            0x03 => Some(Self::BlockSend),
            0x04 => Some(Self::ResumeSend),
            0x05 => Some(Self::Close),
            0x06 => Some(Self::UnknownOpcode),
            _ => None,
        }
    }
}

/// Control opcodes scoped to the session itself (target id == sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    /// All subsequent frames from the sender use 2-byte channel ids.
    ExtendIdLength16,
    /// All subsequent frames from the sender use 4-byte channel ids.
    ExtendIdLength32,
    /// Reply to a session opcode the sender did not understand.
    UnknownOpcode,
}

impl SessionOp {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::ExtendIdLength16 => 0x01,
            Self::ExtendIdLength32 => 0x02,
            Self::UnknownOpcode => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ExtendIdLength16),
            0x02 => Some(Self::ExtendIdLength32),
            0x03 => Some(Self::UnknownOpcode),
            _ => None,
        }
    }
}

/// One decoded transport message, with wire ids already translated to local
/// table keys (negated, except the sentinel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Raw channel data.
    Data { key: i32, payload: Bytes },
    /// A control opcode targeting one channel. The opcode byte is kept raw
    /// so the session can answer unknown values with `UnknownOpcode`.
    ChannelControl { key: i32, op_byte: u8 },
    /// A control opcode targeting the session (width negotiation).
    SessionControl { op_byte: u8 },
}

/// Encode `id` big-endian at `width`. The sentinel is representable; anything
/// outside the width's two's-complement range is rejected.
pub fn encode_id(buf: &mut BytesMut, id: i32, width: IdWidth) -> Result<(), CodecError> {
    match width {
        IdWidth::One => {
            let v = i8::try_from(id).map_err(|_| CodecError::IdOutOfRange { id, width })?;
            buf.put_i8(v);
        }
        IdWidth::Two => {
            let v = i16::try_from(id).map_err(|_| CodecError::IdOutOfRange { id, width })?;
            buf.put_i16(v);
        }
        IdWidth::Four => buf.put_i32(id),
    }
    Ok(())
}

/// Decode one big-endian id at `width`, returning it sign-extended along with
/// the number of bytes consumed.
pub fn decode_id(buf: &[u8], width: IdWidth) -> Result<(i32, usize), CodecError> {
    let n = width.bytes();
    if buf.len() < n {
        return Err(CodecError::Truncated);
    }
    let id = match width {
        IdWidth::One => buf[0] as i8 as i32,
        IdWidth::Two => i16::from_be_bytes([buf[0], buf[1]]) as i32,
        IdWidth::Four => i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
    };
    Ok((id, n))
}

/// Build a data frame for the channel with local key `key`.
pub fn encode_data(key: i32, payload: &[u8], width: IdWidth) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(width.bytes() + payload.len());
    encode_id(&mut buf, key, width)?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build a control frame carrying `op` for the channel with local key `key`.
pub fn encode_channel_op(key: i32, op: ChannelOp, width: IdWidth) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(2 * width.bytes() + 1);
    encode_id(&mut buf, width.sentinel(), width)?;
    encode_id(&mut buf, key, width)?;
    buf.put_u8(op.to_byte());
    Ok(buf.freeze())
}

/// Build a session-scoped control frame (target id is the sentinel itself).
pub fn encode_session_op(op: SessionOp, width: IdWidth) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(2 * width.bytes() + 1);
    encode_id(&mut buf, width.sentinel(), width)?;
    encode_id(&mut buf, width.sentinel(), width)?;
    buf.put_u8(op.to_byte());
    Ok(buf.freeze())
}

/// Decode one transport message at the receive-direction width.
///
/// Non-sentinel ids are negated into the local key space. The sentinel is
/// never negated; it cannot name a real channel at any width.
pub fn decode_frame(msg: Bytes, width: IdWidth) -> Result<WireFrame, CodecError> {
    let (id, consumed) = decode_id(&msg, width)?;
    if id != width.sentinel() {
        return Ok(WireFrame::Data {
            key: -id,
            payload: msg.slice(consumed..),
        });
    }

    let rest = &msg[consumed..];
    let (target, consumed) = decode_id(rest, width)?;
    let op_byte = *rest.get(consumed).ok_or(CodecError::Truncated)?;
    if target == width.sentinel() {
        Ok(WireFrame::SessionControl { op_byte })
    } else {
        Ok(WireFrame::ChannelControl {
            key: -target,
            op_byte,
        })
    }
}
