//! Binary frame codec for the multiplexed tunnel channel.
//!
//! Every WebSocket binary message carries exactly one frame:
//!
//! ```text
//! +------------+---------+---------+------------+---------+
//! | stream id  | type    | flags   | length     | payload |
//! | u32 (BE)   | u8      | u8      | u32 (BE)   | ...     |
//! +------------+---------+---------+------------+---------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Stream identifier. Agents open odd ids, the hub opens even ids.
pub type StreamId = u32;

/// Maximum frame payload (hard protocol cap).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Payload size data frames are chunked to.
pub const DATA_CHUNK: usize = 16 * 1024;

/// Initial per-stream flow-control window, each direction.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Pending inbound streams the acceptor may fall behind by.
pub const ACCEPT_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new stream chosen by the sender.
    Open = 0,
    /// Stream payload bytes.
    Data = 1,
    /// Half-closes the sender's direction; with RST, aborts the stream.
    Close = 2,
    /// Grants the peer additional send window (payload: u32 delta).
    WindowUpdate = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::WindowUpdate),
            other => Err(FrameError::InvalidType(other)),
        }
    }
}

/// Frame flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const RST: u8 = 0b0000_0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame type: {0}")]
    InvalidType(u8),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("incomplete frame")]
    Incomplete,
}

/// One multiplexed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: stream id (4) + type (1) + flags (1) + length (4).
    pub const HEADER_SIZE: usize = 10;

    pub fn open(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Open,
            flags: FrameFlags::new(),
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Close,
            flags: FrameFlags::new(),
            payload: Bytes::new(),
        }
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Close,
            flags: FrameFlags::new().with_rst(),
            payload: Bytes::new(),
        }
    }

    pub fn window_update(stream_id: StreamId, delta: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(delta);
        Self {
            stream_id,
            frame_type: FrameType::WindowUpdate,
            flags: FrameFlags::new(),
            payload: payload.freeze(),
        }
    }

    /// Window delta carried by a `WindowUpdate` frame.
    pub fn window_delta(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate || self.payload.len() < 4 {
            return None;
        }
        let mut buf = self.payload.clone();
        Some(buf.get_u32())
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_FRAME_SIZE as usize {
            return Err(FrameError::TooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::Incomplete);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length as usize));
        }
        if buf.remaining() < length as usize {
            return Err(FrameError::Incomplete);
        }

        let payload = buf.split_to(length as usize);
        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        })
    }
}
