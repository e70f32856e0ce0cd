//! The contract a protocol codec satisfies to plug into `CodecConnection`.

use bytes::BytesMut;
use thiserror::Error;

use crate::stream::{Frame, Protocol, StreamId, StreamResetReason};

/// Connection-level codec faults.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed {0} frame")]
    Malformed(&'static str),

    #[error("stream id 0 is reserved")]
    ReservedStreamId,

    #[error("stream id {0} does not fit the wire format")]
    StreamIdOutOfRange(u64),
}

/// A unit of the wire protocol, already split from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Headers, data or trailers of one stream.
    Stream { id: StreamId, frame: Frame },
    /// Abort one stream.
    Reset { id: StreamId, reason: StreamResetReason },
    /// Graceful shutdown of the whole connection.
    GoAway,
}

/// Turns bytes into `WireFrame`s and back.
pub trait Codec: Send + 'static {
    fn protocol(&self) -> Protocol;

    /// Decode the next complete frame from `src`, consuming exactly its
    /// bytes. Returns `Ok(None)` and leaves `src` untouched when only a
    /// partial frame is buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, CodecError>;

    /// Append the encoding of `frame` to `dst`.
    fn encode(&mut self, frame: &WireFrame, dst: &mut BytesMut) -> Result<(), CodecError>;
}
