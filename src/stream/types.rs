//! Identity, frame and reason types shared by every layer.

use bytes::BytesMut;
use std::collections::BTreeMap;
use std::fmt;

/// Protocol-agnostic header block. Ordered so encoded output is deterministic.
pub type HeaderMap = BTreeMap<String, String>;

/// Identifier of a stream, scoped to its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Why a stream was reset. Terminal: a reset stream is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamResetReason {
    /// The connection carrying the stream was closed.
    ConnectionTermination,
    /// The connection failed (protocol or I/O fault).
    ConnectionFailed,
    /// Reset deliberately by this side (filter, proxy, application).
    LocalReset,
    /// No capacity for more work on the connection or stream.
    Overflow,
    /// Reset by the peer.
    RemoteReset,
}

impl StreamResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamResetReason::ConnectionTermination => "ConnectionTermination",
            StreamResetReason::ConnectionFailed => "ConnectionFailed",
            StreamResetReason::LocalReset => "StreamLocalReset",
            StreamResetReason::Overflow => "StreamOverflow",
            StreamResetReason::RemoteReset => "StreamRemoteReset",
        }
    }

    /// True when the reset originates on this side and the peer must be told.
    pub fn is_local(&self) -> bool {
        matches!(self, StreamResetReason::LocalReset | StreamResetReason::Overflow)
    }

    /// Wire code used by codecs that carry reset reasons.
    pub fn code(&self) -> u8 {
        match self {
            StreamResetReason::ConnectionTermination => 0,
            StreamResetReason::ConnectionFailed => 1,
            StreamResetReason::LocalReset => 2,
            StreamResetReason::Overflow => 3,
            StreamResetReason::RemoteReset => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StreamResetReason::ConnectionTermination),
            1 => Some(StreamResetReason::ConnectionFailed),
            2 => Some(StreamResetReason::LocalReset),
            3 => Some(StreamResetReason::Overflow),
            4 => Some(StreamResetReason::RemoteReset),
            _ => None,
        }
    }
}

impl fmt::Display for StreamResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiated protocol identity of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protocol(&'static str);

impl Protocol {
    pub const HTTP1: Protocol = Protocol("Http1");
    pub const HTTP2: Protocol = Protocol("Http2");
    pub const FRAMED: Protocol = Protocol("Framed");

    pub const fn custom(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The three frame kinds of one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Headers,
    Data,
    Trailers,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Headers => f.write_str("headers"),
            FrameKind::Data => f.write_str("data"),
            FrameKind::Trailers => f.write_str("trailers"),
        }
    }
}

/// One decoded or to-be-encoded event of a stream direction.
///
/// Trailers always end the direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Headers { headers: HeaderMap, end_stream: bool },
    Data { data: BytesMut, end_stream: bool },
    Trailers(HeaderMap),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Headers { .. } => FrameKind::Headers,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Trailers(_) => FrameKind::Trailers,
        }
    }

    pub fn end_stream(&self) -> bool {
        match self {
            Frame::Headers { end_stream, .. } | Frame::Data { end_stream, .. } => *end_stream,
            Frame::Trailers(_) => true,
        }
    }

    /// Payload bytes carried by a data frame, zero for the others.
    pub fn data_len(&self) -> usize {
        match self {
            Frame::Data { data, .. } => data.len(),
            _ => 0,
        }
    }
}
