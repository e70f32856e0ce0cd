//! Encoder/decoder contracts and per-direction frame ordering.

use bytes::Bytes;

use crate::stream::error::StreamError;
use crate::stream::handle::Stream;
use crate::stream::types::{FrameKind, HeaderMap};

/// Producer of a stream's outbound frames.
///
/// `end_stream = true` promises no further encode calls for this direction;
/// a later call fails with `StreamError::EndStreamViolation`.
pub trait StreamEncoder: Send + Sync {
    fn encode_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError>;

    fn encode_data(&self, data: Bytes, end_stream: bool) -> Result<(), StreamError>;

    /// Encode trailers. Implicitly ends the stream.
    fn encode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError>;

    /// The stream this encoder writes, for correlation and reset.
    fn stream(&self) -> Stream;
}

/// Receiver of a stream's inbound decoded frames.
///
/// Callbacks are one-way: faults surface through `StreamEventListener::on_reset_stream`.
pub trait StreamDecoder: Send + Sync {
    fn on_decode_headers(&self, headers: HeaderMap, end_stream: bool);

    fn on_decode_data(&self, data: Bytes, end_stream: bool);

    /// Called with decoded trailers. Implicitly ends the stream.
    fn on_decode_trailers(&self, trailers: HeaderMap);
}

/// Tracks one direction of a stream: headers first, then data, then
/// optional trailers, with nothing after end of stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOrder {
    headers_seen: bool,
    ended: bool,
}

impl FrameOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record the next frame of this direction.
    pub fn check(&mut self, kind: FrameKind, end_stream: bool) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::EndStreamViolation { kind });
        }
        match kind {
            FrameKind::Headers if self.headers_seen => return Err(StreamError::FrameOrder { kind }),
            FrameKind::Headers => self.headers_seen = true,
            FrameKind::Data | FrameKind::Trailers if !self.headers_seen => {
                return Err(StreamError::FrameOrder { kind })
            }
            _ => {}
        }
        self.ended = end_stream || kind == FrameKind::Trailers;
        Ok(())
    }

    pub fn headers_seen(&self) -> bool {
        self.headers_seen
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_full_triad() {
        let mut order = FrameOrder::new();
        order.check(FrameKind::Headers, false).unwrap();
        order.check(FrameKind::Data, false).unwrap();
        order.check(FrameKind::Data, false).unwrap();
        order.check(FrameKind::Trailers, true).unwrap();
        assert!(order.is_ended());
    }

    #[test]
    fn rejects_anything_after_end_stream() {
        let mut order = FrameOrder::new();
        order.check(FrameKind::Headers, false).unwrap();
        order.check(FrameKind::Data, true).unwrap();

        for kind in [FrameKind::Headers, FrameKind::Data, FrameKind::Trailers] {
            let err = order.check(kind, false).unwrap_err();
            assert!(matches!(err, StreamError::EndStreamViolation { .. }));
        }
    }

    #[test]
    fn trailers_end_stream_even_without_flag() {
        let mut order = FrameOrder::new();
        order.check(FrameKind::Headers, false).unwrap();
        order.check(FrameKind::Trailers, false).unwrap();
        assert!(order.check(FrameKind::Data, false).is_err());
    }

    #[test]
    fn rejects_data_before_headers_and_duplicate_headers() {
        let mut order = FrameOrder::new();
        assert!(matches!(
            order.check(FrameKind::Data, false),
            Err(StreamError::FrameOrder { kind: FrameKind::Data })
        ));
        order.check(FrameKind::Headers, false).unwrap();
        assert!(matches!(
            order.check(FrameKind::Headers, false),
            Err(StreamError::FrameOrder { kind: FrameKind::Headers })
        ));
    }
}
