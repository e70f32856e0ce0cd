//! Stream layer errors.

use thiserror::Error;

use crate::connection::CodecError;
use crate::stream::types::{FrameKind, StreamId, StreamResetReason};

/// Errors returned synchronously on the encode path and by stream/connection operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream was reset or already destroyed.
    #[error("stream closed: {0}")]
    StreamClosed(StreamResetReason),

    /// A frame was produced after the direction already ended.
    #[error("{kind} frame after end of stream")]
    EndStreamViolation { kind: FrameKind },

    /// Data or trailers before headers, or a second header block.
    #[error("{kind} frame out of order")]
    FrameOrder { kind: FrameKind },

    /// The connection is shutting down gracefully and takes no new streams.
    #[error("connection is going away")]
    GoAway,

    /// No capacity for another stream on this connection.
    #[error("stream limit reached")]
    Overflow,

    #[error("{0} already exists on this connection")]
    DuplicateStream(StreamId),

    /// Resume requested for a filter that is not stopped, or a resume is already pending.
    #[error("filter {index} is not stopped")]
    NotHalted { index: usize },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection error: {0}")]
    Connection(String),
}

impl StreamError {
    /// True for errors caused by misuse of the stream contract rather than runtime conditions.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StreamError::EndStreamViolation { .. }
                | StreamError::FrameOrder { .. }
                | StreamError::NotHalted { .. }
        )
    }
}
