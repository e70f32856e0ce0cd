//! Stream layer primitives.
//!
//! # Data Flow
//! ```text
//! StreamConnection (codec side)
//!     → Stream (identity, listeners, reset, read-disable)
//!     → StreamDecoder::on_decode_*   (inbound frames, one-way)
//!     ← StreamEncoder::encode_*      (outbound frames, Result)
//!
//! Watermark edges:
//!     connection write buffer → Stream::run_*_watermark_callbacks
//!         → every StreamEventListener on the stream
//! ```
//!
//! # Design Decisions
//! - `Stream` is a cheap cloneable handle; the owning connection keeps the table
//! - No request/response polarity: the same traits serve client and server
//! - Frame order is enforced per direction by `FrameOrder`
//! - Watermarks are edge-triggered with hysteresis

pub mod codec;
pub mod error;
pub mod handle;
pub mod types;
pub mod watermark;

pub use codec::{FrameOrder, StreamDecoder, StreamEncoder};
pub use error::StreamError;
pub use handle::{ReadControl, Stream, StreamEventListener};
pub use types::{Frame, FrameKind, HeaderMap, Protocol, StreamId, StreamResetReason};
pub use watermark::{DownstreamWatermarkEventListener, WatermarkEvent, Watermarks};
