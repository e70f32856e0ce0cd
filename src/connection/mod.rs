//! Stream connection subsystem.
//!
//! # Data Flow
//! ```text
//! Connection read loop
//!     → StreamConnection::dispatch(buffer)
//!     → codec.rs (bytes → WireFrame, partial frames stay buffered)
//!     → multiplexed.rs (stream table, frame order, GoAway, resets)
//!     → inbound.rs (per-stream gate honouring read-disable)
//!     → StreamDecoder of the stream
//!
//! Outbound:
//!     StreamEncoder (per stream) → codec encode → Connection::write
//! ```
//!
//! # Design Decisions
//! - Client and server share one implementation, selected by role
//! - The non-initiating side supplies a decoder and receives an encoder
//! - Connection faults reset every stream before the error is returned
//! - User callbacks never run while the stream table is borrowed

pub mod codec;
pub mod inbound;
pub mod multiplexed;

use bytes::BytesMut;
use std::sync::Arc;

use crate::net::connection::ConnectionEvent;
use crate::stream::{Protocol, StreamDecoder, StreamEncoder, StreamError, StreamId};

pub use codec::{Codec, CodecError, WireFrame};
pub use multiplexed::{CodecConnection, ConnectionSettings, Role};

/// Binds a protocol codec to a transport connection.
pub trait StreamConnection: Send + Sync {
    /// Feed bytes read from the transport. Complete frames are consumed;
    /// a trailing partial frame is left in `buffer` for the next call.
    ///
    /// An error means the connection is unusable: every stream has already
    /// been reset and the caller should close the transport.
    fn dispatch(&self, buffer: &mut BytesMut) -> Result<(), CodecError>;

    /// Negotiated protocol.
    fn protocol(&self) -> Protocol;

    /// Send a graceful-shutdown signal. No new streams are originated or
    /// accepted afterwards; existing streams drain.
    fn go_away(&self);

    /// The underlying connection went over its write high watermark.
    fn on_underlying_connection_above_write_buffer_high_watermark(&self);

    /// The underlying connection dropped back under its write low watermark.
    fn on_underlying_connection_below_write_buffer_low_watermark(&self);

    /// The underlying connection closed. Every remaining stream is reset.
    fn on_connection_close(&self, event: ConnectionEvent);

    /// Number of streams that have neither completed nor been reset.
    fn active_streams(&self) -> usize;
}

/// Server side stream connection.
pub trait ServerStreamConnection: StreamConnection {}

/// Client side stream connection.
pub trait ClientStreamConnection: StreamConnection {
    /// Originate an outbound stream. The caller supplies the decoder for
    /// the eventual response and receives the encoder for the request.
    fn new_stream(
        &self,
        stream_id: StreamId,
        response_decoder: Arc<dyn StreamDecoder>,
    ) -> Result<Arc<dyn StreamEncoder>, StreamError>;
}

/// Connection-level events for the owner of a stream connection.
pub trait StreamConnectionEventListener: Send + Sync {
    /// The peer sent a graceful-shutdown signal.
    fn on_go_away(&self);
}

/// Owner of a server stream connection.
pub trait ServerStreamConnectionEventListener: StreamConnectionEventListener {
    /// A new inbound stream was recognised. The returned decoder receives
    /// its frames; `response_encoder` drives the response.
    fn new_stream(
        &self,
        stream_id: StreamId,
        response_encoder: Arc<dyn StreamEncoder>,
    ) -> Arc<dyn StreamDecoder>;
}
