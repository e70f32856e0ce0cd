//! The control surface handed to filters.
//!
//! `DecoderFilterCallbacks` / `EncoderFilterCallbacks` are borrowed for the
//! duration of one filter invocation. A filter that needs to act later
//! (resume from another task, inject data) keeps a handle obtained through
//! `handle()`; handles hold only a weak reference to the chain and become
//! inert once the stream is gone.

use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::filter::chain::{Added, Direction};
use crate::filter::manager::FilterManager;
use crate::filter::route::{RequestInfo, Route};
use crate::net::Connection;
use crate::stream::{
    DownstreamWatermarkEventListener, Frame, HeaderMap, Stream, StreamError, StreamId, StreamResetReason,
};

/// Capabilities shared by decoder and encoder callbacks.
pub trait StreamFilterCallbacks {
    /// The transport connection the stream arrived on, when known.
    fn connection(&self) -> Option<Arc<dyn Connection>>;

    /// Reset the stream with `LocalReset`.
    fn reset_stream(&self);

    /// Route resolved for the stream, if a resolver is configured and
    /// the request headers have been seen.
    fn route(&self) -> Option<Arc<dyn Route>>;

    fn stream_id(&self) -> StreamId;

    fn request_info(&self) -> RequestInfo;

    fn stream(&self) -> Option<Stream>;
}

fn add_to(added: &RefCell<Option<Added>>, data: &[u8], streaming: bool) {
    let mut added = added.borrow_mut();
    let entry = added.get_or_insert_with(Added::default);
    entry.data.extend_from_slice(data);
    entry.streaming |= streaming;
}

/// Callbacks of a decoder filter for one invocation.
pub struct DecoderFilterCallbacks<'a> {
    manager: &'a FilterManager,
    index: usize,
    added: RefCell<Option<Added>>,
}

impl<'a> DecoderFilterCallbacks<'a> {
    pub(crate) fn new(manager: &'a FilterManager, index: usize) -> Self {
        Self {
            manager,
            index,
            added: RefCell::new(None),
        }
    }

    pub(crate) fn into_added(self) -> Option<Added> {
        self.added.into_inner()
    }

    /// Position of the filter in the decoder chain.
    pub fn index(&self) -> usize {
        self.index
    }

    /// A handle for acting on the chain after this invocation returns.
    pub fn handle(&self) -> DecoderFilterHandle {
        DecoderFilterHandle {
            manager: self.manager.weak(),
            index: self.index,
            stream_id: self.manager.stream_id(),
        }
    }

    /// Resume a chain stopped at this filter. Takes effect once the current
    /// invocation returns.
    pub fn continue_decoding(&self) -> Result<(), StreamError> {
        self.manager.request_resume(Direction::Decode, self.index)
    }

    /// Data held at this filter while it is stopped.
    pub fn decoding_buffer(&self) -> Option<Bytes> {
        self.manager.held_data(Direction::Decode, self.index)
    }

    /// Edit the held data in place. `f` must not call back into the
    /// callbacks. Returns false when nothing is held.
    pub fn modify_decoding_buffer(&self, f: impl FnOnce(&mut BytesMut)) -> bool {
        self.manager.modify_held_data(Direction::Decode, self.index, f)
    }

    /// Add bytes to the frame being decoded. With `streaming_filter` and a
    /// `StopIterationNoBuffer` verdict they are passed on immediately.
    pub fn add_decoded_data(&self, data: &[u8], streaming_filter: bool) -> Result<(), StreamError> {
        self.manager.check_add(Direction::Decode, self.index)?;
        add_to(&self.added, data, streaming_filter);
        Ok(())
    }

    pub fn decoder_buffer_limit(&self) -> usize {
        self.manager.buffer_limit(Direction::Decode)
    }

    pub fn set_decoder_buffer_limit(&self, limit: usize) {
        self.manager.set_buffer_limit(Direction::Decode, limit);
    }

    /// The filter's own buffer is too full: stop reading from the peer.
    pub fn on_decoder_filter_above_write_buffer_high_watermark(&self) {
        self.manager.filter_watermark(Direction::Decode, true);
    }

    pub fn on_decoder_filter_below_write_buffer_low_watermark(&self) {
        self.manager.filter_watermark(Direction::Decode, false);
    }

    /// Answer the stream locally. The frames run through the encoder chain.
    pub fn encode_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        self.manager
            .encode_input(Frame::Headers { headers, end_stream }, true)
    }

    pub fn encode_data(&self, data: &[u8], end_stream: bool) -> Result<(), StreamError> {
        self.manager.encode_input(
            Frame::Data {
                data: BytesMut::from(data),
                end_stream,
            },
            true,
        )
    }

    pub fn encode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.manager.encode_input(Frame::Trailers(trailers), true)
    }

    /// Register a listener for write pressure on the encode side.
    pub fn add_downstream_watermark_callbacks(&self, listener: Arc<dyn DownstreamWatermarkEventListener>) {
        self.manager.add_downstream_listener(listener);
    }

    pub fn remove_downstream_watermark_callbacks(&self, listener: &Arc<dyn DownstreamWatermarkEventListener>) {
        self.manager.remove_downstream_listener(listener);
    }
}

impl StreamFilterCallbacks for DecoderFilterCallbacks<'_> {
    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.manager.connection()
    }

    fn reset_stream(&self) {
        self.manager.reset(StreamResetReason::LocalReset);
    }

    fn route(&self) -> Option<Arc<dyn Route>> {
        self.manager.route()
    }

    fn stream_id(&self) -> StreamId {
        self.manager.stream_id()
    }

    fn request_info(&self) -> RequestInfo {
        self.manager.request_info()
    }

    fn stream(&self) -> Option<Stream> {
        self.manager.bound_stream()
    }
}

/// Callbacks of an encoder filter for one invocation.
pub struct EncoderFilterCallbacks<'a> {
    manager: &'a FilterManager,
    index: usize,
    added: RefCell<Option<Added>>,
}

impl<'a> EncoderFilterCallbacks<'a> {
    pub(crate) fn new(manager: &'a FilterManager, index: usize) -> Self {
        Self {
            manager,
            index,
            added: RefCell::new(None),
        }
    }

    pub(crate) fn into_added(self) -> Option<Added> {
        self.added.into_inner()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> EncoderFilterHandle {
        EncoderFilterHandle {
            manager: self.manager.weak(),
            index: self.index,
            stream_id: self.manager.stream_id(),
        }
    }

    pub fn continue_encoding(&self) -> Result<(), StreamError> {
        self.manager.request_resume(Direction::Encode, self.index)
    }

    pub fn encoding_buffer(&self) -> Option<Bytes> {
        self.manager.held_data(Direction::Encode, self.index)
    }

    /// Edit the held data in place. `f` must not call back into the
    /// callbacks.
    pub fn modify_encoding_buffer(&self, f: impl FnOnce(&mut BytesMut)) -> bool {
        self.manager.modify_held_data(Direction::Encode, self.index, f)
    }

    pub fn add_encoded_data(&self, data: &[u8], streaming_filter: bool) -> Result<(), StreamError> {
        self.manager.check_add(Direction::Encode, self.index)?;
        add_to(&self.added, data, streaming_filter);
        Ok(())
    }

    pub fn encoder_buffer_limit(&self) -> usize {
        self.manager.buffer_limit(Direction::Encode)
    }

    pub fn set_encoder_buffer_limit(&self, limit: usize) {
        self.manager.set_buffer_limit(Direction::Encode, limit);
    }

    pub fn on_encoder_filter_above_write_buffer_high_watermark(&self) {
        self.manager.filter_watermark(Direction::Encode, true);
    }

    pub fn on_encoder_filter_below_write_buffer_low_watermark(&self) {
        self.manager.filter_watermark(Direction::Encode, false);
    }
}

impl StreamFilterCallbacks for EncoderFilterCallbacks<'_> {
    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.manager.connection()
    }

    fn reset_stream(&self) {
        self.manager.reset(StreamResetReason::LocalReset);
    }

    fn route(&self) -> Option<Arc<dyn Route>> {
        self.manager.route()
    }

    fn stream_id(&self) -> StreamId {
        self.manager.stream_id()
    }

    fn request_info(&self) -> RequestInfo {
        self.manager.request_info()
    }

    fn stream(&self) -> Option<Stream> {
        self.manager.bound_stream()
    }
}

fn upgrade(manager: &Weak<FilterManager>) -> Result<Arc<FilterManager>, StreamError> {
    manager
        .upgrade()
        .ok_or(StreamError::StreamClosed(StreamResetReason::ConnectionTermination))
}

/// Retained handle of a decoder filter. Safe to use from any task.
#[derive(Clone)]
pub struct DecoderFilterHandle {
    manager: Weak<FilterManager>,
    index: usize,
    stream_id: StreamId,
}

impl DecoderFilterHandle {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn continue_decoding(&self) -> Result<(), StreamError> {
        upgrade(&self.manager)?.request_resume(Direction::Decode, self.index)
    }

    /// Add bytes at this filter's position. Streaming bytes go on at once
    /// when nothing is held here; other bytes join the held data of a
    /// stopped filter.
    pub fn add_decoded_data(&self, data: &[u8], streaming_filter: bool) -> Result<(), StreamError> {
        upgrade(&self.manager)?.add_data_out_of_band(Direction::Decode, self.index, data, streaming_filter)
    }

    pub fn encode_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        upgrade(&self.manager)?.encode_input(Frame::Headers { headers, end_stream }, true)
    }

    pub fn encode_data(&self, data: &[u8], end_stream: bool) -> Result<(), StreamError> {
        upgrade(&self.manager)?.encode_input(
            Frame::Data {
                data: BytesMut::from(data),
                end_stream,
            },
            true,
        )
    }

    pub fn encode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        upgrade(&self.manager)?.encode_input(Frame::Trailers(trailers), true)
    }

    pub fn reset_stream(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.reset(StreamResetReason::LocalReset);
        }
    }

    pub fn on_decoder_filter_above_write_buffer_high_watermark(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.filter_watermark(Direction::Decode, true);
        }
    }

    pub fn on_decoder_filter_below_write_buffer_low_watermark(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.filter_watermark(Direction::Decode, false);
        }
    }
}

/// Retained handle of an encoder filter.
#[derive(Clone)]
pub struct EncoderFilterHandle {
    manager: Weak<FilterManager>,
    index: usize,
    stream_id: StreamId,
}

impl EncoderFilterHandle {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn continue_encoding(&self) -> Result<(), StreamError> {
        upgrade(&self.manager)?.request_resume(Direction::Encode, self.index)
    }

    pub fn add_encoded_data(&self, data: &[u8], streaming_filter: bool) -> Result<(), StreamError> {
        upgrade(&self.manager)?.add_data_out_of_band(Direction::Encode, self.index, data, streaming_filter)
    }

    pub fn reset_stream(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.reset(StreamResetReason::LocalReset);
        }
    }

    pub fn on_encoder_filter_above_write_buffer_high_watermark(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.filter_watermark(Direction::Encode, true);
        }
    }

    pub fn on_encoder_filter_below_write_buffer_low_watermark(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.filter_watermark(Direction::Encode, false);
        }
    }
}
