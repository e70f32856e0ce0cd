//! Request id propagation.
//!
//! The decoder half stamps `x-request-id` on requests that lack one; the
//! encoder half copies the same id onto the response headers.

use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::filter::callbacks::{DecoderFilterCallbacks, EncoderFilterCallbacks, StreamFilterCallbacks};
use crate::filter::status::FilterHeadersStatus;
use crate::filter::traits::{StreamDecoderFilter, StreamEncoderFilter, StreamFilterBase};
use crate::stream::HeaderMap;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Create the decoder and encoder halves sharing one id slot.
pub fn request_id_filters() -> (RequestIdDecoder, RequestIdEncoder) {
    let id = Arc::new(Mutex::new(None));
    (RequestIdDecoder { id: Arc::clone(&id) }, RequestIdEncoder { id })
}

pub struct RequestIdDecoder {
    id: Arc<Mutex<Option<String>>>,
}

impl StreamFilterBase for RequestIdDecoder {}

impl StreamDecoderFilter for RequestIdDecoder {
    fn decode_headers(
        &mut self,
        headers: &mut HeaderMap,
        _end_stream: bool,
        callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        let id = headers
            .entry(REQUEST_ID_HEADER.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        tracing::trace!(stream_id = %callbacks.stream_id(), request_id = %id, "Request id assigned");
        *self.id.lock() = Some(id);
        FilterHeadersStatus::Continue
    }
}

pub struct RequestIdEncoder {
    id: Arc<Mutex<Option<String>>>,
}

impl StreamFilterBase for RequestIdEncoder {
    fn on_destroy(&mut self) {
        self.id.lock().take();
    }
}

impl StreamEncoderFilter for RequestIdEncoder {
    fn encode_headers(
        &mut self,
        headers: &mut HeaderMap,
        _end_stream: bool,
        _callbacks: &EncoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        if let Some(id) = self.id.lock().clone() {
            headers.entry(REQUEST_ID_HEADER.to_string()).or_insert(id);
        }
        FilterHeadersStatus::Continue
    }
}
