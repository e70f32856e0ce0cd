//! Whole-request buffering.
//!
//! Holds the request until its end arrives so later filters and the
//! application see headers and one complete body.

use bytes::BytesMut;

use crate::filter::callbacks::{DecoderFilterCallbacks, StreamFilterCallbacks};
use crate::filter::status::{FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus};
use crate::filter::traits::{StreamDecoderFilter, StreamFilterBase};
use crate::stream::HeaderMap;

pub struct BufferFilter {
    max_request_bytes: usize,
    received: usize,
}

impl BufferFilter {
    pub fn new(max_request_bytes: usize) -> Self {
        Self {
            max_request_bytes,
            received: 0,
        }
    }
}

impl StreamFilterBase for BufferFilter {}

impl StreamDecoderFilter for BufferFilter {
    fn decode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        end_stream: bool,
        callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        if end_stream {
            return FilterHeadersStatus::Continue;
        }
        callbacks.set_decoder_buffer_limit(self.max_request_bytes);
        FilterHeadersStatus::StopIteration
    }

    fn decode_data(
        &mut self,
        data: &mut BytesMut,
        end_stream: bool,
        callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterDataStatus {
        self.received += data.len();
        if self.received > self.max_request_bytes {
            tracing::debug!(
                stream_id = %callbacks.stream_id(),
                received = self.received,
                limit = self.max_request_bytes,
                "Request body too large"
            );
            callbacks.reset_stream();
            return FilterDataStatus::StopIterationNoBuffer;
        }
        // The last chunk joins the held body; the resume then releases it as one frame.
        if end_stream {
            if let Err(e) = callbacks.continue_decoding() {
                tracing::warn!(stream_id = %callbacks.stream_id(), error = %e, "Failed to release buffered request");
            }
        }
        FilterDataStatus::StopIterationAndBuffer
    }

    fn decode_trailers(
        &mut self,
        _trailers: &mut HeaderMap,
        _callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }
}
