//! Filter and chain factory contracts.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection::Role;
use crate::filter::callbacks::{DecoderFilterCallbacks, EncoderFilterCallbacks};
use crate::filter::status::{FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus};
use crate::net::Connection;
use crate::stream::{HeaderMap, Protocol, StreamId};

/// Capability shared by every filter.
pub trait StreamFilterBase: Send {
    /// Called exactly once when the stream completes or is reset. Any
    /// retained callback handle is inert afterwards.
    fn on_destroy(&mut self) {}
}

/// Filter on the inbound (decode) path.
///
/// Every method defaults to `Continue` so a filter implements only the
/// frames it cares about.
pub trait StreamDecoderFilter: StreamFilterBase {
    fn decode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
        _callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        FilterHeadersStatus::Continue
    }

    fn decode_data(
        &mut self,
        _data: &mut BytesMut,
        _end_stream: bool,
        _callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterDataStatus {
        FilterDataStatus::Continue
    }

    fn decode_trailers(
        &mut self,
        _trailers: &mut HeaderMap,
        _callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }
}

/// Filter on the outbound (encode) path.
pub trait StreamEncoderFilter: StreamFilterBase {
    fn encode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
        _callbacks: &EncoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        FilterHeadersStatus::Continue
    }

    fn encode_data(
        &mut self,
        _data: &mut BytesMut,
        _end_stream: bool,
        _callbacks: &EncoderFilterCallbacks<'_>,
    ) -> FilterDataStatus {
        FilterDataStatus::Continue
    }

    fn encode_trailers(
        &mut self,
        _trailers: &mut HeaderMap,
        _callbacks: &EncoderFilterCallbacks<'_>,
    ) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }
}

/// Receives the filters of one stream, in execution order.
pub trait FilterChainFactoryCallbacks {
    fn add_stream_decoder_filter(&mut self, filter: Box<dyn StreamDecoderFilter>);

    fn add_stream_encoder_filter(&mut self, filter: Box<dyn StreamEncoderFilter>);
}

/// What a factory knows about the stream it builds a chain for.
#[derive(Clone)]
pub struct ChainContext {
    pub stream_id: StreamId,
    pub protocol: Protocol,
    pub role: Role,
    pub connection: Option<Arc<dyn Connection>>,
}

impl ChainContext {
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(|c| c.remote_addr())
    }
}

/// Builds the filter chain of every new stream.
pub trait StreamFilterChainFactory: Send + Sync {
    fn create_filter_chain(&self, context: &ChainContext, callbacks: &mut dyn FilterChainFactoryCallbacks);
}

/// Chain collected from a factory.
#[derive(Default)]
pub(crate) struct CollectedChain {
    pub(crate) decoders: Vec<Box<dyn StreamDecoderFilter>>,
    pub(crate) encoders: Vec<Box<dyn StreamEncoderFilter>>,
}

impl FilterChainFactoryCallbacks for CollectedChain {
    fn add_stream_decoder_filter(&mut self, filter: Box<dyn StreamDecoderFilter>) {
        self.decoders.push(filter);
    }

    fn add_stream_encoder_filter(&mut self, filter: Box<dyn StreamEncoderFilter>) {
        self.encoders.push(filter);
    }
}
