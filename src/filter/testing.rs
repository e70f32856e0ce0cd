//! Sinks and factories shared by the filter unit tests.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::connection::Role;
use crate::filter::manager::{ChainSettings, FilterManager};
use crate::filter::traits::{
    ChainContext, FilterChainFactoryCallbacks, StreamDecoderFilter, StreamEncoderFilter, StreamFilterChainFactory,
};
use crate::stream::{
    FrameKind, HeaderMap, Protocol, Stream, StreamDecoder, StreamEncoder, StreamError, StreamId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Headers(HeaderMap, bool),
    Data(Bytes, bool),
    Trailers(HeaderMap),
}

#[derive(Default)]
pub(crate) struct RecordingDecoder {
    pub(crate) seen: Mutex<Vec<Seen>>,
}

impl StreamDecoder for RecordingDecoder {
    fn on_decode_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.seen.lock().push(Seen::Headers(headers, end_stream));
    }

    fn on_decode_data(&self, data: Bytes, end_stream: bool) {
        self.seen.lock().push(Seen::Data(data, end_stream));
    }

    fn on_decode_trailers(&self, trailers: HeaderMap) {
        self.seen.lock().push(Seen::Trailers(trailers));
    }
}

pub(crate) struct RecordingEncoder {
    pub(crate) stream: Stream,
    pub(crate) seen: Mutex<Vec<Seen>>,
}

impl RecordingEncoder {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            stream: Stream::new(StreamId::new(id)),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl StreamEncoder for RecordingEncoder {
    fn encode_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        self.seen.lock().push(Seen::Headers(headers, end_stream));
        Ok(())
    }

    fn encode_data(&self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.seen.lock().push(Seen::Data(data, end_stream));
        Ok(())
    }

    fn encode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.seen.lock().push(Seen::Trailers(trailers));
        Ok(())
    }

    fn stream(&self) -> Stream {
        self.stream.clone()
    }
}

type MakeDecoders = Box<dyn Fn() -> Vec<Box<dyn StreamDecoderFilter>> + Send + Sync>;
type MakeEncoders = Box<dyn Fn() -> Vec<Box<dyn StreamEncoderFilter>> + Send + Sync>;

/// Factory built from closures.
pub(crate) struct FnFactory {
    decoders: MakeDecoders,
    encoders: MakeEncoders,
}

impl FnFactory {
    pub(crate) fn decoders(make: impl Fn() -> Vec<Box<dyn StreamDecoderFilter>> + Send + Sync + 'static) -> Self {
        Self {
            decoders: Box::new(make),
            encoders: Box::new(Vec::<Box<dyn StreamEncoderFilter>>::new),
        }
    }

    pub(crate) fn new(
        decoders: impl Fn() -> Vec<Box<dyn StreamDecoderFilter>> + Send + Sync + 'static,
        encoders: impl Fn() -> Vec<Box<dyn StreamEncoderFilter>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            decoders: Box::new(decoders),
            encoders: Box::new(encoders),
        }
    }

    pub(crate) fn encoders(make: impl Fn() -> Vec<Box<dyn StreamEncoderFilter>> + Send + Sync + 'static) -> Self {
        Self {
            decoders: Box::new(Vec::<Box<dyn StreamDecoderFilter>>::new),
            encoders: Box::new(make),
        }
    }
}

impl StreamFilterChainFactory for FnFactory {
    fn create_filter_chain(&self, _context: &ChainContext, callbacks: &mut dyn FilterChainFactoryCallbacks) {
        for filter in (self.decoders)() {
            callbacks.add_stream_decoder_filter(filter);
        }
        for filter in (self.encoders)() {
            callbacks.add_stream_encoder_filter(filter);
        }
    }
}

pub(crate) struct Harness {
    pub(crate) manager: Arc<FilterManager>,
    pub(crate) app: Arc<RecordingDecoder>,
    pub(crate) wire: Arc<RecordingEncoder>,
}

impl Harness {
    pub(crate) fn new(factory: &dyn StreamFilterChainFactory, settings: ChainSettings) -> Self {
        let context = ChainContext {
            stream_id: StreamId::new(1),
            protocol: Protocol::FRAMED,
            role: Role::Server,
            connection: None,
        };
        let manager = FilterManager::new(&context, factory, &settings);
        let app = Arc::new(RecordingDecoder::default());
        let wire = Arc::new(RecordingEncoder::new(1));
        manager.bind_encoder(wire.clone());
        manager.bind_decoder(app.clone());
        Self { manager, app, wire }
    }

    pub(crate) fn app_seen(&self) -> Vec<Seen> {
        self.app.seen.lock().clone()
    }

    pub(crate) fn wire_seen(&self) -> Vec<Seen> {
        self.wire.seen.lock().clone()
    }
}

pub(crate) fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub(crate) fn kinds(seen: &[Seen]) -> Vec<FrameKind> {
    seen.iter()
        .map(|s| match s {
            Seen::Headers(..) => FrameKind::Headers,
            Seen::Data(..) => FrameKind::Data,
            Seen::Trailers(_) => FrameKind::Trailers,
        })
        .collect()
}
