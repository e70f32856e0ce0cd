//! Per-stream filter chain driver.
//!
//! `FilterManager` sits between a stream's codec side and its application
//! side. It is the `StreamDecoder` the connection feeds and the
//! `StreamEncoder` the application writes to; frames run through the
//! decoder or encoder filters before reaching the real sink.
//!
//! All chain work goes through one queue. Whoever finds the queue idle
//! becomes the driver and runs work until the queue is empty; everyone
//! else (another task resuming a filter, a filter calling back into its
//! own callbacks) only enqueues. No lock is held while a filter or sink runs.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, trace, warn};

use crate::config::StreamConfig;
use crate::filter::callbacks::{DecoderFilterCallbacks, EncoderFilterCallbacks};
use crate::filter::chain::{Added, Direction, Pipeline, StageOutcome, Verdict};
use crate::filter::route::{RequestInfo, Route, RouteResolver};
use crate::filter::traits::{
    ChainContext, CollectedChain, StreamDecoderFilter, StreamEncoderFilter, StreamFilterChainFactory,
};
use crate::net::Connection;
use crate::observability::metrics;
use crate::stream::{
    DownstreamWatermarkEventListener, Frame, HeaderMap, Protocol, Stream, StreamDecoder, StreamEncoder, StreamError,
    StreamEventListener, StreamId, StreamResetReason, WatermarkEvent,
};

/// Per-stream chain settings.
#[derive(Clone, Default)]
pub struct ChainSettings {
    /// Bytes a direction may hold in stopped stages. Zero means unlimited.
    pub decoder_buffer_limit: usize,
    pub encoder_buffer_limit: usize,
    pub route_resolver: Option<Arc<dyn RouteResolver>>,
}

impl ChainSettings {
    pub fn with_route_resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.route_resolver = Some(resolver);
        self
    }
}

impl From<&StreamConfig> for ChainSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            decoder_buffer_limit: config.decoder_buffer_limit,
            encoder_buffer_limit: config.encoder_buffer_limit,
            route_resolver: None,
        }
    }
}

enum Work {
    Frame {
        direction: Direction,
        frame: Frame,
        from: usize,
    },
    Resume {
        direction: Direction,
        index: usize,
    },
    AddData {
        direction: Direction,
        index: usize,
        data: BytesMut,
        streaming: bool,
    },
    Pressure {
        direction: Direction,
        above: bool,
    },
    Destroy,
}

struct EngineState {
    decode: Pipeline,
    encode: Pipeline,
    queue: VecDeque<Work>,
    driving: bool,
    reset: Option<StreamResetReason>,
    destroyed: bool,
    local_reply: bool,
    info: RequestInfo,
    request_headers: Option<HeaderMap>,
    /// `Some` once resolution ran.
    route: Option<Option<Arc<dyn Route>>>,
    decoder_pressure: u32,
    encoder_pressure: u32,
    downstream_listeners: Vec<Arc<dyn DownstreamWatermarkEventListener>>,
}

impl EngineState {
    fn pipeline(&mut self, direction: Direction) -> &mut Pipeline {
        match direction {
            Direction::Decode => &mut self.decode,
            Direction::Encode => &mut self.encode,
        }
    }

    fn is_closed(&self) -> bool {
        self.reset.is_some() || self.destroyed
    }

    fn closed_error(&self) -> StreamError {
        StreamError::StreamClosed(self.reset.unwrap_or(StreamResetReason::LocalReset))
    }

    /// Filters and sinks of `direction` may still run.
    fn accepts(&self, direction: Direction) -> bool {
        !self.is_closed() && !(direction == Direction::Decode && self.local_reply)
    }
}

/// Drives the decoder and encoder filter chains of one stream.
pub struct FilterManager {
    stream_id: StreamId,
    connection: Option<Arc<dyn Connection>>,
    self_ref: Weak<FilterManager>,
    stream: OnceLock<Stream>,
    encoder_sink: Mutex<Option<Arc<dyn StreamEncoder>>>,
    decoder_sink: Mutex<Option<Arc<dyn StreamDecoder>>>,
    decoder_filters: Vec<Mutex<Box<dyn StreamDecoderFilter>>>,
    encoder_filters: Vec<Mutex<Box<dyn StreamEncoderFilter>>>,
    route_resolver: Option<Arc<dyn RouteResolver>>,
    state: Mutex<EngineState>,
}

impl FilterManager {
    /// Build the chain for one stream. Sinks are bound afterwards.
    pub fn new(context: &ChainContext, factory: &dyn StreamFilterChainFactory, settings: &ChainSettings) -> Arc<Self> {
        let mut chain = CollectedChain::default();
        factory.create_filter_chain(context, &mut chain);

        debug!(
            stream_id = %context.stream_id,
            decoder_filters = chain.decoders.len(),
            encoder_filters = chain.encoders.len(),
            "Filter chain created"
        );

        let state = EngineState {
            decode: Pipeline::new(chain.decoders.len(), settings.decoder_buffer_limit),
            encode: Pipeline::new(chain.encoders.len(), settings.encoder_buffer_limit),
            queue: VecDeque::new(),
            driving: false,
            reset: None,
            destroyed: false,
            local_reply: false,
            info: RequestInfo::new(context.protocol, context.remote_addr()),
            request_headers: None,
            route: None,
            decoder_pressure: 0,
            encoder_pressure: 0,
            downstream_listeners: Vec::new(),
        };

        Arc::new_cyclic(|self_ref| Self {
            stream_id: context.stream_id,
            connection: context.connection.clone(),
            self_ref: self_ref.clone(),
            stream: OnceLock::new(),
            encoder_sink: Mutex::new(None),
            decoder_sink: Mutex::new(None),
            decoder_filters: chain.decoders.into_iter().map(Mutex::new).collect(),
            encoder_filters: chain.encoders.into_iter().map(Mutex::new).collect(),
            route_resolver: settings.route_resolver.clone(),
            state: Mutex::new(state),
        })
    }

    /// Install the wire-side encoder. Its stream becomes the stream of the
    /// chain and the manager starts listening to it.
    pub fn bind_encoder(&self, encoder: Arc<dyn StreamEncoder>) {
        let stream = encoder.stream();
        *self.encoder_sink.lock() = Some(encoder);

        if self.stream.set(stream.clone()).is_err() {
            return;
        }
        if let Some(me) = self.self_ref.upgrade() {
            stream.add_event_listener(me);
        }
        if let Some(reason) = stream.reset_reason() {
            self.on_reset_stream(reason);
        }
    }

    /// Install the application-side decoder.
    pub fn bind_decoder(&self, decoder: Arc<dyn StreamDecoder>) {
        *self.decoder_sink.lock() = Some(decoder);
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn protocol(&self) -> Protocol {
        self.state.lock().info.protocol()
    }

    pub fn request_info(&self) -> RequestInfo {
        self.state.lock().info.clone()
    }

    /// Whether `on_destroy` has run for the chain.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn bound_stream(&self) -> Option<Stream> {
        self.stream.get().cloned()
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.clone()
    }

    pub(crate) fn weak(&self) -> Weak<FilterManager> {
        self.self_ref.clone()
    }

    /// Reset through the stream so every listener hears it.
    pub(crate) fn reset(&self, reason: StreamResetReason) {
        match self.stream.get() {
            Some(stream) => {
                stream.reset_stream(reason);
            }
            None => self.on_reset_stream(reason),
        }
    }

    /// Lazily resolve and cache the route of the stream.
    pub(crate) fn route(&self) -> Option<Arc<dyn Route>> {
        let resolver = self.route_resolver.as_ref()?;
        let headers = {
            let state = self.state.lock();
            if let Some(route) = &state.route {
                return route.clone();
            }
            state.request_headers.clone()?
        };
        let route = resolver.resolve(&headers);
        self.state.lock().route = Some(route.clone());
        route
    }

    pub(crate) fn request_resume(&self, direction: Direction, index: usize) -> Result<(), StreamError> {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(state.closed_error());
            }
            state.pipeline(direction).request_resume(index)?;
        }
        trace!(stream_id = %self.stream_id, direction = direction.as_str(), index, "Filter resume requested");
        self.submit(Work::Resume { direction, index });
        Ok(())
    }

    pub(crate) fn check_add(&self, direction: Direction, index: usize) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        if state.is_closed() {
            return Err(state.closed_error());
        }
        state.pipeline(direction).check_add(index)
    }

    pub(crate) fn add_data_out_of_band(
        &self,
        direction: Direction,
        index: usize,
        data: &[u8],
        streaming: bool,
    ) -> Result<(), StreamError> {
        self.check_add(direction, index)?;
        self.submit(Work::AddData {
            direction,
            index,
            data: BytesMut::from(data),
            streaming,
        });
        Ok(())
    }

    /// Copy of the data held at a stopped stage.
    pub(crate) fn held_data(&self, direction: Direction, index: usize) -> Option<Bytes> {
        let mut state = self.state.lock();
        state
            .pipeline(direction)
            .held_data(index)
            .map(|data| Bytes::copy_from_slice(data))
    }

    pub(crate) fn modify_held_data(&self, direction: Direction, index: usize, f: impl FnOnce(&mut BytesMut)) -> bool {
        let mut state = self.state.lock();
        match state.pipeline(direction).held_data(index) {
            Some(data) => {
                f(data);
                true
            }
            None => false,
        }
    }

    pub(crate) fn buffer_limit(&self, direction: Direction) -> usize {
        self.state.lock().pipeline(direction).buffer_limit()
    }

    pub(crate) fn set_buffer_limit(&self, direction: Direction, limit: usize) {
        self.state.lock().pipeline(direction).set_buffer_limit(limit);
    }

    pub(crate) fn filter_watermark(&self, direction: Direction, above: bool) {
        self.submit(Work::Pressure { direction, above });
    }

    pub(crate) fn add_downstream_listener(&self, listener: Arc<dyn DownstreamWatermarkEventListener>) {
        let above = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            state.downstream_listeners.push(Arc::clone(&listener));
            state.encoder_pressure > 0
        };
        if above {
            listener.on_above_write_buffer_high_watermark();
        }
    }

    pub(crate) fn remove_downstream_listener(&self, listener: &Arc<dyn DownstreamWatermarkEventListener>) {
        let mut state = self.state.lock();
        state
            .downstream_listeners
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    /// Enter a frame at the top of the encoder chain. A local reply also
    /// stops further decoding.
    pub(crate) fn encode_input(&self, frame: Frame, local_reply: bool) -> Result<(), StreamError> {
        let started_local_reply = {
            let mut state = self.state.lock();
            if state.reset.is_some() {
                return Err(state.closed_error());
            }
            if state.destroyed {
                return Err(StreamError::EndStreamViolation { kind: frame.kind() });
            }
            state.encode.check_input(frame.kind(), frame.end_stream())?;
            let started = local_reply && !state.local_reply;
            if started {
                state.local_reply = true;
                state.info.local_reply = true;
            }
            started
        };
        if started_local_reply {
            debug!(stream_id = %self.stream_id, "Local reply started, decoding stopped");
        }
        self.submit(Work::Frame {
            direction: Direction::Encode,
            frame,
            from: 0,
        });
        Ok(())
    }

    fn decode_input(&self, frame: Frame) {
        let checked = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            let checked = state.decode.check_input(frame.kind(), frame.end_stream());
            if checked.is_ok() {
                if let Frame::Headers { headers, .. } = &frame {
                    state.request_headers = Some(headers.clone());
                }
                state.info.bytes_received += frame.data_len() as u64;
            }
            checked
        };
        if let Err(e) = checked {
            error!(stream_id = %self.stream_id, error = %e, "Decode frame violates stream contract");
            self.reset(StreamResetReason::LocalReset);
            return;
        }
        self.submit(Work::Frame {
            direction: Direction::Decode,
            frame,
            from: 0,
        });
    }

    fn submit(&self, work: Work) {
        {
            let mut state = self.state.lock();
            state.queue.push_back(work);
            if state.driving {
                return;
            }
            state.driving = true;
        }
        self.drive();
    }

    fn drive(&self) {
        loop {
            let work = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(work) => work,
                    None => {
                        state.driving = false;
                        return;
                    }
                }
            };
            self.run(work);
            self.check_complete();
        }
    }

    fn run(&self, work: Work) {
        match work {
            Work::Frame { direction, frame, from } => self.run_frames(direction, vec![frame], from),
            Work::Resume { direction, index } => {
                let outcome = {
                    let mut state = self.state.lock();
                    if !state.accepts(direction) {
                        return;
                    }
                    state.pipeline(direction).resume(index)
                };
                let released = self.apply_outcome(direction, index, outcome);
                self.run_frames(direction, released, index + 1);
            }
            Work::AddData {
                direction,
                index,
                data,
                streaming,
            } => {
                let forward = {
                    let mut state = self.state.lock();
                    if !state.accepts(direction) {
                        return;
                    }
                    state.pipeline(direction).add_data(index, data, streaming)
                };
                match forward {
                    Ok(Some(frame)) => self.run_frames(direction, vec![frame], index + 1),
                    Ok(None) => {}
                    Err(e) => warn!(
                        stream_id = %self.stream_id,
                        direction = direction.as_str(),
                        index,
                        error = %e,
                        "Dropping data added after end of stream"
                    ),
                }
            }
            Work::Pressure { direction, above } => self.apply_pressure(direction, above),
            Work::Destroy => self.destroy(),
        }
    }

    /// Run frames through the chain starting at stage `from`. Frames a
    /// stage releases are processed before the next input frame so every
    /// stage sees frames in order.
    fn run_frames(&self, direction: Direction, frames: Vec<Frame>, from: usize) {
        let len = match direction {
            Direction::Decode => self.decoder_filters.len(),
            Direction::Encode => self.encoder_filters.len(),
        };
        let mut pending: VecDeque<(Frame, usize)> = frames.into_iter().map(|f| (f, from)).collect();

        while let Some((mut frame, index)) = pending.pop_front() {
            {
                let mut state = self.state.lock();
                if !state.accepts(direction) {
                    return;
                }
                if index < len {
                    state.pipeline(direction).mark_invoked(index);
                }
            }

            if index == len {
                self.deliver(direction, frame);
                continue;
            }

            let (verdict, added) = self.invoke(direction, index, &mut frame);
            let outcome = {
                let mut state = self.state.lock();
                if state.is_closed() {
                    return;
                }
                state.pipeline(direction).on_filter_result(index, frame, verdict, added)
            };
            let released = self.apply_outcome(direction, index, outcome);
            for frame in released.into_iter().rev() {
                pending.push_front((frame, index + 1));
            }
        }
    }

    fn invoke(&self, direction: Direction, index: usize, frame: &mut Frame) -> (Verdict, Option<Added>) {
        match direction {
            Direction::Decode => {
                let callbacks = DecoderFilterCallbacks::new(self, index);
                let verdict = {
                    let mut filter = self.decoder_filters[index].lock();
                    match frame {
                        Frame::Headers { headers, end_stream } => {
                            filter.decode_headers(headers, *end_stream, &callbacks).into()
                        }
                        Frame::Data { data, end_stream } => filter.decode_data(data, *end_stream, &callbacks).into(),
                        Frame::Trailers(trailers) => filter.decode_trailers(trailers, &callbacks).into(),
                    }
                };
                (verdict, callbacks.into_added())
            }
            Direction::Encode => {
                let callbacks = EncoderFilterCallbacks::new(self, index);
                let verdict = {
                    let mut filter = self.encoder_filters[index].lock();
                    match frame {
                        Frame::Headers { headers, end_stream } => {
                            filter.encode_headers(headers, *end_stream, &callbacks).into()
                        }
                        Frame::Data { data, end_stream } => filter.encode_data(data, *end_stream, &callbacks).into(),
                        Frame::Trailers(trailers) => filter.encode_trailers(trailers, &callbacks).into(),
                    }
                };
                (verdict, callbacks.into_added())
            }
        }
    }

    fn apply_outcome(&self, direction: Direction, index: usize, outcome: StageOutcome) -> Vec<Frame> {
        if let Some(kind) = outcome.stopped {
            trace!(
                stream_id = %self.stream_id,
                direction = direction.as_str(),
                index,
                status = kind.as_str(),
                "Filter stopped iteration"
            );
            metrics::record_filter_stop(direction.as_str(), kind.as_str());
        }
        if let Some(event) = outcome.watermark {
            self.apply_pressure(direction, event == WatermarkEvent::AboveHigh);
        }
        if outcome.overflow {
            warn!(
                stream_id = %self.stream_id,
                direction = direction.as_str(),
                index,
                "Filter buffer limit exceeded"
            );
            self.reset(StreamResetReason::Overflow);
            return Vec::new();
        }
        outcome.release
    }

    fn deliver(&self, direction: Direction, frame: Frame) {
        {
            let mut state = self.state.lock();
            if !state.accepts(direction) {
                return;
            }
            if frame.end_stream() {
                state.pipeline(direction).set_sink_ended();
            }
            if direction == Direction::Encode {
                state.info.bytes_sent += frame.data_len() as u64;
            }
        }

        match direction {
            Direction::Decode => {
                let Some(decoder) = self.decoder_sink.lock().clone() else {
                    warn!(stream_id = %self.stream_id, "No decoder bound, dropping frame");
                    return;
                };
                match frame {
                    Frame::Headers { headers, end_stream } => decoder.on_decode_headers(headers, end_stream),
                    Frame::Data { data, end_stream } => decoder.on_decode_data(data.freeze(), end_stream),
                    Frame::Trailers(trailers) => decoder.on_decode_trailers(trailers),
                }
            }
            Direction::Encode => {
                let Some(encoder) = self.encoder_sink.lock().clone() else {
                    warn!(stream_id = %self.stream_id, "No encoder bound, dropping frame");
                    return;
                };
                let result = match frame {
                    Frame::Headers { headers, end_stream } => encoder.encode_headers(headers, end_stream),
                    Frame::Data { data, end_stream } => encoder.encode_data(data.freeze(), end_stream),
                    Frame::Trailers(trailers) => encoder.encode_trailers(trailers),
                };
                if let Err(e) = result {
                    warn!(stream_id = %self.stream_id, error = %e, "Wire encoder rejected frame");
                    self.reset(StreamResetReason::LocalReset);
                }
            }
        }
    }

    /// Apply one pressure edge. Decoder pressure read-disables the stream;
    /// encoder pressure reaches the downstream watermark listeners.
    fn apply_pressure(&self, direction: Direction, above: bool) {
        let listeners = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            let counter = match direction {
                Direction::Decode => &mut state.decoder_pressure,
                Direction::Encode => &mut state.encoder_pressure,
            };
            let edge = if above {
                *counter += 1;
                *counter == 1
            } else if *counter > 0 {
                *counter -= 1;
                *counter == 0
            } else {
                false
            };
            if !edge {
                return;
            }
            state.downstream_listeners.clone()
        };

        debug!(stream_id = %self.stream_id, direction = direction.as_str(), above, "Filter chain pressure changed");
        metrics::record_watermark_event("filter", if above { "above" } else { "below" });

        match direction {
            Direction::Decode => {
                if let Some(stream) = self.stream.get() {
                    stream.read_disable(above);
                }
            }
            Direction::Encode => {
                for listener in listeners {
                    if above {
                        listener.on_above_write_buffer_high_watermark();
                    } else {
                        listener.on_below_write_buffer_low_watermark();
                    }
                }
            }
        }
    }

    /// Destroy the chain once both directions reached their sinks. After a
    /// local reply the decode side only has to have ended at the input.
    fn check_complete(&self) {
        let complete = {
            let state = self.state.lock();
            !state.is_closed()
                && state.encode.sink_ended()
                && (state.decode.sink_ended() || (state.local_reply && state.decode.input_ended()))
        };
        if complete {
            self.destroy();
        }
    }

    fn destroy(&self) {
        let (release_read, paused) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.queue.clear();
            let listeners = std::mem::take(&mut state.downstream_listeners);
            // Listeners still paused by this stream get their release edge.
            let paused = if std::mem::take(&mut state.encoder_pressure) > 0 {
                listeners
            } else {
                Vec::new()
            };
            let release_read = std::mem::take(&mut state.decoder_pressure) > 0 && state.reset.is_none();
            (release_read, paused)
        };

        for filter in &self.decoder_filters {
            filter.lock().on_destroy();
        }
        for filter in &self.encoder_filters {
            filter.lock().on_destroy();
        }
        for listener in paused {
            listener.on_below_write_buffer_low_watermark();
        }

        if let Some(stream) = self.stream.get() {
            if release_read {
                stream.read_disable(false);
            }
            if let Some(me) = self.self_ref.upgrade() {
                let me: Arc<dyn StreamEventListener> = me;
                stream.remove_event_listener(&me);
            }
        }
        self.decoder_sink.lock().take();
        self.encoder_sink.lock().take();

        debug!(stream_id = %self.stream_id, "Filter chain destroyed");
    }
}

impl StreamDecoder for FilterManager {
    fn on_decode_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.decode_input(Frame::Headers { headers, end_stream });
    }

    fn on_decode_data(&self, data: Bytes, end_stream: bool) {
        self.decode_input(Frame::Data {
            data: BytesMut::from(data.as_ref()),
            end_stream,
        });
    }

    fn on_decode_trailers(&self, trailers: HeaderMap) {
        self.decode_input(Frame::Trailers(trailers));
    }
}

impl StreamEncoder for FilterManager {
    fn encode_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        self.encode_input(Frame::Headers { headers, end_stream }, false)
    }

    fn encode_data(&self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.encode_input(
            Frame::Data {
                data: BytesMut::from(data.as_ref()),
                end_stream,
            },
            false,
        )
    }

    fn encode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.encode_input(Frame::Trailers(trailers), false)
    }

    fn stream(&self) -> Stream {
        self.bound_stream().unwrap_or_else(|| Stream::new(self.stream_id))
    }
}

impl StreamEventListener for FilterManager {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            state.reset = Some(reason);
            state.info.reset_reason = Some(reason);
        }
        debug!(stream_id = %self.stream_id, reason = %reason, "Filter chain reset");
        self.submit(Work::Destroy);
    }

    fn on_above_write_buffer_high_watermark(&self) {
        self.submit(Work::Pressure {
            direction: Direction::Encode,
            above: true,
        });
    }

    fn on_below_write_buffer_low_watermark(&self) {
        self.submit(Work::Pressure {
            direction: Direction::Encode,
            above: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::callbacks::{DecoderFilterHandle, EncoderFilterHandle, StreamFilterCallbacks};
    use crate::filter::status::{FilterDataStatus, FilterHeadersStatus};
    use crate::filter::testing::{headers, kinds, FnFactory, Harness, Seen};
    use crate::filter::traits::StreamFilterBase;
    use crate::filter::{DecoderFilterCallbacks, EncoderFilterCallbacks};
    use crate::stream::FrameKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Witness {
        calls: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
        handle: Arc<Mutex<Option<DecoderFilterHandle>>>,
    }

    impl Witness {
        fn handle(&self) -> DecoderFilterHandle {
            self.handle.lock().clone().expect("filter saw headers")
        }
    }

    struct Scripted {
        headers: FilterHeadersStatus,
        data: FilterDataStatus,
        witness: Witness,
    }

    impl StreamFilterBase for Scripted {
        fn on_destroy(&mut self) {
            self.witness.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StreamDecoderFilter for Scripted {
        fn decode_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end_stream: bool,
            callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            self.witness.calls.fetch_add(1, Ordering::SeqCst);
            *self.witness.handle.lock() = Some(callbacks.handle());
            self.headers
        }

        fn decode_data(
            &mut self,
            _data: &mut BytesMut,
            _end_stream: bool,
            _callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterDataStatus {
            self.witness.calls.fetch_add(1, Ordering::SeqCst);
            self.data
        }
    }

    fn scripted(headers: FilterHeadersStatus, data: FilterDataStatus, witness: &Witness) -> Box<dyn StreamDecoderFilter> {
        Box::new(Scripted {
            headers,
            data,
            witness: witness.clone(),
        })
    }

    fn pass(witness: &Witness) -> Box<dyn StreamDecoderFilter> {
        scripted(FilterHeadersStatus::Continue, FilterDataStatus::Continue, witness)
    }

    #[test]
    fn continue_everywhere_delivers_input_unchanged() {
        let (a, b) = (Witness::default(), Witness::default());
        let (pa, pb) = (a.clone(), b.clone());
        let factory = FnFactory::decoders(move || vec![pass(&pa), pass(&pb)]);
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[(":path", "/")]), false);
        harness.manager.on_decode_data(Bytes::from_static(b"hello"), true);

        assert_eq!(
            harness.app_seen(),
            vec![
                Seen::Headers(headers(&[(":path", "/")]), false),
                Seen::Data(Bytes::from_static(b"hello"), true),
            ]
        );
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn buffered_data_replays_once_after_resume_from_another_thread() {
        let (a, b) = (Witness::default(), Witness::default());
        let (pa, pb) = (a.clone(), b.clone());
        let factory = FnFactory::decoders(move || {
            vec![
                scripted(FilterHeadersStatus::StopIteration, FilterDataStatus::StopIterationAndBuffer, &pa),
                pass(&pb),
            ]
        });
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[(":path", "/")]), false);
        harness.manager.on_decode_data(Bytes::from_static(b"hel"), false);
        harness.manager.on_decode_data(Bytes::from_static(b"lo"), true);
        assert!(harness.app_seen().is_empty());
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);

        let handle = a.handle();
        handle.add_decoded_data(b"!", false).unwrap();
        std::thread::spawn(move || handle.continue_decoding().unwrap())
            .join()
            .unwrap();

        assert_eq!(
            harness.app_seen(),
            vec![
                Seen::Headers(headers(&[(":path", "/")]), false),
                Seen::Data(Bytes::from_static(b"hello!"), true),
            ]
        );
        // Frames are never replayed to the stage that stopped them.
        assert_eq!(a.calls.load(Ordering::SeqCst), 3);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn watermark_stop_read_disables_until_resume() {
        let witness = Witness::default();
        let p = witness.clone();
        let factory = FnFactory::decoders(move || {
            vec![scripted(FilterHeadersStatus::Continue, FilterDataStatus::StopIterationAndWatermark, &p)]
        });
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), false);
        harness.manager.on_decode_data(Bytes::from_static(b"x"), false);
        assert!(harness.wire.stream.is_read_disabled());
        assert_eq!(kinds(&harness.app_seen()), vec![FrameKind::Headers]);

        witness.handle().continue_decoding().unwrap();
        assert!(!harness.wire.stream.is_read_disabled());
        assert_eq!(kinds(&harness.app_seen()), vec![FrameKind::Headers, FrameKind::Data]);
    }

    #[test]
    fn resume_of_flowing_filter_is_rejected() {
        let witness = Witness::default();
        let p = witness.clone();
        let factory = FnFactory::decoders(move || vec![pass(&p)]);
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), false);
        assert!(matches!(
            witness.handle().continue_decoding(),
            Err(StreamError::NotHalted { index: 0 })
        ));
    }

    #[test]
    fn reset_while_stopped_destroys_once_and_disarms_handles() {
        let witness = Witness::default();
        let p = witness.clone();
        let factory = FnFactory::decoders(move || {
            vec![scripted(FilterHeadersStatus::StopIteration, FilterDataStatus::Continue, &p)]
        });
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), false);
        assert!(harness.wire.stream.reset_stream(StreamResetReason::RemoteReset));
        assert!(!harness.wire.stream.reset_stream(StreamResetReason::LocalReset));
        assert_eq!(witness.destroyed.load(Ordering::SeqCst), 1);

        assert!(matches!(
            witness.handle().continue_decoding(),
            Err(StreamError::StreamClosed(StreamResetReason::RemoteReset))
        ));
        harness.manager.on_decode_data(Bytes::from_static(b"late"), true);
        assert_eq!(witness.calls.load(Ordering::SeqCst), 1);
        assert!(harness.app_seen().is_empty());
        assert_eq!(
            harness.manager.request_info().reset_reason(),
            Some(StreamResetReason::RemoteReset)
        );
    }

    #[test]
    fn completion_destroys_and_detaches_from_stream() {
        let witness = Witness::default();
        let p = witness.clone();
        let factory = FnFactory::decoders(move || vec![pass(&p)]);
        let harness = Harness::new(&factory, ChainSettings::default());
        assert_eq!(harness.wire.stream.listener_count(), 1);

        harness.manager.on_decode_headers(headers(&[]), true);
        harness.manager.encode_headers(headers(&[(":status", "200")]), false).unwrap();
        harness.manager.encode_data(Bytes::from_static(b"ok"), true).unwrap();

        assert_eq!(witness.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(harness.wire.stream.listener_count(), 0);
        assert_eq!(harness.manager.request_info().bytes_sent(), 2);
        assert!(matches!(
            harness.manager.encode_data(Bytes::from_static(b"more"), true),
            Err(StreamError::EndStreamViolation { .. })
        ));
    }

    #[test]
    fn encode_after_end_is_rejected() {
        let factory = FnFactory::decoders(Vec::new);
        let harness = Harness::new(&factory, ChainSettings::default());
        harness.manager.encode_headers(headers(&[]), true).unwrap();
        assert!(matches!(
            harness.manager.encode_trailers(headers(&[])),
            Err(StreamError::EndStreamViolation { kind: FrameKind::Trailers })
        ));
        assert_eq!(kinds(&harness.wire_seen()), vec![FrameKind::Headers]);
    }

    struct Tag(&'static str);

    impl StreamFilterBase for Tag {}

    impl StreamEncoderFilter for Tag {
        fn encode_headers(
            &mut self,
            headers: &mut HeaderMap,
            _end_stream: bool,
            _callbacks: &EncoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            headers
                .entry("x-order".to_string())
                .and_modify(|v| {
                    v.push(',');
                    v.push_str(self.0);
                })
                .or_insert_with(|| self.0.to_string());
            FilterHeadersStatus::Continue
        }
    }

    #[test]
    fn encoder_chain_runs_in_add_order() {
        let factory = FnFactory::encoders(|| vec![Box::new(Tag("a")), Box::new(Tag("b"))]);
        let harness = Harness::new(&factory, ChainSettings::default());
        harness.manager.encode_headers(headers(&[]), true).unwrap();
        assert_eq!(
            harness.wire_seen(),
            vec![Seen::Headers(headers(&[("x-order", "a,b")]), true)]
        );
    }

    #[derive(Default)]
    struct Pressure {
        above: AtomicUsize,
        below: AtomicUsize,
    }

    impl DownstreamWatermarkEventListener for Pressure {
        fn on_above_write_buffer_high_watermark(&self) {
            self.above.fetch_add(1, Ordering::SeqCst);
        }

        fn on_below_write_buffer_low_watermark(&self) {
            self.below.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Registers(Arc<Pressure>);

    impl StreamFilterBase for Registers {}

    impl StreamDecoderFilter for Registers {
        fn decode_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end_stream: bool,
            callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            assert_eq!(callbacks.stream_id(), StreamId::new(1));
            callbacks.add_downstream_watermark_callbacks(self.0.clone());
            FilterHeadersStatus::Continue
        }
    }

    #[test]
    fn connection_pressure_reaches_downstream_listeners() {
        let pressure = Arc::new(Pressure::default());
        let p = pressure.clone();
        let factory = FnFactory::decoders(move || vec![Box::new(Registers(p.clone()))]);
        let harness = Harness::new(&factory, ChainSettings::default());

        // Registered while the connection is already backed up.
        harness.wire.stream.run_high_watermark_callbacks();
        harness.manager.on_decode_headers(headers(&[]), false);
        assert_eq!(pressure.above.load(Ordering::SeqCst), 1);

        harness.wire.stream.run_low_watermark_callbacks();
        assert_eq!(pressure.below.load(Ordering::SeqCst), 1);
    }

    #[derive(Clone, Default)]
    struct Held {
        handle: Arc<Mutex<Option<EncoderFilterHandle>>>,
        buffers: Arc<Mutex<Vec<Option<Bytes>>>>,
        destroyed: Arc<AtomicUsize>,
    }

    /// Holds the response at its headers and buffers the body. With
    /// `resume_at_end` it upper-cases what it held and resumes itself on
    /// the last chunk.
    struct Gate {
        held: Held,
        resume_at_end: bool,
    }

    impl StreamFilterBase for Gate {
        fn on_destroy(&mut self) {
            self.held.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StreamEncoderFilter for Gate {
        fn encode_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end_stream: bool,
            callbacks: &EncoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            *self.held.handle.lock() = Some(callbacks.handle());
            FilterHeadersStatus::StopIteration
        }

        fn encode_data(
            &mut self,
            _data: &mut BytesMut,
            end_stream: bool,
            callbacks: &EncoderFilterCallbacks<'_>,
        ) -> FilterDataStatus {
            self.held.buffers.lock().push(callbacks.encoding_buffer());
            if end_stream && self.resume_at_end {
                assert!(callbacks.modify_encoding_buffer(|held| held.make_ascii_uppercase()));
                callbacks.continue_encoding().unwrap();
            }
            FilterDataStatus::StopIterationAndBuffer
        }
    }

    fn gated_response(resume_at_end: bool) -> (Harness, Held) {
        let held = Held::default();
        let h = held.clone();
        let factory = FnFactory::encoders(move || {
            vec![Box::new(Gate {
                held: h.clone(),
                resume_at_end,
            })]
        });
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), true);
        harness.manager.encode_headers(headers(&[(":status", "200")]), false).unwrap();
        harness.manager.encode_data(Bytes::from_static(b"ab"), false).unwrap();
        harness.manager.encode_data(Bytes::from_static(b"cd"), true).unwrap();
        (harness, held)
    }

    #[test]
    fn stopped_encoder_resumes_from_retained_handle() {
        let (harness, held) = gated_response(false);
        assert!(harness.wire_seen().is_empty());
        assert_eq!(*held.buffers.lock(), vec![None, Some(Bytes::from_static(b"ab"))]);

        let handle = held.handle.lock().clone().unwrap();
        handle.continue_encoding().unwrap();

        assert_eq!(
            harness.wire_seen(),
            vec![
                Seen::Headers(headers(&[(":status", "200")]), false),
                Seen::Data(Bytes::from_static(b"abcd"), true),
            ]
        );
        assert!(harness.manager.is_destroyed());
        assert_eq!(held.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(handle.continue_encoding(), Err(StreamError::StreamClosed(_))));
    }

    #[test]
    fn encoder_resume_inside_invocation_releases_edited_buffer() {
        let (harness, held) = gated_response(true);
        assert_eq!(
            harness.wire_seen(),
            vec![
                Seen::Headers(headers(&[(":status", "200")]), false),
                Seen::Data(Bytes::from_static(b"ABcd"), true),
            ]
        );
        assert_eq!(held.destroyed.load(Ordering::SeqCst), 1);
    }

    /// Replaces each chunk with an upper-cased copy it streams on at once.
    struct Upcase {
        handle: Arc<Mutex<Option<DecoderFilterHandle>>>,
    }

    impl StreamFilterBase for Upcase {}

    impl StreamDecoderFilter for Upcase {
        fn decode_data(
            &mut self,
            data: &mut BytesMut,
            _end_stream: bool,
            callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterDataStatus {
            *self.handle.lock() = Some(callbacks.handle());
            callbacks.add_decoded_data(&data.to_ascii_uppercase(), true).unwrap();
            FilterDataStatus::StopIterationNoBuffer
        }
    }

    #[test]
    fn no_buffer_stop_forwards_streamed_rewrite_and_holds_end() {
        let handle = Arc::new(Mutex::new(None));
        let h = handle.clone();
        let factory = FnFactory::decoders(move || vec![Box::new(Upcase { handle: h.clone() })]);
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), false);
        harness.manager.on_decode_data(Bytes::from_static(b"ab"), false);
        harness.manager.on_decode_data(Bytes::from_static(b"cd"), true);
        assert_eq!(
            harness.app_seen()[1..],
            [
                Seen::Data(Bytes::from_static(b"AB"), false),
                Seen::Data(Bytes::from_static(b"CD"), false),
            ]
        );

        let handle: DecoderFilterHandle = handle.lock().clone().unwrap();
        handle.continue_decoding().unwrap();
        assert_eq!(harness.app_seen().last(), Some(&Seen::Data(Bytes::new(), true)));
    }

    struct DecodeThrottle {
        pressure: Arc<Pressure>,
        handle: Arc<Mutex<Option<DecoderFilterHandle>>>,
    }

    impl StreamFilterBase for DecodeThrottle {}

    impl StreamDecoderFilter for DecodeThrottle {
        fn decode_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end_stream: bool,
            callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            callbacks.add_downstream_watermark_callbacks(self.pressure.clone());
            callbacks.on_decoder_filter_above_write_buffer_high_watermark();
            *self.handle.lock() = Some(callbacks.handle());
            FilterHeadersStatus::Continue
        }
    }

    struct EncodeThrottle {
        handle: Arc<Mutex<Option<EncoderFilterHandle>>>,
    }

    impl StreamFilterBase for EncodeThrottle {}

    impl StreamEncoderFilter for EncodeThrottle {
        fn encode_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end_stream: bool,
            callbacks: &EncoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            callbacks.on_encoder_filter_above_write_buffer_high_watermark();
            *self.handle.lock() = Some(callbacks.handle());
            FilterHeadersStatus::Continue
        }
    }

    #[test]
    fn filter_watermarks_pause_reads_and_notify_listeners() {
        let pressure = Arc::new(Pressure::default());
        let decode_handle = Arc::new(Mutex::new(None));
        let encode_handle = Arc::new(Mutex::new(None));
        let (p, dh, eh) = (pressure.clone(), decode_handle.clone(), encode_handle.clone());
        let factory = FnFactory::new(
            move || {
                vec![Box::new(DecodeThrottle {
                    pressure: p.clone(),
                    handle: dh.clone(),
                })]
            },
            move || vec![Box::new(EncodeThrottle { handle: eh.clone() })],
        );
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), false);
        assert!(harness.wire.stream.is_read_disabled());
        let decode_handle: DecoderFilterHandle = decode_handle.lock().clone().unwrap();
        decode_handle.on_decoder_filter_below_write_buffer_low_watermark();
        assert!(!harness.wire.stream.is_read_disabled());

        harness.manager.encode_headers(headers(&[(":status", "200")]), false).unwrap();
        assert_eq!(pressure.above.load(Ordering::SeqCst), 1);
        let encode_handle: EncoderFilterHandle = encode_handle.lock().clone().unwrap();
        encode_handle.on_encoder_filter_below_write_buffer_low_watermark();
        assert_eq!(pressure.below.load(Ordering::SeqCst), 1);
    }

    /// Registers a listener on the headers and drops it on the first data.
    struct Unregisters(Arc<Pressure>);

    impl StreamFilterBase for Unregisters {}

    impl StreamDecoderFilter for Unregisters {
        fn decode_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end_stream: bool,
            callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterHeadersStatus {
            callbacks.add_downstream_watermark_callbacks(self.0.clone());
            FilterHeadersStatus::Continue
        }

        fn decode_data(
            &mut self,
            _data: &mut BytesMut,
            _end_stream: bool,
            callbacks: &DecoderFilterCallbacks<'_>,
        ) -> FilterDataStatus {
            let listener: Arc<dyn DownstreamWatermarkEventListener> = self.0.clone();
            callbacks.remove_downstream_watermark_callbacks(&listener);
            FilterDataStatus::Continue
        }
    }

    #[test]
    fn removed_listener_hears_no_pressure() {
        let pressure = Arc::new(Pressure::default());
        let p = pressure.clone();
        let factory = FnFactory::decoders(move || vec![Box::new(Unregisters(p.clone()))]);
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), false);
        harness.manager.on_decode_data(Bytes::from_static(b"x"), false);
        harness.wire.stream.run_high_watermark_callbacks();
        assert_eq!(pressure.above.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn destroy_releases_listeners_still_paused() {
        let pressure = Arc::new(Pressure::default());
        let p = pressure.clone();
        let factory = FnFactory::decoders(move || vec![Box::new(Registers(p.clone()))]);
        let harness = Harness::new(&factory, ChainSettings::default());

        harness.manager.on_decode_headers(headers(&[]), true);
        harness.wire.stream.run_high_watermark_callbacks();
        assert_eq!(pressure.above.load(Ordering::SeqCst), 1);

        harness.manager.encode_headers(headers(&[(":status", "200")]), true).unwrap();
        assert!(harness.manager.is_destroyed());
        assert_eq!(pressure.below.load(Ordering::SeqCst), 1);

        harness.wire.stream.run_low_watermark_callbacks();
        assert_eq!(pressure.below.load(Ordering::SeqCst), 1);
    }
}
