//! Per-stream inbound delivery gate.
//!
//! Frames are queued in arrival order and handed to the stream's decoder
//! by a single active drainer. While the stream is read-disabled the
//! queue only grows; enabling it drains the backlog before anything newer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::stream::{Frame, StreamDecoder, StreamId};

struct GateState {
    decoder: Option<Arc<dyn StreamDecoder>>,
    pending: VecDeque<Frame>,
    disabled: bool,
    draining: bool,
    closed: bool,
    end_delivered: bool,
}

pub(crate) struct InboundGate {
    stream_id: StreamId,
    state: Mutex<GateState>,
}

impl InboundGate {
    pub(crate) fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            state: Mutex::new(GateState {
                decoder: None,
                pending: VecDeque::new(),
                disabled: false,
                draining: false,
                closed: false,
                end_delivered: false,
            }),
        }
    }

    /// Attach the decoder. Frames queued before binding are delivered now.
    pub(crate) fn bind(&self, decoder: Arc<dyn StreamDecoder>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.decoder = Some(decoder);
        }
        self.drain();
    }

    /// Queue a frame and deliver it unless the gate is paused.
    pub(crate) fn push(&self, frame: Frame) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.pending.push_back(frame);
        }
        self.drain();
    }

    pub(crate) fn set_disabled(&self, disabled: bool) {
        {
            let mut state = self.state.lock();
            if state.disabled == disabled {
                return;
            }
            state.disabled = disabled;
        }
        if !disabled {
            self.drain();
        }
    }

    /// Drop the decoder and any undelivered frames.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.decoder = None;
        state.pending.clear();
    }

    /// True once a frame ending the inbound direction reached the decoder.
    pub(crate) fn end_delivered(&self) -> bool {
        self.state.lock().end_delivered
    }

    pub(crate) fn pending_frames(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let (decoder, frame) = {
                let mut state = self.state.lock();
                let decoder = match &state.decoder {
                    Some(decoder) if !state.disabled && !state.closed => Arc::clone(decoder),
                    _ => {
                        state.draining = false;
                        return;
                    }
                };
                match state.pending.pop_front() {
                    Some(frame) => {
                        if frame.end_stream() {
                            state.end_delivered = true;
                        }
                        (decoder, frame)
                    }
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            tracing::trace!(stream_id = %self.stream_id, kind = %frame.kind(), "Delivering inbound frame");
            match frame {
                Frame::Headers { headers, end_stream } => decoder.on_decode_headers(headers, end_stream),
                Frame::Data { data, end_stream } => decoder.on_decode_data(data.freeze(), end_stream),
                Frame::Trailers(trailers) => decoder.on_decode_trailers(trailers),
            }
        }
    }
}
