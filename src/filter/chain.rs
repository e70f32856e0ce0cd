//! Per-direction chain iteration state.
//!
//! A `Pipeline` records, for every filter stage of one direction, whether
//! the stage is stopped and which frames it holds. It never calls filters;
//! the `FilterManager` feeds it verdicts and forwards what it releases.
//!
//! # Stage States
//! ```text
//! Flowing --Stop*--> Stopped --Continue / resume--> Flowing
//!    |                  |
//!    |                  +-- later frames still reach the filter and are
//!    |                      held, dropped (NoBuffer) or released (Continue)
//!    +-- held frames: always empty
//! ```

use bytes::BytesMut;
use std::collections::VecDeque;

use crate::filter::status::{FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus};
use crate::stream::{Frame, FrameKind, FrameOrder, StreamError, WatermarkEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Decode,
    Encode,
}

impl Direction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Direction::Decode => "decode",
            Direction::Encode => "encode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    /// Headers or trailers `StopIteration`.
    Iteration,
    Buffer,
    Watermark,
    NoBuffer,
}

impl StopKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            StopKind::Iteration => "StopIteration",
            StopKind::Buffer => "StopIterationAndBuffer",
            StopKind::Watermark => "StopIterationAndWatermark",
            StopKind::NoBuffer => "StopIterationNoBuffer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    Stop(StopKind),
}

impl From<FilterHeadersStatus> for Verdict {
    fn from(status: FilterHeadersStatus) -> Self {
        match status {
            FilterHeadersStatus::Continue => Verdict::Continue,
            FilterHeadersStatus::StopIteration => Verdict::Stop(StopKind::Iteration),
        }
    }
}

impl From<FilterDataStatus> for Verdict {
    fn from(status: FilterDataStatus) -> Self {
        match status {
            FilterDataStatus::Continue => Verdict::Continue,
            FilterDataStatus::StopIterationAndBuffer => Verdict::Stop(StopKind::Buffer),
            FilterDataStatus::StopIterationAndWatermark => Verdict::Stop(StopKind::Watermark),
            FilterDataStatus::StopIterationNoBuffer => Verdict::Stop(StopKind::NoBuffer),
        }
    }
}

impl From<FilterTrailersStatus> for Verdict {
    fn from(status: FilterTrailersStatus) -> Self {
        match status {
            FilterTrailersStatus::Continue => Verdict::Continue,
            FilterTrailersStatus::StopIteration => Verdict::Stop(StopKind::Iteration),
        }
    }
}

/// Bytes a filter added through its callbacks during one invocation.
#[derive(Debug, Default)]
pub(crate) struct Added {
    pub(crate) data: BytesMut,
    pub(crate) streaming: bool,
}

/// What the manager must do after a stage changed.
#[derive(Debug, Default)]
pub(crate) struct StageOutcome {
    /// Frames for the next stage, in order.
    pub(crate) release: Vec<Frame>,
    /// A buffering stop pushed the direction over its buffer limit.
    pub(crate) overflow: bool,
    pub(crate) watermark: Option<WatermarkEvent>,
    pub(crate) stopped: Option<StopKind>,
}

#[derive(Debug, Default)]
struct Stage {
    halted: bool,
    resume_pending: bool,
    raised_watermark: bool,
    /// The filter has been called at least once.
    invoked: bool,
    /// A frame ending the direction has left this stage.
    end_forwarded: bool,
    parked: VecDeque<Frame>,
}

impl Stage {
    /// Hold a frame, coalescing consecutive data.
    fn park(&mut self, frame: Frame) {
        if let Frame::Data { data, end_stream } = &frame {
            if let Some(Frame::Data {
                data: held,
                end_stream: held_end,
            }) = self.parked.back_mut()
            {
                held.extend_from_slice(data);
                *held_end |= *end_stream;
                return;
            }
        }
        self.parked.push_back(frame);
    }

    /// Merge added bytes into the held frames: after headers, appended to
    /// data, before trailers.
    fn absorb(&mut self, data: BytesMut) {
        match self.parked.back_mut() {
            Some(Frame::Data { data: held, .. }) => held.extend_from_slice(&data),
            Some(Frame::Headers { end_stream, .. }) => {
                let end_stream = std::mem::take(end_stream);
                self.parked.push_back(Frame::Data { data, end_stream });
            }
            Some(Frame::Trailers(_)) => {
                let at = self.parked.len() - 1;
                match at.checked_sub(1).and_then(|i| self.parked.get_mut(i)) {
                    Some(Frame::Data { data: held, .. }) => held.extend_from_slice(&data),
                    _ => self.parked.insert(at, Frame::Data { data, end_stream: false }),
                }
            }
            None => self.parked.push_back(Frame::Data { data, end_stream: false }),
        }
    }

    fn held_bytes(&self) -> usize {
        self.parked.iter().map(Frame::data_len).sum()
    }

    fn held_data(&mut self) -> Option<&mut BytesMut> {
        self.parked.iter_mut().find_map(|frame| match frame {
            Frame::Data { data, .. } => Some(data),
            _ => None,
        })
    }

    fn note_forwarded(&mut self, frames: &[Frame]) {
        if frames.iter().any(Frame::end_stream) {
            self.end_forwarded = true;
        }
    }

    fn release(&mut self) -> Vec<Frame> {
        let frames: Vec<Frame> = self.parked.drain(..).collect();
        self.note_forwarded(&frames);
        frames
    }
}

/// Join in-invocation bytes to the frame in flight.
fn merge(frame: Frame, added: Option<BytesMut>) -> Vec<Frame> {
    let Some(added) = added else {
        return vec![frame];
    };
    match frame {
        Frame::Headers { headers, end_stream } => vec![
            Frame::Headers {
                headers,
                end_stream: false,
            },
            Frame::Data {
                data: added,
                end_stream,
            },
        ],
        Frame::Data { mut data, end_stream } => {
            data.extend_from_slice(&added);
            vec![Frame::Data { data, end_stream }]
        }
        Frame::Trailers(trailers) => vec![
            Frame::Data {
                data: added,
                end_stream: false,
            },
            Frame::Trailers(trailers),
        ],
    }
}

/// Iteration state of one direction of one stream.
#[derive(Debug)]
pub(crate) struct Pipeline {
    stages: Vec<Stage>,
    buffer_limit: usize,
    /// Order of frames entering the chain.
    input: FrameOrder,
    /// The terminal sink has received the end of the direction.
    sink_ended: bool,
}

impl Pipeline {
    pub(crate) fn new(len: usize, buffer_limit: usize) -> Self {
        Self {
            stages: (0..len).map(|_| Stage::default()).collect(),
            buffer_limit,
            input: FrameOrder::new(),
            sink_ended: false,
        }
    }

    pub(crate) fn check_input(&mut self, kind: FrameKind, end_stream: bool) -> Result<(), StreamError> {
        self.input.check(kind, end_stream)
    }

    pub(crate) fn input_ended(&self) -> bool {
        self.input.is_ended()
    }

    pub(crate) fn sink_ended(&self) -> bool {
        self.sink_ended
    }

    pub(crate) fn set_sink_ended(&mut self) {
        self.sink_ended = true;
    }

    pub(crate) fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    pub(crate) fn set_buffer_limit(&mut self, limit: usize) {
        self.buffer_limit = limit;
    }

    /// Data bytes held across every stage.
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.stages.iter().map(Stage::held_bytes).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_halted(&self, index: usize) -> bool {
        self.stages[index].halted
    }

    pub(crate) fn mark_invoked(&mut self, index: usize) {
        self.stages[index].invoked = true;
    }

    pub(crate) fn held_data(&mut self, index: usize) -> Option<&mut BytesMut> {
        self.stages[index].held_data()
    }

    /// Apply a filter's verdict on `frame`.
    pub(crate) fn on_filter_result(
        &mut self,
        index: usize,
        frame: Frame,
        verdict: Verdict,
        added: Option<Added>,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let added = added.filter(|a| !a.data.is_empty());

        let kind = match verdict {
            Verdict::Continue => {
                let stage = &mut self.stages[index];
                stage.halted = false;
                stage.resume_pending = false;
                if std::mem::take(&mut stage.raised_watermark) {
                    outcome.watermark = Some(WatermarkEvent::BelowLow);
                }
                outcome.release = stage.release();
                let group = merge(frame, added.map(|a| a.data));
                stage.note_forwarded(&group);
                outcome.release.extend(group);
                return outcome;
            }
            Verdict::Stop(kind) => kind,
        };

        outcome.stopped = Some(kind);
        let stage = &mut self.stages[index];
        stage.halted = true;

        if kind == StopKind::NoBuffer {
            let nothing_held = stage.parked.is_empty();
            if let Some(added) = added {
                if added.streaming && nothing_held {
                    outcome.release.push(Frame::Data {
                        data: added.data,
                        end_stream: false,
                    });
                } else {
                    stage.absorb(added.data);
                }
            }
            // The bytes are dropped; the end of the direction is not.
            if frame.end_stream() {
                stage.park(Frame::Data {
                    data: BytesMut::new(),
                    end_stream: true,
                });
            }
        } else {
            for held in merge(frame, added.map(|a| a.data)) {
                stage.park(held);
            }
        }

        if kind == StopKind::Watermark && !stage.raised_watermark {
            stage.raised_watermark = true;
            outcome.watermark = Some(WatermarkEvent::AboveHigh);
        }
        if kind == StopKind::Buffer && self.buffer_limit > 0 && self.buffered_bytes() > self.buffer_limit {
            outcome.overflow = true;
        }
        outcome
    }

    /// Validate a resume request for a stopped stage and mark it pending.
    pub(crate) fn request_resume(&mut self, index: usize) -> Result<(), StreamError> {
        let stage = &mut self.stages[index];
        if !stage.halted || stage.resume_pending {
            return Err(StreamError::NotHalted { index });
        }
        stage.resume_pending = true;
        Ok(())
    }

    /// Carry out a pending resume. A stage resumed implicitly in the
    /// meantime has nothing left to release.
    pub(crate) fn resume(&mut self, index: usize) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let stage = &mut self.stages[index];
        if !stage.halted || !stage.resume_pending {
            return outcome;
        }
        stage.halted = false;
        stage.resume_pending = false;
        if std::mem::take(&mut stage.raised_watermark) {
            outcome.watermark = Some(WatermarkEvent::BelowLow);
        }
        outcome.release = stage.release();
        outcome
    }

    /// Whether data may still be added at `index`.
    pub(crate) fn check_add(&self, index: usize) -> Result<(), StreamError> {
        let stage = &self.stages[index];
        if stage.end_forwarded {
            return Err(StreamError::EndStreamViolation { kind: FrameKind::Data });
        }
        if !stage.invoked {
            return Err(StreamError::FrameOrder { kind: FrameKind::Data });
        }
        Ok(())
    }

    /// Add data outside a filter invocation. Returns a frame to forward to
    /// the next stage now, or `None` when the bytes joined the held data.
    pub(crate) fn add_data(
        &mut self,
        index: usize,
        data: BytesMut,
        streaming: bool,
    ) -> Result<Option<Frame>, StreamError> {
        self.check_add(index)?;
        let stage = &mut self.stages[index];
        if !stage.halted || (streaming && stage.parked.is_empty()) {
            return Ok(Some(Frame::Data {
                data,
                end_stream: false,
            }));
        }
        stage.absorb(data);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::HeaderMap;

    fn headers(end_stream: bool) -> Frame {
        Frame::Headers {
            headers: HeaderMap::new(),
            end_stream,
        }
    }

    fn data(bytes: &[u8], end_stream: bool) -> Frame {
        Frame::Data {
            data: BytesMut::from(bytes),
            end_stream,
        }
    }

    fn added(bytes: &[u8], streaming: bool) -> Option<Added> {
        Some(Added {
            data: BytesMut::from(bytes),
            streaming,
        })
    }

    #[test]
    fn continue_passes_frame_through() {
        let mut pipeline = Pipeline::new(2, 0);
        pipeline.mark_invoked(0);
        let outcome = pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        assert_eq!(outcome.release, vec![headers(false)]);
        assert!(!pipeline.is_halted(0));
    }

    #[test]
    fn buffered_data_is_replayed_once_on_resume() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        let first = pipeline.on_filter_result(0, data(b"ab", false), Verdict::Stop(StopKind::Buffer), None);
        assert!(first.release.is_empty());
        pipeline.on_filter_result(0, data(b"cd", true), Verdict::Stop(StopKind::Buffer), None);
        assert_eq!(pipeline.buffered_bytes(), 4);

        pipeline.request_resume(0).unwrap();
        let outcome = pipeline.resume(0);
        assert_eq!(outcome.release, vec![data(b"abcd", true)]);
        assert_eq!(pipeline.buffered_bytes(), 0);

        // Nothing left to replay.
        assert!(pipeline.resume(0).release.is_empty());
    }

    #[test]
    fn continue_at_stopped_stage_releases_held_frames_first() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Stop(StopKind::Iteration), None);
        let outcome = pipeline.on_filter_result(0, data(b"x", true), Verdict::Continue, None);
        assert_eq!(outcome.release, vec![headers(false), data(b"x", true)]);
        assert!(!pipeline.is_halted(0));
    }

    #[test]
    fn resume_requires_stopped_stage() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        assert!(matches!(pipeline.request_resume(0), Err(StreamError::NotHalted { index: 0 })));

        pipeline.on_filter_result(0, headers(false), Verdict::Stop(StopKind::Iteration), None);
        pipeline.request_resume(0).unwrap();
        assert!(matches!(pipeline.request_resume(0), Err(StreamError::NotHalted { .. })));
    }

    #[test]
    fn buffer_limit_overflow() {
        let mut pipeline = Pipeline::new(1, 3);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        let outcome = pipeline.on_filter_result(0, data(b"abcd", false), Verdict::Stop(StopKind::Buffer), None);
        assert!(outcome.overflow);
    }

    #[test]
    fn watermark_raised_once_and_lowered_on_resume() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        let first = pipeline.on_filter_result(0, data(b"a", false), Verdict::Stop(StopKind::Watermark), None);
        assert_eq!(first.watermark, Some(WatermarkEvent::AboveHigh));
        let second = pipeline.on_filter_result(0, data(b"b", false), Verdict::Stop(StopKind::Watermark), None);
        assert_eq!(second.watermark, None);

        pipeline.request_resume(0).unwrap();
        let outcome = pipeline.resume(0);
        assert_eq!(outcome.watermark, Some(WatermarkEvent::BelowLow));
        assert_eq!(outcome.release, vec![data(b"ab", false)]);
    }

    #[test]
    fn no_buffer_drops_bytes_but_keeps_end_of_stream() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        pipeline.on_filter_result(0, data(b"gone", true), Verdict::Stop(StopKind::NoBuffer), None);
        assert_eq!(pipeline.buffered_bytes(), 0);

        // The filter re-injects its own rewrite before resuming.
        assert_eq!(pipeline.add_data(0, BytesMut::from(&b"new"[..]), false).unwrap(), None);
        pipeline.request_resume(0).unwrap();
        assert_eq!(pipeline.resume(0).release, vec![data(b"new", true)]);
    }

    #[test]
    fn streaming_add_during_no_buffer_is_forwarded_when_nothing_held() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        let outcome = pipeline.on_filter_result(
            0,
            data(b"chunk", false),
            Verdict::Stop(StopKind::NoBuffer),
            added(b"rewritten", true),
        );
        assert_eq!(outcome.release, vec![data(b"rewritten", false)]);
        assert!(pipeline.is_halted(0));
    }

    #[test]
    fn in_invocation_add_joins_frame_in_flight() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        let outcome = pipeline.on_filter_result(0, headers(true), Verdict::Continue, added(b"body", false));
        assert_eq!(outcome.release, vec![headers(false), data(b"body", true)]);

        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        let outcome = pipeline.on_filter_result(
            0,
            Frame::Trailers(HeaderMap::new()),
            Verdict::Continue,
            added(b"tail", false),
        );
        assert_eq!(outcome.release, vec![data(b"tail", false), Frame::Trailers(HeaderMap::new())]);
    }

    #[test]
    fn out_of_band_add_after_end_is_rejected() {
        let mut pipeline = Pipeline::new(1, 0);
        assert!(matches!(
            pipeline.add_data(0, BytesMut::from(&b"x"[..]), true),
            Err(StreamError::FrameOrder { .. })
        ));

        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(true), Verdict::Continue, None);
        assert!(matches!(
            pipeline.add_data(0, BytesMut::from(&b"x"[..]), true),
            Err(StreamError::EndStreamViolation { .. })
        ));
    }

    #[test]
    fn out_of_band_add_joins_held_headers_and_moves_end_flag() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(true), Verdict::Stop(StopKind::Iteration), None);
        assert_eq!(pipeline.add_data(0, BytesMut::from(&b"x"[..]), false).unwrap(), None);

        pipeline.request_resume(0).unwrap();
        assert_eq!(pipeline.resume(0).release, vec![headers(false), data(b"x", true)]);
    }

    #[test]
    fn streaming_out_of_band_add_on_flowing_stage_is_forwarded() {
        let mut pipeline = Pipeline::new(1, 0);
        pipeline.mark_invoked(0);
        pipeline.on_filter_result(0, headers(false), Verdict::Continue, None);
        assert_eq!(
            pipeline.add_data(0, BytesMut::from(&b"x"[..]), true).unwrap(),
            Some(data(b"x", false))
        );
    }
}
