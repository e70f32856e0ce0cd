//! High/low watermark tracking with hysteresis.
//!
//! # States
//! ```text
//! Below --(len > high)--> Above --(len <= low)--> Below
//! ```
//!
//! Only the two transitions are observable. Staying above `high` or
//! bouncing between `low` and `high` produces no events.

/// Edge produced by a watermark transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEvent {
    AboveHigh,
    BelowLow,
}

/// Byte-limit pair plus the "above" flag for one bufferable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    high: usize,
    low: usize,
    above: bool,
}

impl Watermarks {
    /// Create watermarks with `low = high / 2`. A `high` of zero disables tracking.
    pub fn new(high: usize) -> Self {
        Self::with_limits(high, high / 2)
    }

    pub fn with_limits(high: usize, low: usize) -> Self {
        Self {
            high,
            low: low.min(high),
            above: false,
        }
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn is_above(&self) -> bool {
        self.above
    }

    /// Feed the current occupancy, returning the edge crossed, if any.
    pub fn update(&mut self, len: usize) -> Option<WatermarkEvent> {
        if self.high == 0 {
            return None;
        }
        if !self.above && len > self.high {
            self.above = true;
            Some(WatermarkEvent::AboveHigh)
        } else if self.above && len <= self.low {
            self.above = false;
            Some(WatermarkEvent::BelowLow)
        } else {
            None
        }
    }

    /// Change the limits and re-evaluate against the current occupancy.
    pub fn set_limits(&mut self, high: usize, len: usize) -> Option<WatermarkEvent> {
        self.high = high;
        self.low = high / 2;
        if high == 0 {
            // Disabled tracking releases any pressure that was being applied.
            return if std::mem::take(&mut self.above) {
                Some(WatermarkEvent::BelowLow)
            } else {
                None
            };
        }
        self.update(len)
    }
}

/// Receives watermark edges for a downstream the holder is feeding.
///
/// Registered through `DecoderFilterCallbacks::add_downstream_watermark_callbacks`,
/// typically by a proxy filter that pauses its upstream stream in response.
pub trait DownstreamWatermarkEventListener: Send + Sync {
    fn on_above_write_buffer_high_watermark(&self);

    fn on_below_write_buffer_low_watermark(&self);
}
