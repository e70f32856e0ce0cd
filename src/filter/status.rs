//! Filter verdicts. The only way a filter steers chain iteration.

/// Verdict of a filter on a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// Pass the headers to the next filter now.
    Continue,
    /// Hold the headers here until the filter resumes.
    StopIteration,
}

/// Verdict of a filter on a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    /// Pass the data (and anything held before it) on now.
    Continue,
    /// Hold the data for replay on resume.
    StopIterationAndBuffer,
    /// Hold the data and signal a high watermark towards the producer.
    StopIterationAndWatermark,
    /// Stop without keeping the data; the filter owns it from here.
    StopIterationNoBuffer,
}

/// Verdict of a filter on trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}

impl FilterHeadersStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterHeadersStatus::Continue => "Continue",
            FilterHeadersStatus::StopIteration => "StopIteration",
        }
    }
}

impl FilterDataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterDataStatus::Continue => "Continue",
            FilterDataStatus::StopIterationAndBuffer => "StopIterationAndBuffer",
            FilterDataStatus::StopIterationAndWatermark => "StopIterationAndWatermark",
            FilterDataStatus::StopIterationNoBuffer => "StopIterationNoBuffer",
        }
    }
}

impl FilterTrailersStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterTrailersStatus::Continue => "Continue",
            FilterTrailersStatus::StopIteration => "StopIteration",
        }
    }
}
