//! Token bucket rate limiting with a local 429 reply.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::filter::callbacks::{DecoderFilterCallbacks, StreamFilterCallbacks};
use crate::filter::status::FilterHeadersStatus;
use crate::filter::traits::{StreamDecoderFilter, StreamFilterBase};
use crate::observability::metrics;
use crate::stream::HeaderMap;

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// A token bucket shared by every stream of one factory.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
            capacity,
            refill_rate: f64::from(requests_per_second),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();

        // Refill tokens
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_update = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rejects streams when the bucket is empty.
pub struct RateLimitFilter {
    bucket: Arc<TokenBucket>,
}

impl RateLimitFilter {
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket }
    }
}

impl StreamFilterBase for RateLimitFilter {}

impl StreamDecoderFilter for RateLimitFilter {
    fn decode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
        callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        if self.bucket.try_acquire() {
            return FilterHeadersStatus::Continue;
        }

        tracing::warn!(stream_id = %callbacks.stream_id(), "Rate limit exceeded");
        metrics::record_local_reply("rate_limited");

        let mut response = HeaderMap::new();
        response.insert(":status".to_string(), "429".to_string());
        if let Err(e) = callbacks.encode_headers(response, true) {
            tracing::warn!(stream_id = %callbacks.stream_id(), error = %e, "Failed to send rate limit reply");
            callbacks.reset_stream();
        }
        FilterHeadersStatus::StopIteration
    }
}
