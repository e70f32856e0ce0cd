//! Filters selectable from configuration.
//!
//! # Design Decisions
//! - The configured chain is swapped atomically on reload; streams already
//!   running keep the chain they were built with
//! - Rate limit buckets are shared by every stream built from one chain

pub mod buffer;
pub mod rate_limit;
pub mod request_id;

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::config::FilterConfig;
use crate::filter::traits::{ChainContext, FilterChainFactoryCallbacks, StreamFilterChainFactory};

pub use buffer::BufferFilter;
pub use rate_limit::{RateLimitFilter, TokenBucket};
pub use request_id::{request_id_filters, RequestIdDecoder, RequestIdEncoder, REQUEST_ID_HEADER};

/// Names accepted in `[[filters]]`.
pub const KNOWN_FILTERS: &[&str] = &["request_id", "rate_limit", "buffer"];

enum BuiltinFilter {
    RequestId,
    RateLimit(Arc<TokenBucket>),
    Buffer { max_request_bytes: usize },
}

fn build(configs: &[FilterConfig]) -> Vec<BuiltinFilter> {
    configs
        .iter()
        .filter_map(|config| match config.name.as_str() {
            "request_id" => Some(BuiltinFilter::RequestId),
            "rate_limit" => Some(BuiltinFilter::RateLimit(Arc::new(TokenBucket::new(
                config.requests_per_second,
                config.burst,
            )))),
            "buffer" => Some(BuiltinFilter::Buffer {
                max_request_bytes: config.max_request_bytes,
            }),
            other => {
                tracing::warn!(filter = %other, "Skipping unknown filter");
                None
            }
        })
        .collect()
}

/// Builds stream filter chains from the `[[filters]]` configuration.
pub struct ConfiguredChainFactory {
    filters: ArcSwap<Vec<BuiltinFilter>>,
}

impl ConfiguredChainFactory {
    pub fn new(configs: &[FilterConfig]) -> Self {
        Self {
            filters: ArcSwap::from_pointee(build(configs)),
        }
    }

    /// Replace the chain used for new streams.
    pub fn reload(&self, configs: &[FilterConfig]) {
        let filters = build(configs);
        tracing::info!(filters = filters.len(), "Filter chain reloaded");
        self.filters.store(Arc::new(filters));
    }

    /// Number of configured filters.
    pub fn len(&self) -> usize {
        self.filters.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamFilterChainFactory for ConfiguredChainFactory {
    fn create_filter_chain(&self, _context: &ChainContext, callbacks: &mut dyn FilterChainFactoryCallbacks) {
        for filter in self.filters.load().iter() {
            match filter {
                BuiltinFilter::RequestId => {
                    let (decoder, encoder) = request_id_filters();
                    callbacks.add_stream_decoder_filter(Box::new(decoder));
                    callbacks.add_stream_encoder_filter(Box::new(encoder));
                }
                BuiltinFilter::RateLimit(bucket) => {
                    callbacks.add_stream_decoder_filter(Box::new(RateLimitFilter::new(Arc::clone(bucket))));
                }
                BuiltinFilter::Buffer { max_request_bytes } => {
                    callbacks.add_stream_decoder_filter(Box::new(BufferFilter::new(*max_request_bytes)));
                }
            }
        }
    }
}
