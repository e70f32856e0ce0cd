//! Stream filter chains.
//!
//! # Data Flow
//! ```text
//! Decode: StreamConnection → FilterManager (StreamDecoder)
//!             → decoder filter 0 → … → decoder filter N → application decoder
//!
//! Encode: application → FilterManager (StreamEncoder)
//!             → encoder filter 0 → … → encoder filter N → wire encoder
//!
//! Local reply: decoder filter → DecoderFilterCallbacks::encode_* → encoder chain
//! ```
//!
//! # Design Decisions
//! - Filters steer iteration only through status values; the stopped stage is
//!   explicit state so a resume can come from any task at any time
//! - One driver per stream runs all chain work; everyone else enqueues
//! - Callbacks are borrowed per invocation; retained handles are weak
//! - Both chains run in the order filters were added

pub mod builtin;
pub mod callbacks;
pub(crate) mod chain;
pub mod layer;
pub mod manager;
pub mod route;
pub mod status;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use builtin::ConfiguredChainFactory;
pub use callbacks::{
    DecoderFilterCallbacks, DecoderFilterHandle, EncoderFilterCallbacks, EncoderFilterHandle, StreamFilterCallbacks,
};
pub use layer::{FilteringClientConnection, FilteringServerListener};
pub use manager::{ChainSettings, FilterManager};
pub use route::{PathPrefixResolver, RequestInfo, Route, RouteResolver, StaticRoute};
pub use status::{FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus};
pub use traits::{
    ChainContext, FilterChainFactoryCallbacks, StreamDecoderFilter, StreamEncoderFilter, StreamFilterBase,
    StreamFilterChainFactory,
};
