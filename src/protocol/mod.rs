//! Wire protocols.
//!
//! # Data Flow
//! ```text
//! socket bytes → FramedCodec::decode → WireFrame → CodecConnection
//! CodecConnection → WireFrame → FramedCodec::encode → write buffer
//! ```
//!
//! # Design Decisions
//! - Codecs only translate bytes; stream state lives in `CodecConnection`
//! - Partial frames are left in the caller's buffer untouched

pub mod framed;

pub use framed::FramedCodec;
