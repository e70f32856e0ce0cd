//! Stream layer for a service-mesh data plane.
//!
//! Multiplexed streams over a framed transport, with decoder and encoder
//! filter chains between the stream connection and the application.

// Core subsystems
pub mod connection;
pub mod filter;
pub mod net;
pub mod protocol;
pub mod stream;

// Wiring
pub mod server;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::MeshConfig;
pub use filter::{ConfiguredChainFactory, FilterManager};
pub use lifecycle::Shutdown;
pub use server::{EchoApplication, StreamServer};
