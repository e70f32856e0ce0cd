//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Signal::Shutdown
//!     SIGHUP → Signal::Reload
//!
//! Shutdown (shutdown.rs):
//!     Shutdown::trigger → listener stops accepting
//!     → StreamServer::go_away_all → drain with timeout → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, GoAway, drain, close
//! - Shutdown has timeout: forced exit after deadline
//! - A second shutdown signal during drain forces exit

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, Signal};
