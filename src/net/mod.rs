//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → ListenerEventListener::on_accept
//!     → connection.rs (TcpConnection: read/dispatch loop, write buffer)
//!     → StreamConnection::dispatch
//!
//! Write path:
//!     StreamConnection → Connection::write → write buffer (watermarked)
//!         → writer task → socket
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Writes never block the caller; the write buffer reports pressure as
//!   high/low watermark edges instead
//! - Read-disable pauses the socket read loop without losing buffered bytes

pub mod connection;
pub mod listener;

pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionGuard, ConnectionId, ConnectionTracker, TcpConnection,
};
pub use listener::{AcceptedConnection, ConnectionPermit, Listener, ListenerError, ListenerEventListener};
