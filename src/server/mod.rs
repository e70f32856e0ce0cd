//! Listener-side wiring.
//!
//! # Data Flow
//! ```text
//! Listener::start
//!     → StreamServer::on_accept
//!     → TcpConnection (transport) + CodecConnection::server (framing)
//!     → FilteringServerListener (one FilterManager per stream)
//!     → application (ServerStreamConnectionEventListener)
//!
//! Shutdown:
//!     StreamServer::go_away_all → every live connection sends GoAway
//!     → ConnectionTracker::wait_for_drain
//! ```
//!
//! # Design Decisions
//! - One task per connection; it owns the connection slot and tracker guard
//! - The application is shared by every connection and creates a decoder per stream
//! - Connections accepted after shutdown began are told to go away at once

pub mod echo;

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::MeshConfig;
use crate::connection::{
    CodecConnection, ConnectionSettings, ServerStreamConnectionEventListener, StreamConnection,
};
use crate::filter::{ChainSettings, FilteringServerListener, StreamFilterChainFactory};
use crate::net::{AcceptedConnection, Connection, ConnectionId, ConnectionTracker, ListenerEventListener, TcpConnection};
use crate::protocol::FramedCodec;
use crate::stream::Protocol;

pub use echo::EchoApplication;

/// Serves framed stream connections through the configured filter chain.
pub struct StreamServer {
    application: Arc<dyn ServerStreamConnectionEventListener>,
    factory: Arc<dyn StreamFilterChainFactory>,
    chain_settings: ChainSettings,
    connection_settings: ConnectionSettings,
    per_conn_buffer_limit: usize,
    tracker: ConnectionTracker,
    connections: DashMap<ConnectionId, Arc<dyn StreamConnection>>,
    going_away: AtomicBool,
    self_ref: Weak<StreamServer>,
}

impl StreamServer {
    pub fn new(
        application: Arc<dyn ServerStreamConnectionEventListener>,
        factory: Arc<dyn StreamFilterChainFactory>,
        config: &MeshConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            application,
            factory,
            chain_settings: ChainSettings::from(&config.stream),
            connection_settings: ConnectionSettings {
                max_concurrent_streams: config.stream.max_concurrent_streams,
                ..ConnectionSettings::default()
            },
            per_conn_buffer_limit: config.listener.per_conn_buffer_limit_bytes,
            tracker: ConnectionTracker::new(),
            connections: DashMap::new(),
            going_away: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Number of connections still open.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Ask every live connection to stop taking new streams.
    pub fn go_away_all(&self) {
        self.going_away.store(true, Ordering::SeqCst);
        tracing::info!(connections = self.connections.len(), "Sending GoAway to all connections");
        let connections: Vec<_> = self.connections.iter().map(|entry| Arc::clone(entry.value())).collect();
        for connection in connections {
            connection.go_away();
        }
    }

    /// Wait for open connections to finish. Returns whether they all did.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.wait_for_drain(timeout).await
    }
}

impl ListenerEventListener for StreamServer {
    fn on_accept(&self, accepted: AcceptedConnection, hand_off_restored_destination_connections: bool) {
        let AcceptedConnection {
            stream,
            peer_addr,
            permit,
        } = accepted;

        let transport = TcpConnection::new(Some(peer_addr), self.per_conn_buffer_limit);
        let id = transport.id();
        let filtering = FilteringServerListener::new(
            Arc::clone(&self.application),
            Arc::clone(&self.factory),
            Protocol::FRAMED,
        )
        .with_settings(self.chain_settings.clone())
        .with_connection(transport.clone());
        let codec_connection = CodecConnection::server(
            transport.clone(),
            FramedCodec::new(),
            Arc::new(filtering),
            self.connection_settings.clone(),
        );
        let handler: Arc<dyn StreamConnection> = codec_connection;

        tracing::debug!(
            connection_id = %id,
            peer_addr = %peer_addr,
            hand_off_restored_destination_connections,
            "Serving connection"
        );

        self.connections.insert(id, Arc::clone(&handler));
        if self.going_away.load(Ordering::SeqCst) {
            handler.go_away();
        }

        let guard = self.tracker.track();
        let server = self.self_ref.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            let event = transport.run(stream, handler).await;
            tracing::debug!(connection_id = %id, event = ?event, "Connection finished");
            if let Some(server) = server.upgrade() {
                server.connections.remove(&id);
            }
        });
    }

    fn on_close(&self) {
        tracing::info!(connections = self.connections.len(), "Listener closed");
    }
}
