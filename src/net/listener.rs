//! TCP listener with backpressure and a single acceptance callback.
//!
//! # Responsibilities
//! - Bind to the configured address, or adopt an inherited socket
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors
//! - Hand every accepted connection to a `ListenerEventListener`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configured address does not parse.
    #[error("Invalid bind address {0:?}")]
    InvalidAddress(String),

    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),

    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
}

/// A connection handed over by the listener.
#[derive(Debug)]
pub struct AcceptedConnection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    /// Connection slot; hold it for the connection's lifetime.
    pub permit: ConnectionPermit,
}

/// Owner of the connections a listener accepts.
pub trait ListenerEventListener: Send + Sync {
    /// Called once per accepted connection, from the accept loop. Long
    /// running work must be spawned.
    fn on_accept(&self, connection: AcceptedConnection, hand_off_restored_destination_connections: bool);

    /// Called once when the listener stops accepting.
    fn on_close(&self);
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    name: String,
    /// The underlying TCP listener; `None` when not bound to a port.
    inner: Option<TcpListener>,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
    listener_tag: u64,
    per_conn_buffer_limit_bytes: usize,
    hand_off_restored_destination_connections: bool,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        if !config.bind_to_port {
            tracing::info!(listener = %config.name, "Listener configured without binding to a port");
            return Ok(Self::build(config, None));
        }

        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(config.bind_address.clone()))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Self::adopt(listener, config)
    }

    /// Adopt an already bound socket, e.g. one inherited across a restart.
    pub fn from_std(listener: std::net::TcpListener, config: &ListenerConfig) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true).map_err(ListenerError::Bind)?;
        let listener = TcpListener::from_std(listener).map_err(ListenerError::Bind)?;
        Self::adopt(listener, config)
    }

    fn adopt(listener: TcpListener, config: &ListenerConfig) -> Result<Self, ListenerError> {
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            listener = %config.name,
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self::build(config, Some(listener)))
    }

    fn build(config: &ListenerConfig, inner: Option<TcpListener>) -> Self {
        Self {
            name: config.name.clone(),
            inner,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            listener_tag: config.listener_tag,
            per_conn_buffer_limit_bytes: config.per_conn_buffer_limit_bytes,
            hand_off_restored_destination_connections: config.hand_off_restored_destination_connections,
        }
    }

    /// Accept connections until `shutdown` fires, handing each to `callbacks`.
    pub async fn start(self, callbacks: Arc<dyn ListenerEventListener>, mut shutdown: broadcast::Receiver<()>) {
        let Some(inner) = &self.inner else {
            tracing::info!(listener = %self.name, "Listener not bound to a port, not accepting");
            return;
        };

        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let accepted = tokio::select! {
                accepted = inner.accept() => accepted,
                _ = shutdown.recv() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!(
                        listener = %self.name,
                        peer_addr = %peer_addr,
                        available_permits = self.connection_limit.available_permits(),
                        "Connection accepted"
                    );
                    callbacks.on_accept(
                        AcceptedConnection {
                            stream,
                            peer_addr,
                            permit: ConnectionPermit { _permit: permit },
                        },
                        self.hand_off_restored_destination_connections,
                    );
                }
                Err(e) => {
                    tracing::warn!(listener = %self.name, error = %ListenerError::Accept(e), "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        tracing::info!(listener = %self.name, "Listener stopped accepting");
        callbacks.on_close();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn listener_tag(&self) -> u64 {
        self.listener_tag
    }

    pub fn per_conn_buffer_limit_bytes(&self) -> usize {
        self.per_conn_buffer_limit_bytes
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        peers: Mutex<Vec<SocketAddr>>,
        closed: Mutex<bool>,
    }

    impl ListenerEventListener for Recording {
        fn on_accept(&self, connection: AcceptedConnection, _hand_off: bool) {
            self.peers.lock().push(connection.peer_addr);
        }

        fn on_close(&self) {
            *self.closed.lock() = true;
        }
    }

    fn local_config() -> ListenerConfig {
        ListenerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_connections: 4,
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn accepts_until_shutdown() {
        let listener = Listener::bind(&local_config()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recording = Arc::new(Recording::default());
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(listener.start(recording.clone(), rx));

        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..50 {
            if !recording.peers.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recording.peers.lock().len(), 1);

        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(*recording.closed.lock());
    }

    #[tokio::test]
    async fn unbound_listener_returns_immediately() {
        let config = ListenerConfig {
            bind_to_port: false,
            ..local_config()
        };
        let listener = Listener::bind(&config).await.unwrap();
        assert!(listener.local_addr().is_none());

        let (_tx, rx) = broadcast::channel(1);
        listener.start(Arc::new(Recording::default()), rx).await;
    }

    #[tokio::test]
    async fn adopts_inherited_socket() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let expected = std_listener.local_addr().unwrap();
        let listener = Listener::from_std(std_listener, &local_config()).unwrap();
        assert_eq!(listener.local_addr(), Some(expected));
        assert_eq!(listener.per_conn_buffer_limit_bytes(), 1024 * 1024);
    }
}
