//! Transport connections and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Drive a TCP socket: read/dispatch loop and watermarked write buffer
//! - Report close events so the stream connection can reset its streams
//! - Count live connections for graceful drain

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

use crate::connection::StreamConnection;
use crate::observability::metrics;
use crate::stream::{WatermarkEvent, Watermarks};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 16 * 1024;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer closed its side.
    RemoteClose,
    /// This side closed the connection.
    LocalClose,
    /// A read, write or protocol error tore the connection down.
    Failed,
}

impl ConnectionEvent {
    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectionEvent::Failed)
    }
}

/// Error type for connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional byte connection with a watermarked write buffer.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Queue bytes for writing. Never blocks; pressure is reported through
    /// watermark edges.
    fn write(&self, data: Bytes) -> Result<(), ConnectionError>;

    /// Pause or resume reading from the peer. Must not call back into the caller.
    fn read_disable(&self, disable: bool);

    fn is_read_disabled(&self) -> bool;

    /// Flush what is queued, then close.
    fn close(&self);
}

struct WriteState {
    queue: VecDeque<Bytes>,
    /// Queued plus in-flight bytes.
    buffered: usize,
    watermarks: Watermarks,
    closed: bool,
}

/// A TCP connection feeding a `StreamConnection`.
pub struct TcpConnection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    write_state: Mutex<WriteState>,
    write_ready: Notify,
    read_enabled: watch::Sender<bool>,
    closing: watch::Sender<bool>,
    failed: AtomicBool,
    handler: OnceLock<Arc<dyn StreamConnection>>,
}

impl TcpConnection {
    /// Create the connection state. `buffer_limit` is the write high
    /// watermark; the low watermark is half of it.
    pub fn new(remote_addr: Option<SocketAddr>, buffer_limit: usize) -> Arc<Self> {
        let (read_enabled, _) = watch::channel(true);
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            id: ConnectionId::new(),
            remote_addr,
            write_state: Mutex::new(WriteState {
                queue: VecDeque::new(),
                buffered: 0,
                watermarks: Watermarks::new(buffer_limit),
                closed: false,
            }),
            write_ready: Notify::new(),
            read_enabled,
            closing,
            failed: AtomicBool::new(false),
            handler: OnceLock::new(),
        })
    }

    /// Bytes queued or in flight.
    pub fn buffered_bytes(&self) -> usize {
        self.write_state.lock().buffered
    }

    /// Run the connection until it closes, feeding inbound bytes to
    /// `handler` and reporting write watermark edges to it.
    pub async fn run(self: Arc<Self>, stream: TcpStream, handler: Arc<dyn StreamConnection>) -> ConnectionEvent {
        if self.handler.set(Arc::clone(&handler)).is_err() {
            tracing::error!(connection_id = %self.id, "Connection already running");
            return ConnectionEvent::Failed;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(connection_id = %self.id, error = %e, "Failed to set TCP_NODELAY");
        }

        metrics::record_connection_opened();
        let (mut reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(Arc::clone(&self).write_loop(writer));

        let mut read_enabled = self.read_enabled.subscribe();
        let mut closing = self.closing.subscribe();
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);

        let event = loop {
            if *closing.borrow_and_update() {
                break if self.failed.load(Ordering::SeqCst) {
                    ConnectionEvent::Failed
                } else {
                    ConnectionEvent::LocalClose
                };
            }

            if !*read_enabled.borrow_and_update() {
                tokio::select! {
                    _ = read_enabled.changed() => {}
                    _ = closing.changed() => {}
                }
                continue;
            }

            buffer.reserve(READ_CHUNK);
            tokio::select! {
                result = reader.read_buf(&mut buffer) => match result {
                    Ok(0) => break ConnectionEvent::RemoteClose,
                    Ok(_) => {
                        if let Err(e) = handler.dispatch(&mut buffer) {
                            tracing::warn!(connection_id = %self.id, error = %e, "Closing connection after codec error");
                            break ConnectionEvent::Failed;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(connection_id = %self.id, error = %e, "Read failed");
                        break ConnectionEvent::Failed;
                    }
                },
                _ = read_enabled.changed() => {}
                _ = closing.changed() => {}
            }
        };

        tracing::debug!(connection_id = %self.id, event = ?event, "Connection closing");
        handler.on_connection_close(event);

        self.closing.send_replace(true);
        self.write_ready.notify_one();
        if event != ConnectionEvent::LocalClose {
            self.write_state.lock().closed = true;
        }
        if let Err(e) = writer_task.await {
            tracing::debug!(connection_id = %self.id, error = %e, "Writer task ended abnormally");
        }
        metrics::record_connection_closed();
        event
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        loop {
            let batch: Vec<Bytes> = {
                let mut state = self.write_state.lock();
                if state.queue.is_empty() && (state.closed || *self.closing.borrow()) {
                    break;
                }
                state.queue.drain(..).collect()
            };
            if batch.is_empty() {
                self.write_ready.notified().await;
                continue;
            }

            let mut written = 0;
            for chunk in &batch {
                if let Err(e) = writer.write_all(chunk).await {
                    tracing::debug!(connection_id = %self.id, error = %e, "Write failed");
                    self.fail();
                    return;
                }
                written += chunk.len();
            }

            let event = {
                let mut state = self.write_state.lock();
                state.buffered = state.buffered.saturating_sub(written);
                let buffered = state.buffered;
                state.watermarks.update(buffered)
            };
            if let Some(event) = event {
                self.on_watermark(event);
            }
        }

        if let Err(e) = writer.shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %e, "Shutdown after close failed");
        }
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        {
            let mut state = self.write_state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.closing.send_replace(true);
    }

    fn on_watermark(&self, event: WatermarkEvent) {
        let Some(handler) = self.handler.get() else {
            return;
        };
        match event {
            WatermarkEvent::AboveHigh => {
                tracing::debug!(connection_id = %self.id, "Write buffer above high watermark");
                handler.on_underlying_connection_above_write_buffer_high_watermark();
            }
            WatermarkEvent::BelowLow => {
                tracing::debug!(connection_id = %self.id, "Write buffer below low watermark");
                handler.on_underlying_connection_below_write_buffer_low_watermark();
            }
        }
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn write(&self, data: Bytes) -> Result<(), ConnectionError> {
        let event = {
            let mut state = self.write_state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            state.buffered += data.len();
            state.queue.push_back(data);
            let buffered = state.buffered;
            state.watermarks.update(buffered)
        };
        self.write_ready.notify_one();
        if let Some(event) = event {
            self.on_watermark(event);
        }
        Ok(())
    }

    fn read_disable(&self, disable: bool) {
        self.read_enabled.send_replace(!disable);
    }

    fn is_read_disabled(&self) -> bool {
        !*self.read_enabled.borrow()
    }

    fn close(&self) {
        self.closing.send_replace(true);
        self.write_ready.notify_one();
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or `timeout` passes.
    /// Returns whether every connection closed in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
