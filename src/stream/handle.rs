//! The `Stream` handle and its event listeners.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::observability::metrics;
use crate::stream::types::{StreamId, StreamResetReason};

/// Observer of a stream's lifecycle and write-side pressure.
pub trait StreamEventListener: Send + Sync {
    /// Called once when the stream is reset.
    fn on_reset_stream(&self, reason: StreamResetReason);

    /// Called when the stream, or the connection it writes to, goes over its high watermark.
    fn on_above_write_buffer_high_watermark(&self);

    /// Called when the stream, or the connection it writes to, drops back under its low watermark.
    fn on_below_write_buffer_low_watermark(&self);
}

/// Receives read-disable transitions. Installed by the owning stream connection.
pub trait ReadControl: Send + Sync {
    fn on_read_disable(&self, stream_id: StreamId, disable: bool);
}

struct State {
    listeners: Vec<Arc<dyn StreamEventListener>>,
    reset: Option<StreamResetReason>,
    read_disabled: bool,
    /// Outstanding high watermark signals from the connection.
    above_high_watermark: u32,
}

struct Inner {
    id: StreamId,
    state: Mutex<State>,
    read_control: Option<Arc<dyn ReadControl>>,
}

/// One logical request/response exchange on a connection.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<Inner>,
}

impl Stream {
    /// Create a detached stream with no read control.
    pub fn new(id: StreamId) -> Self {
        Self::build(id, None)
    }

    /// Create a stream whose read-disable transitions are reported to `read_control`.
    pub fn with_read_control(id: StreamId, read_control: Arc<dyn ReadControl>) -> Self {
        Self::build(id, Some(read_control))
    }

    fn build(id: StreamId, read_control: Option<Arc<dyn ReadControl>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    listeners: Vec::new(),
                    reset: None,
                    read_disabled: false,
                    above_high_watermark: 0,
                }),
                read_control,
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// Register a listener. A listener added while the stream is above its
    /// high watermark is told so immediately.
    pub fn add_event_listener(&self, listener: Arc<dyn StreamEventListener>) {
        let above = {
            let mut state = self.inner.state.lock();
            state.listeners.push(Arc::clone(&listener));
            state.above_high_watermark
        };
        for _ in 0..above {
            listener.on_above_write_buffer_high_watermark();
        }
    }

    /// Deregister a listener. Removing an unknown listener is a no-op.
    pub fn remove_event_listener(&self, listener: &Arc<dyn StreamEventListener>) {
        let mut state = self.inner.state.lock();
        state.listeners.retain(|l| !same_listener(l, listener));
    }

    /// Reset the stream. Listeners are notified synchronously, exactly once;
    /// later calls are no-ops. Returns whether this call performed the reset.
    pub fn reset_stream(&self, reason: StreamResetReason) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.reset.is_some() {
                return false;
            }
            state.reset = Some(reason);
            state.listeners.clone()
        };

        tracing::debug!(stream_id = %self.inner.id, reason = %reason, "Stream reset");
        metrics::record_stream_reset(reason);

        for listener in listeners {
            listener.on_reset_stream(reason);
        }
        true
    }

    pub fn is_reset(&self) -> bool {
        self.inner.state.lock().reset.is_some()
    }

    pub fn reset_reason(&self) -> Option<StreamResetReason> {
        self.inner.state.lock().reset
    }

    /// Pause or resume inbound delivery without destroying the stream.
    ///
    /// Only transitions are forwarded to the read control; frames that
    /// arrive while disabled are held by the owning connection.
    pub fn read_disable(&self, disable: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.read_disabled == disable || state.reset.is_some() {
                return;
            }
            state.read_disabled = disable;
        }
        tracing::trace!(stream_id = %self.inner.id, disable, "Stream read state changed");
        if let Some(control) = &self.inner.read_control {
            control.on_read_disable(self.inner.id, disable);
        }
    }

    pub fn is_read_disabled(&self) -> bool {
        self.inner.state.lock().read_disabled
    }

    /// Fan a high watermark edge out to every listener.
    pub fn run_high_watermark_callbacks(&self) {
        let listeners = {
            let mut state = self.inner.state.lock();
            state.above_high_watermark += 1;
            state.listeners.clone()
        };
        for listener in listeners {
            listener.on_above_write_buffer_high_watermark();
        }
    }

    /// Fan a low watermark edge out to every listener.
    pub fn run_low_watermark_callbacks(&self) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.above_high_watermark == 0 {
                return;
            }
            state.above_high_watermark -= 1;
            state.listeners.clone()
        };
        for listener in listeners {
            listener.on_below_write_buffer_low_watermark();
        }
    }

    pub fn is_above_write_buffer_high_watermark(&self) -> bool {
        self.inner.state.lock().above_high_watermark > 0
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// True if both handles refer to the same stream.
    pub fn ptr_eq(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("reset", &state.reset)
            .field("read_disabled", &state.read_disabled)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

fn same_listener(a: &Arc<dyn StreamEventListener>, b: &Arc<dyn StreamEventListener>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
