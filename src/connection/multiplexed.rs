//! Protocol-agnostic multiplexed stream connection.
//!
//! `CodecConnection` owns the stream table of one transport connection and
//! drives any `Codec`. The same type serves both roles: a server accepts
//! inbound streams through its `ServerStreamConnectionEventListener`, a
//! client originates them with `new_stream`.
//!
//! Lock order: encoder frame order, then outbound buffer, then codec. None
//! of these is held while user code, the transport or a stream listener runs.

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::connection::codec::{Codec, CodecError, WireFrame};
use crate::connection::inbound::InboundGate;
use crate::connection::{
    ClientStreamConnection, ServerStreamConnection, ServerStreamConnectionEventListener,
    StreamConnection, StreamConnectionEventListener,
};
use crate::net::connection::{Connection, ConnectionEvent};
use crate::observability::metrics;
use crate::stream::{
    Frame, FrameKind, FrameOrder, HeaderMap, Protocol, ReadControl, Stream, StreamDecoder,
    StreamEncoder, StreamError, StreamEventListener, StreamId, StreamResetReason,
};

/// Which side of the connection originates streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Streams beyond this are refused with `Overflow`.
    pub max_concurrent_streams: usize,
    /// Largest stream id the connection may originate.
    pub max_stream_id: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 1024,
            max_stream_id: u64::from(u32::MAX),
        }
    }
}

struct StreamEntry {
    stream: Stream,
    gate: InboundGate,
    inbound: Mutex<FrameOrder>,
    local_ended: AtomicBool,
    read_disabled: AtomicBool,
    /// The peer reset this stream; no reset frame goes back.
    peer_reset: AtomicBool,
}

impl StreamEntry {
    fn new(stream: Stream) -> Self {
        let id = stream.id();
        Self {
            stream,
            gate: InboundGate::new(id),
            inbound: Mutex::new(FrameOrder::new()),
            local_ended: AtomicBool::new(false),
            read_disabled: AtomicBool::new(false),
            peer_reset: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
struct Outbound {
    buf: BytesMut,
    flushing: bool,
}

/// Connection write-buffer pressure as seen by the streams.
///
/// `above` is the latest transport edge, `applied` what the streams have
/// been told. A single runner moves `applied` towards `above`.
#[derive(Default)]
struct Pressure {
    above: bool,
    applied: bool,
    running: bool,
}

struct Shared<C: Codec> {
    role: Role,
    protocol: Protocol,
    settings: ConnectionSettings,
    codec: Mutex<C>,
    outbound: Mutex<Outbound>,
    connection: Arc<dyn Connection>,
    streams: DashMap<StreamId, Arc<StreamEntry>>,
    server_listener: Option<Arc<dyn ServerStreamConnectionEventListener>>,
    event_listener: Mutex<Option<Arc<dyn StreamConnectionEventListener>>>,
    read_control: Arc<dyn ReadControl>,
    self_ref: Weak<Shared<C>>,
    pressure: Mutex<Pressure>,
    read_disabled_streams: Mutex<usize>,
    highest_inbound: AtomicU64,
    go_away_sent: AtomicBool,
    go_away_received: AtomicBool,
    closed: AtomicBool,
}

/// A stream connection multiplexing streams over one transport connection.
pub struct CodecConnection<C: Codec> {
    shared: Arc<Shared<C>>,
}

impl<C: Codec> CodecConnection<C> {
    /// Build the server side. New inbound streams are announced to `listener`.
    pub fn server(
        connection: Arc<dyn Connection>,
        codec: C,
        listener: Arc<dyn ServerStreamConnectionEventListener>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        Self::build(Role::Server, connection, codec, Some(listener), settings)
    }

    /// Build the client side. Streams are originated with `new_stream`.
    pub fn client(connection: Arc<dyn Connection>, codec: C, settings: ConnectionSettings) -> Arc<Self> {
        Self::build(Role::Client, connection, codec, None, settings)
    }

    fn build(
        role: Role,
        connection: Arc<dyn Connection>,
        codec: C,
        server_listener: Option<Arc<dyn ServerStreamConnectionEventListener>>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let protocol = codec.protocol();
        let shared = Arc::new_cyclic(|weak: &Weak<Shared<C>>| Shared {
            role,
            protocol,
            settings,
            codec: Mutex::new(codec),
            outbound: Mutex::new(Outbound::default()),
            connection,
            streams: DashMap::new(),
            server_listener,
            event_listener: Mutex::new(None),
            read_control: Arc::new(ConnectionReadControl { shared: weak.clone() }),
            self_ref: weak.clone(),
            pressure: Mutex::new(Pressure::default()),
            read_disabled_streams: Mutex::new(0),
            highest_inbound: AtomicU64::new(0),
            go_away_sent: AtomicBool::new(false),
            go_away_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        tracing::debug!(
            connection_id = %shared.connection.id(),
            role = role.as_str(),
            protocol = %protocol,
            "Stream connection created"
        );
        Arc::new(Self { shared })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Install the listener told about a peer GoAway on a client connection.
    pub fn set_event_listener(&self, listener: Arc<dyn StreamConnectionEventListener>) {
        *self.shared.event_listener.lock() = Some(listener);
    }

    /// True once GoAway was sent or received.
    pub fn is_going_away(&self) -> bool {
        self.shared.is_going_away()
    }

    /// The transport this stream connection writes to.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.shared.connection
    }
}

impl<C: Codec> Shared<C> {
    fn entry(&self, id: StreamId) -> Option<Arc<StreamEntry>> {
        self.streams.get(&id).map(|e| Arc::clone(e.value()))
    }

    fn is_going_away(&self) -> bool {
        self.go_away_sent.load(Ordering::SeqCst) || self.go_away_received.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Encode a frame into the outbound buffer without writing it yet.
    fn enqueue(&self, frame: &WireFrame) -> Result<(), CodecError> {
        let mut out = self.outbound.lock();
        let mark = out.buf.len();
        let result = self.codec.lock().encode(frame, &mut out.buf);
        if result.is_err() {
            out.buf.truncate(mark);
        }
        result
    }

    /// Hand buffered bytes to the transport. Only one caller writes at a
    /// time; frames enqueued meanwhile are picked up by that caller.
    fn flush(&self) -> Result<(), StreamError> {
        {
            let mut out = self.outbound.lock();
            if out.flushing {
                return Ok(());
            }
            out.flushing = true;
        }
        loop {
            let bytes = {
                let mut out = self.outbound.lock();
                if out.buf.is_empty() {
                    out.flushing = false;
                    return Ok(());
                }
                out.buf.split().freeze()
            };
            if let Err(e) = self.connection.write(bytes) {
                let mut out = self.outbound.lock();
                out.buf.clear();
                out.flushing = false;
                return Err(StreamError::Connection(e.to_string()));
            }
        }
    }

    fn send(&self, frame: WireFrame) -> Result<(), StreamError> {
        self.enqueue(&frame)?;
        self.flush()
    }

    fn send_reset(&self, id: StreamId, reason: StreamResetReason) {
        if let Err(e) = self.send(WireFrame::Reset { id, reason }) {
            tracing::debug!(stream_id = %id, error = %e, "Failed to send reset frame");
        }
    }

    /// Insert a fresh stream into the table.
    fn register(&self, id: StreamId) -> Result<Arc<StreamEntry>, StreamError> {
        let stream = Stream::with_read_control(id, Arc::clone(&self.read_control));
        let entry = Arc::new(StreamEntry::new(stream.clone()));

        {
            let pressure = self.pressure.lock();
            match self.streams.entry(id) {
                Entry::Occupied(_) => return Err(StreamError::DuplicateStream(id)),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&entry));
                }
            }
            // No listeners yet, so this only records the state.
            if pressure.applied {
                stream.run_high_watermark_callbacks();
            }
        }

        stream.add_event_listener(Arc::new(EntryListener {
            id,
            shared: self.self_ref.clone(),
        }));

        metrics::record_stream_created(self.protocol.name(), self.role.as_str());
        tracing::debug!(
            connection_id = %self.connection.id(),
            stream_id = %id,
            role = self.role.as_str(),
            "Stream created"
        );
        Ok(entry)
    }

    fn remove(&self, id: StreamId) -> Option<Arc<StreamEntry>> {
        let (_, entry) = self.streams.remove(&id)?;
        entry.gate.close();
        if entry.read_disabled.swap(false, Ordering::SeqCst) {
            self.release_read_disable();
        }
        metrics::record_stream_closed();
        Some(entry)
    }

    /// Drop the stream once both directions have reached their ends.
    fn maybe_complete(&self, id: StreamId) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        if entry.local_ended.load(Ordering::SeqCst) && entry.gate.end_delivered() && self.remove(id).is_some() {
            tracing::debug!(stream_id = %id, "Stream complete");
        }
    }

    fn on_local_end(&self, id: StreamId) {
        if let Some(entry) = self.entry(id) {
            entry.local_ended.store(true, Ordering::SeqCst);
            self.maybe_complete(id);
        }
    }

    fn on_stream_reset(&self, id: StreamId, reason: StreamResetReason) {
        let Some(entry) = self.remove(id) else {
            return;
        };
        if reason.is_local() && !entry.peer_reset.load(Ordering::SeqCst) && !self.is_closed() {
            self.send_reset(id, reason);
        }
    }

    fn reset_all(&self, reason: StreamResetReason) {
        let streams: Vec<Stream> = self.streams.iter().map(|e| e.value().stream.clone()).collect();
        if !streams.is_empty() {
            tracing::debug!(
                connection_id = %self.connection.id(),
                streams = streams.len(),
                reason = %reason,
                "Resetting all streams"
            );
        }
        for stream in streams {
            stream.reset_stream(reason);
        }
    }

    fn on_wire_frame(&self, frame: WireFrame) {
        match frame {
            WireFrame::Stream { id, frame } => self.on_stream_frame(id, frame),
            WireFrame::Reset { id, reason } => {
                let Some(entry) = self.entry(id) else {
                    tracing::debug!(stream_id = %id, "Reset for unknown stream ignored");
                    return;
                };
                entry.peer_reset.store(true, Ordering::SeqCst);
                let local = match reason {
                    StreamResetReason::Overflow => StreamResetReason::Overflow,
                    _ => StreamResetReason::RemoteReset,
                };
                entry.stream.reset_stream(local);
            }
            WireFrame::GoAway => {
                if self.go_away_received.swap(true, Ordering::SeqCst) {
                    return;
                }
                tracing::info!(connection_id = %self.connection.id(), "Peer sent GoAway");
                metrics::record_go_away("received");
                if let Some(server) = &self.server_listener {
                    server.on_go_away();
                } else if let Some(listener) = self.event_listener.lock().clone() {
                    listener.on_go_away();
                }
            }
        }
    }

    fn on_stream_frame(&self, id: StreamId, frame: Frame) {
        let Some(entry) = self.entry(id) else {
            self.on_unknown_stream_frame(id, frame);
            return;
        };

        let checked = entry.inbound.lock().check(frame.kind(), frame.end_stream());
        if let Err(e) = checked {
            tracing::warn!(
                connection_id = %self.connection.id(),
                stream_id = %id,
                error = %e,
                "Peer violated frame order"
            );
            entry.peer_reset.store(true, Ordering::SeqCst);
            self.send_reset(id, StreamResetReason::LocalReset);
            entry.stream.reset_stream(StreamResetReason::RemoteReset);
            return;
        }

        entry.gate.push(frame);
        self.maybe_complete(id);
    }

    fn on_unknown_stream_frame(&self, id: StreamId, frame: Frame) {
        let opens_stream = self.role == Role::Server
            && id.as_u64() != 0
            && id.as_u64() > self.highest_inbound.load(Ordering::SeqCst);
        if !opens_stream {
            tracing::debug!(stream_id = %id, kind = %frame.kind(), "Frame for closed or unknown stream dropped");
            return;
        }
        if frame.kind() != FrameKind::Headers {
            tracing::warn!(stream_id = %id, kind = %frame.kind(), "Stream opened without headers");
            self.send_reset(id, StreamResetReason::LocalReset);
            return;
        }
        self.highest_inbound.store(id.as_u64(), Ordering::SeqCst);

        if self.is_going_away() {
            tracing::warn!(stream_id = %id, "Refusing stream after GoAway");
            self.send_reset(id, StreamResetReason::LocalReset);
            return;
        }
        if self.streams.len() >= self.settings.max_concurrent_streams {
            tracing::warn!(
                stream_id = %id,
                limit = self.settings.max_concurrent_streams,
                "Refusing stream over concurrency limit"
            );
            metrics::record_stream_reset(StreamResetReason::Overflow);
            self.send_reset(id, StreamResetReason::Overflow);
            return;
        }

        self.accept_stream(id, frame);
    }

    fn accept_stream(&self, id: StreamId, headers: Frame) {
        let Some(listener) = self.server_listener.clone() else {
            return;
        };
        let entry = match self.register(id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(stream_id = %id, error = %e, "Failed to register inbound stream");
                return;
            }
        };
        // A fresh direction always accepts headers.
        let _ = entry.inbound.lock().check(headers.kind(), headers.end_stream());

        let encoder: Arc<dyn StreamEncoder> = Arc::new(CodecStreamEncoder::new(
            id,
            entry.stream.clone(),
            self.self_ref.clone(),
        ));
        let decoder = listener.new_stream(id, encoder);
        entry.gate.bind(decoder);
        entry.gate.push(headers);
        self.maybe_complete(id);
    }

    fn on_stream_read_disable(&self, id: StreamId, disable: bool) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        if entry.read_disabled.swap(disable, Ordering::SeqCst) == disable {
            return;
        }
        if disable {
            let mut count = self.read_disabled_streams.lock();
            *count += 1;
            if *count == 1 {
                tracing::debug!(connection_id = %self.connection.id(), "Pausing transport reads");
                self.connection.read_disable(true);
            }
        } else {
            self.release_read_disable();
        }
        entry.gate.set_disabled(disable);
        if !disable {
            self.maybe_complete(id);
        }
    }

    fn release_read_disable(&self) {
        let mut count = self.read_disabled_streams.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            tracing::debug!(connection_id = %self.connection.id(), "Resuming transport reads");
            self.connection.read_disable(false);
        }
    }

    fn set_pressure(&self, above: bool) {
        {
            let mut pressure = self.pressure.lock();
            pressure.above = above;
            if pressure.running {
                return;
            }
            pressure.running = true;
        }
        loop {
            let (above, streams) = {
                let mut pressure = self.pressure.lock();
                if pressure.applied == pressure.above {
                    pressure.running = false;
                    return;
                }
                pressure.applied = pressure.above;
                let streams: Vec<Stream> = self.streams.iter().map(|e| e.value().stream.clone()).collect();
                (pressure.applied, streams)
            };

            let edge = if above { "above" } else { "below" };
            metrics::record_watermark_event("connection", edge);
            tracing::debug!(
                connection_id = %self.connection.id(),
                edge,
                streams = streams.len(),
                "Connection write watermark crossed"
            );
            for stream in streams {
                if above {
                    stream.run_high_watermark_callbacks();
                } else {
                    stream.run_low_watermark_callbacks();
                }
            }
        }
    }
}

impl<C: Codec> StreamConnection for CodecConnection<C> {
    fn dispatch(&self, buffer: &mut BytesMut) -> Result<(), CodecError> {
        loop {
            let decoded = self.shared.codec.lock().decode(buffer);
            match decoded {
                Ok(Some(frame)) => self.shared.on_wire_frame(frame),
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        connection_id = %self.shared.connection.id(),
                        error = %e,
                        "Codec error, failing connection"
                    );
                    self.shared.closed.store(true, Ordering::SeqCst);
                    self.shared.reset_all(StreamResetReason::ConnectionFailed);
                    return Err(e);
                }
            }
        }
    }

    fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    fn go_away(&self) {
        if self.shared.go_away_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            connection_id = %self.shared.connection.id(),
            active_streams = self.shared.streams.len(),
            "Sending GoAway"
        );
        metrics::record_go_away("sent");
        if let Err(e) = self.shared.send(WireFrame::GoAway) {
            tracing::warn!(connection_id = %self.shared.connection.id(), error = %e, "Failed to send GoAway");
        }
    }

    fn on_underlying_connection_above_write_buffer_high_watermark(&self) {
        self.shared.set_pressure(true);
    }

    fn on_underlying_connection_below_write_buffer_low_watermark(&self) {
        self.shared.set_pressure(false);
    }

    fn on_connection_close(&self, event: ConnectionEvent) {
        if self.shared.closed.swap(true, Ordering::SeqCst) && self.shared.streams.is_empty() {
            return;
        }
        let reason = if event.is_failure() {
            StreamResetReason::ConnectionFailed
        } else {
            StreamResetReason::ConnectionTermination
        };
        tracing::debug!(connection_id = %self.shared.connection.id(), event = ?event, "Underlying connection closed");
        self.shared.reset_all(reason);
    }

    fn active_streams(&self) -> usize {
        self.shared.streams.len()
    }
}

impl<C: Codec> ServerStreamConnection for CodecConnection<C> {}

impl<C: Codec> ClientStreamConnection for CodecConnection<C> {
    fn new_stream(
        &self,
        stream_id: StreamId,
        response_decoder: Arc<dyn StreamDecoder>,
    ) -> Result<Arc<dyn StreamEncoder>, StreamError> {
        let shared = &self.shared;
        if shared.role != Role::Client {
            return Err(StreamError::Connection("server connections do not originate streams".into()));
        }
        if shared.is_closed() {
            return Err(StreamError::StreamClosed(StreamResetReason::ConnectionTermination));
        }
        if shared.is_going_away() {
            return Err(StreamError::GoAway);
        }
        if stream_id.as_u64() == 0 {
            return Err(CodecError::ReservedStreamId.into());
        }
        if stream_id.as_u64() > shared.settings.max_stream_id
            || shared.streams.len() >= shared.settings.max_concurrent_streams
        {
            return Err(StreamError::Overflow);
        }

        let entry = shared.register(stream_id)?;
        entry.gate.bind(response_decoder);
        Ok(Arc::new(CodecStreamEncoder::new(
            stream_id,
            entry.stream.clone(),
            Arc::downgrade(shared),
        )))
    }
}

/// Encodes one stream's outbound frames onto the connection.
struct CodecStreamEncoder<C: Codec> {
    id: StreamId,
    stream: Stream,
    order: Mutex<FrameOrder>,
    shared: Weak<Shared<C>>,
}

impl<C: Codec> CodecStreamEncoder<C> {
    fn new(id: StreamId, stream: Stream, shared: Weak<Shared<C>>) -> Self {
        Self {
            id,
            stream,
            order: Mutex::new(FrameOrder::new()),
            shared,
        }
    }

    fn send(&self, frame: Frame) -> Result<(), StreamError> {
        if let Some(reason) = self.stream.reset_reason() {
            return Err(StreamError::StreamClosed(reason));
        }
        let shared = self
            .shared
            .upgrade()
            .ok_or(StreamError::StreamClosed(StreamResetReason::ConnectionTermination))?;
        if shared.is_closed() {
            return Err(StreamError::StreamClosed(StreamResetReason::ConnectionTermination));
        }

        let end_stream = frame.end_stream();
        {
            let mut order = self.order.lock();
            let mut next = *order;
            next.check(frame.kind(), end_stream)?;
            // Only a frame that made it into the outbound buffer advances the direction.
            shared.enqueue(&WireFrame::Stream { id: self.id, frame })?;
            *order = next;
        }
        if let Err(e) = shared.flush() {
            tracing::warn!(stream_id = %self.id, error = %e, "Write failed, resetting stream");
            self.stream.reset_stream(StreamResetReason::LocalReset);
            return Err(e);
        }
        if end_stream {
            shared.on_local_end(self.id);
        }
        Ok(())
    }
}

impl<C: Codec> StreamEncoder for CodecStreamEncoder<C> {
    fn encode_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), StreamError> {
        self.send(Frame::Headers { headers, end_stream })
    }

    fn encode_data(&self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.send(Frame::Data {
            data: BytesMut::from(&data[..]),
            end_stream,
        })
    }

    fn encode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.send(Frame::Trailers(trailers))
    }

    fn stream(&self) -> Stream {
        self.stream.clone()
    }
}

/// Removes the stream from the table when it is reset.
struct EntryListener<C: Codec> {
    id: StreamId,
    shared: Weak<Shared<C>>,
}

impl<C: Codec> StreamEventListener for EntryListener<C> {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_stream_reset(self.id, reason);
        }
    }

    fn on_above_write_buffer_high_watermark(&self) {}

    fn on_below_write_buffer_low_watermark(&self) {}
}

struct ConnectionReadControl<C: Codec> {
    shared: Weak<Shared<C>>,
}

impl<C: Codec> ReadControl for ConnectionReadControl<C> {
    fn on_read_disable(&self, stream_id: StreamId, disable: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_stream_read_disable(stream_id, disable);
        }
    }
}
