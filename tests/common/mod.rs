//! Shared utilities for the end-to-end tests.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_stream::connection::{
    ClientStreamConnection, CodecConnection, ConnectionSettings, ServerStreamConnectionEventListener,
    StreamConnection, StreamConnectionEventListener,
};
use mesh_stream::filter::{
    ChainContext, DecoderFilterCallbacks, DecoderFilterHandle, FilterChainFactoryCallbacks, FilterDataStatus,
    FilterHeadersStatus, FilteringServerListener, StreamDecoderFilter, StreamFilterBase, StreamFilterChainFactory,
};
use mesh_stream::net::{Connection, ConnectionError, ConnectionId};
use mesh_stream::protocol::FramedCodec;
use mesh_stream::stream::{Frame, HeaderMap, Protocol, StreamDecoder, StreamEncoder, StreamError, StreamId};

/// An in-memory transport. Writes collect in an outbox that `Pair::pump`
/// delivers to the peer.
#[derive(Default)]
pub struct MemoryConnection {
    id: ConnectionId,
    outbox: Mutex<BytesMut>,
    read_disabled: AtomicBool,
    read_disable_calls: Mutex<Vec<bool>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_outbox(&self) -> BytesMut {
        self.outbox.lock().split()
    }

    /// Every `read_disable` call in order.
    pub fn read_disable_calls(&self) -> Vec<bool> {
        self.read_disable_calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn write(&self, data: Bytes) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.outbox.lock().extend_from_slice(&data);
        Ok(())
    }

    fn read_disable(&self, disable: bool) {
        self.read_disable_calls.lock().push(disable);
        self.read_disabled.store(disable, Ordering::SeqCst);
    }

    fn is_read_disabled(&self) -> bool {
        self.read_disabled.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A client and a filtering server stream connection joined in memory.
pub struct Pair {
    pub client_transport: Arc<MemoryConnection>,
    pub server_transport: Arc<MemoryConnection>,
    pub client: Arc<CodecConnection<FramedCodec>>,
    pub server: Arc<CodecConnection<FramedCodec>>,
    client_inbox: Mutex<BytesMut>,
    server_inbox: Mutex<BytesMut>,
}

impl Pair {
    pub fn new(app: Arc<dyn ServerStreamConnectionEventListener>, factory: Arc<dyn StreamFilterChainFactory>) -> Self {
        let client_transport = MemoryConnection::new();
        let server_transport = MemoryConnection::new();
        let filtering = FilteringServerListener::new(app, factory, Protocol::FRAMED)
            .with_connection(server_transport.clone());
        let server = CodecConnection::server(
            server_transport.clone(),
            FramedCodec::new(),
            Arc::new(filtering),
            ConnectionSettings::default(),
        );
        let client = CodecConnection::client(client_transport.clone(), FramedCodec::new(), ConnectionSettings::default());
        Self {
            client_transport,
            server_transport,
            client,
            server,
            client_inbox: Mutex::new(BytesMut::new()),
            server_inbox: Mutex::new(BytesMut::new()),
        }
    }

    /// Open a client stream whose response goes to `decoder`.
    pub fn open(&self, id: u64, decoder: Arc<dyn StreamDecoder>) -> Result<Arc<dyn StreamEncoder>, StreamError> {
        self.client.new_stream(StreamId::new(id), decoder)
    }

    /// Move bytes between the two sides until neither can make progress.
    /// A read-disabled side keeps its inbound bytes queued.
    pub fn pump(&self) {
        loop {
            let mut progressed = false;
            progressed |= deliver(&self.client_transport, &self.server_transport, &self.server_inbox, &*self.server);
            progressed |= deliver(&self.server_transport, &self.client_transport, &self.client_inbox, &*self.client);
            if !progressed {
                return;
            }
        }
    }

    /// Bytes waiting for the server because its reads are paused.
    pub fn server_backlog(&self) -> usize {
        self.server_inbox.lock().len()
    }
}

fn deliver(
    from: &MemoryConnection,
    to: &MemoryConnection,
    inbox: &Mutex<BytesMut>,
    receiver: &dyn StreamConnection,
) -> bool {
    let moved = from.take_outbox();
    let mut progressed = !moved.is_empty();
    let mut inbox = inbox.lock();
    inbox.extend_from_slice(&moved);
    if !to.is_read_disabled() && !inbox.is_empty() {
        let before = inbox.len();
        receiver.dispatch(&mut inbox).expect("dispatch failed");
        progressed |= inbox.len() != before;
    }
    progressed
}

/// Records every frame it decodes.
#[derive(Default)]
pub struct Recorder {
    frames: Mutex<Vec<Frame>>,
}

impl Recorder {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }
}

impl StreamDecoder for Recorder {
    fn on_decode_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.frames.lock().push(Frame::Headers { headers, end_stream });
    }

    fn on_decode_data(&self, data: Bytes, end_stream: bool) {
        self.frames.lock().push(Frame::Data {
            data: BytesMut::from(&data[..]),
            end_stream,
        });
    }

    fn on_decode_trailers(&self, trailers: HeaderMap) {
        self.frames.lock().push(Frame::Trailers(trailers));
    }
}

/// Server application that records requests and keeps the response
/// encoders for the test to drive.
#[derive(Default)]
pub struct RecordingApp {
    pub requests: Mutex<Vec<(StreamId, Arc<Recorder>)>>,
    pub encoders: Mutex<Vec<Arc<dyn StreamEncoder>>>,
}

impl RecordingApp {
    pub fn request(&self, index: usize) -> Arc<Recorder> {
        Arc::clone(&self.requests.lock()[index].1)
    }

    pub fn encoder(&self, index: usize) -> Arc<dyn StreamEncoder> {
        Arc::clone(&self.encoders.lock()[index])
    }
}

impl StreamConnectionEventListener for RecordingApp {
    fn on_go_away(&self) {}
}

impl ServerStreamConnectionEventListener for RecordingApp {
    fn new_stream(&self, stream_id: StreamId, response_encoder: Arc<dyn StreamEncoder>) -> Arc<dyn StreamDecoder> {
        let recorder = Arc::new(Recorder::default());
        self.requests.lock().push((stream_id, Arc::clone(&recorder)));
        self.encoders.lock().push(response_encoder);
        recorder
    }
}

/// A decoder filter with a fixed data verdict. The last handle it saw is
/// kept so the test can resume it later.
pub struct Scripted {
    name: &'static str,
    data_status: FilterDataStatus,
    log: Arc<Mutex<Vec<String>>>,
    handle: Arc<Mutex<Option<DecoderFilterHandle>>>,
}

impl StreamFilterBase for Scripted {}

impl StreamDecoderFilter for Scripted {
    fn decode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
        _callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterHeadersStatus {
        self.log.lock().push(format!("{}:headers", self.name));
        FilterHeadersStatus::Continue
    }

    fn decode_data(
        &mut self,
        data: &mut BytesMut,
        _end_stream: bool,
        callbacks: &DecoderFilterCallbacks<'_>,
    ) -> FilterDataStatus {
        self.log.lock().push(format!("{}:data:{}", self.name, data.len()));
        *self.handle.lock() = Some(callbacks.handle());
        self.data_status
    }
}

/// Builds one `Scripted` decoder filter per entry, in order.
pub struct ScriptedFactory {
    script: Vec<(&'static str, FilterDataStatus)>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub handles: Vec<Arc<Mutex<Option<DecoderFilterHandle>>>>,
}

impl ScriptedFactory {
    pub fn new(script: Vec<(&'static str, FilterDataStatus)>) -> Self {
        let handles = script.iter().map(|_| Arc::new(Mutex::new(None))).collect();
        Self {
            script,
            log: Arc::new(Mutex::new(Vec::new())),
            handles,
        }
    }

    pub fn handle(&self, index: usize) -> Option<DecoderFilterHandle> {
        self.handles[index].lock().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl StreamFilterChainFactory for ScriptedFactory {
    fn create_filter_chain(&self, _context: &ChainContext, callbacks: &mut dyn FilterChainFactoryCallbacks) {
        for ((name, data_status), handle) in self.script.iter().zip(&self.handles) {
            callbacks.add_stream_decoder_filter(Box::new(Scripted {
                name: *name,
                data_status: *data_status,
                log: Arc::clone(&self.log),
                handle: Arc::clone(handle),
            }));
        }
    }
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn data(bytes: &[u8], end_stream: bool) -> Frame {
    Frame::Data {
        data: BytesMut::from(bytes),
        end_stream,
    }
}
