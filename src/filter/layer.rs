//! Splicing filter chains into stream connections.
//!
//! The same `FilterManager` serves both roles. On the server it wraps the
//! application's `ServerStreamConnectionEventListener`; on the client it
//! wraps a `ClientStreamConnection`. In each case the side that did not
//! originate the stream hands over a decoder and gets an encoder back, and
//! the manager stands in for both.

use bytes::BytesMut;
use std::sync::Arc;

use crate::connection::{
    ClientStreamConnection, CodecError, Role, ServerStreamConnectionEventListener, StreamConnection,
    StreamConnectionEventListener,
};
use crate::filter::manager::{ChainSettings, FilterManager};
use crate::filter::traits::{ChainContext, StreamFilterChainFactory};
use crate::net::{Connection, ConnectionEvent};
use crate::stream::{
    Protocol, StreamDecoder, StreamEncoder, StreamError, StreamEventListener, StreamId, StreamResetReason,
};

/// Runs every inbound stream through a filter chain before the application sees it.
pub struct FilteringServerListener {
    inner: Arc<dyn ServerStreamConnectionEventListener>,
    factory: Arc<dyn StreamFilterChainFactory>,
    settings: ChainSettings,
    protocol: Protocol,
    connection: Option<Arc<dyn Connection>>,
}

impl FilteringServerListener {
    pub fn new(
        inner: Arc<dyn ServerStreamConnectionEventListener>,
        factory: Arc<dyn StreamFilterChainFactory>,
        protocol: Protocol,
    ) -> Self {
        Self {
            inner,
            factory,
            settings: ChainSettings::default(),
            protocol,
            connection: None,
        }
    }

    pub fn with_settings(mut self, settings: ChainSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The transport connection exposed to filters.
    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl StreamConnectionEventListener for FilteringServerListener {
    fn on_go_away(&self) {
        self.inner.on_go_away();
    }
}

impl ServerStreamConnectionEventListener for FilteringServerListener {
    fn new_stream(&self, stream_id: StreamId, response_encoder: Arc<dyn StreamEncoder>) -> Arc<dyn StreamDecoder> {
        let context = ChainContext {
            stream_id,
            protocol: self.protocol,
            role: Role::Server,
            connection: self.connection.clone(),
        };
        let manager = FilterManager::new(&context, self.factory.as_ref(), &self.settings);
        manager.bind_encoder(response_encoder);
        let decoder = self.inner.new_stream(stream_id, manager.clone());
        manager.bind_decoder(decoder);
        manager
    }
}

/// A client stream connection whose streams run through a filter chain.
pub struct FilteringClientConnection {
    inner: Arc<dyn ClientStreamConnection>,
    factory: Arc<dyn StreamFilterChainFactory>,
    settings: ChainSettings,
    connection: Option<Arc<dyn Connection>>,
}

impl FilteringClientConnection {
    pub fn new(inner: Arc<dyn ClientStreamConnection>, factory: Arc<dyn StreamFilterChainFactory>) -> Self {
        Self {
            inner,
            factory,
            settings: ChainSettings::default(),
            connection: None,
        }
    }

    pub fn with_settings(mut self, settings: ChainSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

impl StreamConnection for FilteringClientConnection {
    fn dispatch(&self, buffer: &mut BytesMut) -> Result<(), CodecError> {
        self.inner.dispatch(buffer)
    }

    fn protocol(&self) -> Protocol {
        self.inner.protocol()
    }

    fn go_away(&self) {
        self.inner.go_away();
    }

    fn on_underlying_connection_above_write_buffer_high_watermark(&self) {
        self.inner.on_underlying_connection_above_write_buffer_high_watermark();
    }

    fn on_underlying_connection_below_write_buffer_low_watermark(&self) {
        self.inner.on_underlying_connection_below_write_buffer_low_watermark();
    }

    fn on_connection_close(&self, event: ConnectionEvent) {
        self.inner.on_connection_close(event);
    }

    fn active_streams(&self) -> usize {
        self.inner.active_streams()
    }
}

impl ClientStreamConnection for FilteringClientConnection {
    fn new_stream(
        &self,
        stream_id: StreamId,
        response_decoder: Arc<dyn StreamDecoder>,
    ) -> Result<Arc<dyn StreamEncoder>, StreamError> {
        let context = ChainContext {
            stream_id,
            protocol: self.inner.protocol(),
            role: Role::Client,
            connection: self.connection.clone(),
        };
        let manager = FilterManager::new(&context, self.factory.as_ref(), &self.settings);
        manager.bind_decoder(response_decoder);

        match self.inner.new_stream(stream_id, manager.clone()) {
            Ok(encoder) => {
                manager.bind_encoder(encoder);
                Ok(manager)
            }
            Err(e) => {
                // The chain never ran; its filters still get on_destroy.
                manager.on_reset_stream(StreamResetReason::LocalReset);
                Err(e)
            }
        }
    }
}
