//! Echo application: answers every stream with `:status 200` and the
//! request body and trailers.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::connection::{ServerStreamConnectionEventListener, StreamConnectionEventListener};
use crate::stream::{HeaderMap, StreamDecoder, StreamEncoder, StreamError, StreamId};

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoApplication;

impl StreamConnectionEventListener for EchoApplication {
    fn on_go_away(&self) {
        tracing::debug!("Peer sent GoAway");
    }
}

impl ServerStreamConnectionEventListener for EchoApplication {
    fn new_stream(&self, stream_id: StreamId, response_encoder: Arc<dyn StreamEncoder>) -> Arc<dyn StreamDecoder> {
        Arc::new(EchoStream {
            stream_id,
            encoder: response_encoder,
            body: Mutex::new(BytesMut::new()),
        })
    }
}

struct EchoStream {
    stream_id: StreamId,
    encoder: Arc<dyn StreamEncoder>,
    body: Mutex<BytesMut>,
}

impl EchoStream {
    fn respond(&self, trailers: Option<HeaderMap>) {
        let body = self.body.lock().split().freeze();
        if let Err(e) = self.write_response(body, trailers) {
            tracing::warn!(stream_id = %self.stream_id, error = %e, "Failed to send echo response");
        }
    }

    fn write_response(&self, body: Bytes, trailers: Option<HeaderMap>) -> Result<(), StreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(":status".to_string(), "200".to_string());

        match trailers {
            None if body.is_empty() => self.encoder.encode_headers(headers, true),
            None => {
                self.encoder.encode_headers(headers, false)?;
                self.encoder.encode_data(body, true)
            }
            Some(trailers) => {
                self.encoder.encode_headers(headers, false)?;
                if !body.is_empty() {
                    self.encoder.encode_data(body, false)?;
                }
                self.encoder.encode_trailers(trailers)
            }
        }
    }
}

impl StreamDecoder for EchoStream {
    fn on_decode_headers(&self, _headers: HeaderMap, end_stream: bool) {
        if end_stream {
            self.respond(None);
        }
    }

    fn on_decode_data(&self, data: Bytes, end_stream: bool) {
        self.body.lock().extend_from_slice(&data);
        if end_stream {
            self.respond(None);
        }
    }

    fn on_decode_trailers(&self, trailers: HeaderMap) {
        self.respond(Some(trailers));
    }
}
