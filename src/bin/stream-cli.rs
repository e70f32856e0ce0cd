use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use mesh_stream::config::{FilterConfig, ObservabilityConfig};
use mesh_stream::connection::{ClientStreamConnection, CodecConnection, ConnectionSettings, StreamConnection};
use mesh_stream::filter::{ConfiguredChainFactory, FilteringClientConnection};
use mesh_stream::net::{Connection, TcpConnection};
use mesh_stream::observability::logging;
use mesh_stream::protocol::FramedCodec;
use mesh_stream::stream::{
    HeaderMap, StreamDecoder, StreamEventListener, StreamId, StreamResetReason,
};

#[derive(Parser)]
#[command(name = "stream-cli")]
#[command(about = "Client for the mesh-stream framed protocol", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:10000")]
    addr: String,

    /// Client-side filter to add to every stream (repeatable).
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Seconds to wait for each response.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Send {
        #[arg(long, default_value = "/")]
        path: String,
        /// Extra request header as `name=value` (repeatable).
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        #[arg(long)]
        body: Option<String>,
    },
    /// Send requests one after another on one connection and report timings
    Repeat {
        #[arg(long, default_value_t = 10)]
        count: u64,
        #[arg(long, default_value = "/")]
        path: String,
        #[arg(long, default_value_t = 0)]
        body_bytes: usize,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))
}

#[derive(Debug, Default)]
struct Response {
    headers: HeaderMap,
    body: BytesMut,
    trailers: Option<HeaderMap>,
}

/// Collects one response and hands it over when the stream ends or resets.
struct ResponseCollector {
    response: Mutex<Response>,
    done: Mutex<Option<oneshot::Sender<Result<Response, StreamResetReason>>>>,
}

impl ResponseCollector {
    fn new() -> (Arc<Self>, oneshot::Receiver<Result<Response, StreamResetReason>>) {
        let (tx, rx) = oneshot::channel();
        let collector = Arc::new(Self {
            response: Mutex::new(Response::default()),
            done: Mutex::new(Some(tx)),
        });
        (collector, rx)
    }

    fn finish(&self, outcome: Result<Response, StreamResetReason>) {
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    fn complete(&self) {
        let response = std::mem::take(&mut *self.response.lock());
        self.finish(Ok(response));
    }
}

impl StreamDecoder for ResponseCollector {
    fn on_decode_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.response.lock().headers = headers;
        if end_stream {
            self.complete();
        }
    }

    fn on_decode_data(&self, data: Bytes, end_stream: bool) {
        self.response.lock().body.extend_from_slice(&data);
        if end_stream {
            self.complete();
        }
    }

    fn on_decode_trailers(&self, trailers: HeaderMap) {
        self.response.lock().trailers = Some(trailers);
        self.complete();
    }
}

impl StreamEventListener for ResponseCollector {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        self.finish(Err(reason));
    }

    fn on_above_write_buffer_high_watermark(&self) {}

    fn on_below_write_buffer_low_watermark(&self) {}
}

struct Client {
    streams: FilteringClientConnection,
    next_id: u64,
    timeout: Duration,
}

impl Client {
    async fn request(
        &mut self,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response, Box<dyn std::error::Error>> {
        let stream_id = StreamId::new(self.next_id);
        self.next_id += 2;

        let (collector, rx) = ResponseCollector::new();
        let encoder = self.streams.new_stream(stream_id, collector.clone())?;
        encoder.stream().add_event_listener(collector);

        match body {
            Some(body) if !body.is_empty() => {
                encoder.encode_headers(headers, false)?;
                encoder.encode_data(body, true)?;
            }
            _ => encoder.encode_headers(headers, true)?,
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(format!("stream {stream_id} reset: {reason}").into()),
            Ok(Err(_)) => Err(format!("stream {stream_id} abandoned").into()),
            Err(_) => Err(format!("stream {stream_id} timed out").into()),
        }
    }
}

fn request_headers(path: &str, extra: Vec<(String, String)>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(":path".to_string(), path.to_string());
    headers.extend(extra);
    headers
}

fn print_response(response: &Response) {
    for (name, value) in &response.headers {
        println!("{name}: {value}");
    }
    println!();
    println!("{}", String::from_utf8_lossy(&response.body));
    if let Some(trailers) = &response.trailers {
        for (name, value) in trailers {
            println!("{name}: {value}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&ObservabilityConfig {
        log_level: "warn".to_string(),
        ..ObservabilityConfig::default()
    });

    let socket = TcpStream::connect(&cli.addr).await?;
    let peer = socket.peer_addr().ok();
    let transport = TcpConnection::new(peer, 1024 * 1024);
    let codec_connection = CodecConnection::client(transport.clone(), FramedCodec::new(), ConnectionSettings::default());
    let handler: Arc<dyn StreamConnection> = codec_connection.clone();
    let io = tokio::spawn(transport.clone().run(socket, handler));

    let filters: Vec<FilterConfig> = cli.filters.iter().map(|name| FilterConfig::named(name)).collect();
    let factory = Arc::new(ConfiguredChainFactory::new(&filters));
    let mut client = Client {
        streams: FilteringClientConnection::new(codec_connection, factory).with_connection(transport.clone()),
        next_id: 1,
        timeout: Duration::from_secs(cli.timeout_secs),
    };

    match cli.command {
        Commands::Send { path, headers, body } => {
            let response = client
                .request(request_headers(&path, headers), body.map(Bytes::from))
                .await?;
            print_response(&response);
        }
        Commands::Repeat {
            count,
            path,
            body_bytes,
        } => {
            let body = Bytes::from(vec![b'x'; body_bytes]);
            let started = Instant::now();
            let mut failures = 0u64;
            for _ in 0..count {
                let sent = Instant::now();
                match client.request(request_headers(&path, Vec::new()), Some(body.clone())).await {
                    Ok(response) => {
                        let status = response.headers.get(":status").map(String::as_str).unwrap_or("-");
                        println!("status={status} bytes={} elapsed={:?}", response.body.len(), sent.elapsed());
                    }
                    Err(e) => {
                        failures += 1;
                        eprintln!("Error: {e}");
                    }
                }
            }
            println!("{count} requests, {failures} failed, {:?} total", started.elapsed());
        }
    }

    client.streams.go_away();
    transport.close();
    let _ = io.await;
    Ok(())
}
