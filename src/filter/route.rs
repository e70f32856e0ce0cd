//! Routes and per-stream request metadata.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::stream::{HeaderMap, Protocol, StreamResetReason};

/// The route resolved for a stream by the proxy layer.
pub trait Route: Send + Sync {
    fn name(&self) -> &str;

    /// Upstream cluster the stream is sent to.
    fn cluster(&self) -> &str;
}

/// Resolves a route from request headers.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<Arc<dyn Route>>;
}

/// A fixed route.
#[derive(Debug, Clone)]
pub struct StaticRoute {
    name: String,
    cluster: String,
}

impl StaticRoute {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: cluster.into(),
        }
    }
}

impl Route for StaticRoute {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }
}

/// Resolves `:path` against path prefixes. First match wins.
#[derive(Default)]
pub struct PathPrefixResolver {
    routes: Vec<(String, Arc<dyn Route>)>,
}

impl PathPrefixResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, prefix: impl Into<String>, route: Arc<dyn Route>) -> Self {
        self.routes.push((prefix.into(), route));
        self
    }
}

impl RouteResolver for PathPrefixResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<Arc<dyn Route>> {
        let path = headers.get(":path")?;
        self.routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, route)| Arc::clone(route))
    }
}

/// Request metadata of one stream.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    start_time: SystemTime,
    protocol: Protocol,
    pub(crate) bytes_received: u64,
    pub(crate) bytes_sent: u64,
    downstream_remote_address: Option<SocketAddr>,
    pub(crate) reset_reason: Option<StreamResetReason>,
    pub(crate) local_reply: bool,
}

impl RequestInfo {
    pub(crate) fn new(protocol: Protocol, downstream_remote_address: Option<SocketAddr>) -> Self {
        Self {
            start_time: SystemTime::now(),
            protocol,
            bytes_received: 0,
            bytes_sent: 0,
            downstream_remote_address,
            reset_reason: None,
            local_reply: false,
        }
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Time since the stream started.
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed().unwrap_or_default()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Data bytes that entered the decode chain.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Data bytes that left the encode chain.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn downstream_remote_address(&self) -> Option<SocketAddr> {
        self.downstream_remote_address
    }

    pub fn reset_reason(&self) -> Option<StreamResetReason> {
        self.reset_reason
    }

    /// Whether a filter answered the stream itself.
    pub fn local_reply(&self) -> bool {
        self.local_reply
    }
}
