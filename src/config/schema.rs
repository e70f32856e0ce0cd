//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Listener configuration (bind address, limits, buffer sizes).
    pub listener: ListenerConfig,

    /// Per-connection and per-stream limits.
    pub stream: StreamConfig,

    /// Filter chain, in execution order.
    pub filters: Vec<FilterConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Name used in logs.
    pub name: String,

    /// Bind address (e.g., "0.0.0.0:7070").
    pub bind_address: String,

    /// When false the listener is configured but never accepts.
    pub bind_to_port: bool,

    /// Opaque tag identifying the listener across restarts.
    pub listener_tag: u64,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Connection write buffer high watermark. The low watermark is half.
    pub per_conn_buffer_limit_bytes: usize,

    /// Passed through to the accept callback for restored connections.
    pub hand_off_restored_destination_connections: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            bind_address: "0.0.0.0:7070".to_string(),
            bind_to_port: true,
            listener_tag: 0,
            max_connections: 10_000,
            per_conn_buffer_limit_bytes: 1024 * 1024,
            hand_off_restored_destination_connections: false,
        }
    }
}

/// Stream limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Inbound streams beyond this are refused with Overflow.
    pub max_concurrent_streams: usize,

    /// Default decode-direction filter buffer limit (0 = unlimited).
    pub decoder_buffer_limit: usize,

    /// Default encode-direction filter buffer limit (0 = unlimited).
    pub encoder_buffer_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 1024,
            decoder_buffer_limit: 1024 * 1024,
            encoder_buffer_limit: 1024 * 1024,
        }
    }
}

/// One entry of the filter chain.
///
/// Settings not used by the named filter are ignored.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Filter name: `request_id`, `rate_limit` or `buffer`.
    pub name: String,

    /// Token refill rate for `rate_limit`.
    pub requests_per_second: u32,

    /// Bucket size for `rate_limit`.
    pub burst: u32,

    /// Largest request body held by `buffer`.
    pub max_request_bytes: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            requests_per_second: 100,
            burst: 50,
            max_request_bytes: 64 * 1024,
        }
    }
}

impl FilterConfig {
    /// Convenience constructor with default settings.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: `text` or `json`.
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for connections to drain after GoAway.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { drain_timeout_secs: 30 }
    }
}
