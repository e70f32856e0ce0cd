//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//! - Check the filter chain names only known filters, once each
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MeshConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::MeshConfig;
use crate::filter::builtin::KNOWN_FILTERS;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than {min}")]
    TooSmall { field: &'static str, min: u64 },

    #[error("unknown filter {0:?}")]
    UnknownFilter(String),

    #[error("filter {0:?} configured more than once")]
    DuplicateFilter(String),
}

/// Validate a parsed configuration, collecting every problem.
pub fn validate_config(config: &MeshConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::TooSmall { field: "listener.max_connections", min: 0 });
    }
    if config.listener.per_conn_buffer_limit_bytes < 2 {
        errors.push(ValidationError::TooSmall {
            field: "listener.per_conn_buffer_limit_bytes",
            min: 1,
        });
    }
    if config.stream.max_concurrent_streams == 0 {
        errors.push(ValidationError::TooSmall { field: "stream.max_concurrent_streams", min: 0 });
    }

    let mut seen = HashSet::new();
    for filter in &config.filters {
        if !KNOWN_FILTERS.contains(&filter.name.as_str()) {
            errors.push(ValidationError::UnknownFilter(filter.name.clone()));
            continue;
        }
        if !seen.insert(filter.name.as_str()) {
            errors.push(ValidationError::DuplicateFilter(filter.name.clone()));
        }
        match filter.name.as_str() {
            "rate_limit" => {
                if filter.requests_per_second == 0 {
                    errors.push(ValidationError::TooSmall { field: "rate_limit.requests_per_second", min: 0 });
                }
                if filter.burst == 0 {
                    errors.push(ValidationError::TooSmall { field: "rate_limit.burst", min: 0 });
                }
            }
            "buffer" if filter.max_request_bytes == 0 => {
                errors.push(ValidationError::TooSmall { field: "buffer.max_request_bytes", min: 0 });
            }
            _ => {}
        }
    }

    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }
    if config.shutdown.drain_timeout_secs == 0 {
        errors.push(ValidationError::TooSmall { field: "shutdown.drain_timeout_secs", min: 0 });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::FilterConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&MeshConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_problem() {
        let mut config = MeshConfig::default();
        config.listener.bind_address = "not-an-address".to_string();
        config.listener.max_connections = 0;
        config.stream.max_concurrent_streams = 0;
        config.shutdown.drain_timeout_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(matches!(errors[0], ValidationError::InvalidAddress { .. }));
    }

    #[test]
    fn rejects_bad_filter_chain() {
        let mut config = MeshConfig::default();
        let mut rate_limit = FilterConfig::named("rate_limit");
        rate_limit.burst = 0;
        config.filters = vec![
            FilterConfig::named("request_id"),
            FilterConfig::named("request_id"),
            FilterConfig::named("gzip"),
            rate_limit,
        ];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateFilter("request_id".to_string()),
                ValidationError::UnknownFilter("gzip".to_string()),
                ValidationError::TooSmall { field: "rate_limit.burst", min: 0 },
            ]
        );
    }

    #[test]
    fn tiny_write_buffer_is_rejected() {
        let mut config = MeshConfig::default();
        config.listener.per_conn_buffer_limit_bytes = 1;
        assert!(validate_config(&config).is_err());
    }
}
