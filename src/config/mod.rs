//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → MeshConfig (validated, immutable)
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → ReloadTracker keeps only a changed [[filters]] list
//!     → mpsc channel to the daemon
//!     → filter chain factory swaps its filter list
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only the filter chain is hot-reloadable; listener settings need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{FilterConfig, ListenerConfig, MeshConfig, ObservabilityConfig, ShutdownConfig, StreamConfig};
pub use validation::{validate_config, ValidationError};
pub use watcher::{reload_filters, ConfigWatcher, ReloadTracker};
