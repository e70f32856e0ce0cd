//! Watches the configuration file and publishes filter chain changes.
//!
//! Only `[[filters]]` apply without a restart. A file event that leaves the
//! filter list as it is (an editor writing twice, a touched file) publishes
//! nothing. Edits to the other sections are reported and wait for the next
//! start.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::{FilterConfig, MeshConfig};

/// The configuration the process runs with, as far as reloads can change it.
#[derive(Debug)]
pub struct ReloadTracker {
    running: MeshConfig,
}

impl ReloadTracker {
    pub fn new(running: MeshConfig) -> Self {
        Self { running }
    }

    pub fn filters(&self) -> &[FilterConfig] {
        &self.running.filters
    }

    /// Take in a freshly loaded config. Returns the new filter list when it
    /// differs from the running one.
    pub fn apply(&mut self, loaded: MeshConfig) -> Option<Vec<FilterConfig>> {
        let restart_only = [
            ("listener", self.running.listener != loaded.listener),
            ("stream", self.running.stream != loaded.stream),
            ("observability", self.running.observability != loaded.observability),
            ("shutdown", self.running.shutdown != loaded.shutdown),
        ];
        for (section, changed) in restart_only {
            if changed {
                tracing::warn!(section, "Section differs from the running config, restart to apply");
            }
        }

        if self.running.filters == loaded.filters {
            return None;
        }
        self.running.filters = loaded.filters;
        Some(self.running.filters.clone())
    }
}

/// Load `path` and apply it to `tracker`.
pub fn reload_filters(path: &Path, tracker: &Mutex<ReloadTracker>) -> Result<Option<Vec<FilterConfig>>, ConfigError> {
    let loaded = load_config(path)?;
    Ok(tracker.lock().apply(loaded))
}

/// Publishes changed filter lists from file events.
pub struct ConfigWatcher {
    path: PathBuf,
    tracker: Arc<Mutex<ReloadTracker>>,
    update_tx: mpsc::UnboundedSender<Vec<FilterConfig>>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver of changed filter lists.
    pub fn new(path: &Path, tracker: Arc<Mutex<ReloadTracker>>) -> (Self, mpsc::UnboundedReceiver<Vec<FilterConfig>>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                tracker,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, tracker, update_tx } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match reload_filters(&path, &tracker) {
                        Ok(Some(filters)) => {
                            tracing::info!(path = ?path, filters = filters.len(), "Filter chain changed on disk");
                            let _ = update_tx.send(filters);
                        }
                        Ok(None) => tracing::debug!(path = ?path, "Config event without filter changes"),
                        Err(e) => tracing::error!(error = %e, "Failed to reload config, keeping current filter chain"),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?watched, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;

    const BASE: &str = r#"
[listener]
bind_address = "127.0.0.1:10000"

[[filters]]
name = "request_id"
"#;

    #[test]
    fn unchanged_filters_publish_nothing() {
        let mut tracker = ReloadTracker::new(parse_config(BASE).unwrap());
        assert_eq!(tracker.apply(parse_config(BASE).unwrap()), None);
    }

    #[test]
    fn changed_filters_are_published_once() {
        let mut tracker = ReloadTracker::new(parse_config(BASE).unwrap());
        let edited = format!("{}\n[[filters]]\nname = \"rate_limit\"\nburst = 5\n", BASE);

        let filters = tracker.apply(parse_config(&edited).unwrap()).unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1].name, "rate_limit");
        assert_eq!(filters[1].burst, 5);

        // The editor's second write of the same content.
        assert_eq!(tracker.apply(parse_config(&edited).unwrap()), None);
        assert_eq!(tracker.filters().len(), 2);
    }

    #[test]
    fn listener_edit_alone_is_not_published() {
        let mut tracker = ReloadTracker::new(parse_config(BASE).unwrap());
        let moved = BASE.replace("127.0.0.1:10000", "127.0.0.1:10001");
        assert_eq!(tracker.apply(parse_config(&moved).unwrap()), None);
    }

    #[test]
    fn reload_error_keeps_running_filters() {
        let tracker = Mutex::new(ReloadTracker::new(parse_config(BASE).unwrap()));
        let missing = Path::new("/nonexistent/mesh-stream.toml");
        assert!(reload_filters(missing, &tracker).is_err());
        assert_eq!(tracker.lock().filters().len(), 1);
    }
}
