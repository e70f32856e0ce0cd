//! mesh-stream daemon.
//!
//! Accepts framed stream connections, runs each stream through the
//! configured filter chain and answers with the echo application.
//!
//! ```text
//! config → logging → metrics → Listener::bind → StreamServer
//!     signals: SIGHUP / file change → ConfiguredChainFactory::reload
//!              SIGTERM / SIGINT     → stop accept → GoAway → drain
//! ```

use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mesh_stream::config::{load_config, reload_filters, ConfigWatcher, MeshConfig, ReloadTracker};
use mesh_stream::filter::ConfiguredChainFactory;
use mesh_stream::lifecycle::{wait_for_signal, Shutdown, Signal};
use mesh_stream::net::Listener;
use mesh_stream::observability::{logging, metrics};
use mesh_stream::server::{EchoApplication, StreamServer};

#[derive(Parser)]
#[command(name = "mesh-stream")]
#[command(about = "Stream layer daemon with filter chains", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Do not watch the configuration file for changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => MeshConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mesh-stream starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let factory = Arc::new(ConfiguredChainFactory::new(&config.filters));
    tracing::info!(
        filters = factory.len(),
        max_concurrent_streams = config.stream.max_concurrent_streams,
        "Configuration loaded"
    );

    let server = StreamServer::new(Arc::new(EchoApplication), factory.clone(), &config);
    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Arc::new(Shutdown::new());

    let accept = tokio::spawn(listener.start(server.clone(), shutdown.subscribe()));

    let tracker = Arc::new(Mutex::new(ReloadTracker::new(config.clone())));

    // The watcher handle must outlive the reload task.
    let _watcher = match (&cli.config, cli.no_watch) {
        (Some(path), false) => {
            let (watcher, mut updates) = ConfigWatcher::new(path, tracker.clone());
            let handle = watcher.run()?;
            let reload_factory = factory.clone();
            tokio::spawn(async move {
                while let Some(filters) = updates.recv().await {
                    reload_factory.reload(&filters);
                }
            });
            Some(handle)
        }
        _ => None,
    };

    loop {
        match wait_for_signal().await? {
            Signal::Reload => match &cli.config {
                Some(path) => match reload_filters(path, &tracker) {
                    Ok(Some(filters)) => factory.reload(&filters),
                    Ok(None) => tracing::info!("Filter chain unchanged"),
                    Err(e) => tracing::error!(error = %e, "Reload failed, keeping current filter chain"),
                },
                None => tracing::info!("No configuration file, nothing to reload"),
            },
            Signal::Shutdown => break,
        }
    }

    shutdown.trigger();
    if let Err(e) = accept.await {
        tracing::warn!(error = %e, "Accept loop ended abnormally");
    }

    server.go_away_all();
    let drain_timeout = Duration::from_secs(config.shutdown.drain_timeout_secs);
    tracing::info!(
        active_connections = server.active_connections(),
        drain_timeout_secs = config.shutdown.drain_timeout_secs,
        "Draining connections"
    );

    tokio::select! {
        drained = server.drain(drain_timeout) => {
            if !drained {
                tracing::warn!(active_connections = server.active_connections(), "Drain timed out");
            }
        }
        _ = wait_for_signal() => tracing::warn!("Second signal received, exiting without drain"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
