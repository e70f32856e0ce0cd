//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers config reload, not shutdown

/// What the daemon should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
}

/// Wait for the next signal of interest.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let signal = tokio::select! {
        _ = terminate.recv() => Signal::Shutdown,
        _ = interrupt.recv() => Signal::Shutdown,
        _ = hangup.recv() => Signal::Reload,
    };
    tracing::info!(signal = ?signal, "Signal received");
    Ok(signal)
}

/// Wait for the next signal of interest.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(signal = ?Signal::Shutdown, "Signal received");
    Ok(Signal::Shutdown)
}
