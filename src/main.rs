//! # Helm daemon
//!
//! A local multiplex daemon: many AI-assistant clients connect over the
//! local socket, one browser-side agent connects, and the daemon routes
//! each client's commands to that agent while keeping every client's
//! browser window isolated from the others.
//!
//! ## Modules
//!
//! - [`protocol`] — wire message types (JSON-serialized)
//! - [`registry`] — session bookkeeping, tab routing, window cache
//! - [`router`]   — the single agent connection and request correlation
//! - [`transport`] — WebSocket upgrade and per-connection message loops
//! - [`daemon`]   — ties the above together plus background tasks
//! - [`config`]   — environment-derived runtime configuration
//! - [`error`]    — internal error types and their wire-code mapping
//! - [`pidfile`]  — single-instance guard

mod config;
mod daemon;
mod error;
mod pidfile;
mod protocol;
mod registry;
mod router;
mod transport;

use daemon::Daemon;

/// Daemon entry point.
///
/// Initializes structured logging, builds the configuration from the
/// environment, and serves until interrupted.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "helm_daemon=info".into()),
        )
        .init();

    let config = config::Config::from_env();
    let daemon = Daemon::new(config);

    if let Err(err) = daemon.serve().await {
        tracing::error!(%err, "helm daemon exited with an error");
        std::process::exit(1);
    }
}
