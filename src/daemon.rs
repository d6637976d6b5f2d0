//! Top-level daemon: owns the registry and router, and the background
//! tasks that drive them (the stale-session sweeper and the agent ping
//! ticker), plus the axum app and listener.

use crate::config::{Config, PROTOCOL_VERSION};
use crate::error::{DaemonError, DispatchError};
use crate::pidfile::PidFile;
use crate::protocol::WelcomePayload;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::transport;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

/// Shared daemon state, cheap to clone (everything inside is an `Arc`),
/// handed to axum as router state the way the teacher hands it `AppState`.
#[derive(Clone)]
pub struct Daemon {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<Router>,
    pub config: Arc<Config>,
    pub server_id: Arc<String>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            router: Arc::new(Router::new()),
            config: Arc::new(config),
            server_id: Arc::new(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn welcome_payload(&self) -> WelcomePayload {
        WelcomePayload {
            server_id: (*self.server_id).clone(),
            protocol_version: PROTOCOL_VERSION,
            sessions: self.registry.snapshot(),
        }
    }

    /// Fully tears a session down: rejects any commands still in flight for
    /// it, best-effort closes its window on the agent side, removes it from
    /// the registry (purging tab routes and window cache membership), and
    /// re-broadcasts the session snapshot. Shared by the explicit
    /// `unregister` path, the sweeper, and client-connection-close cleanup.
    pub async fn teardown_session(&self, session_id: &str) {
        self.router
            .reject_all_for_session(&self.registry, session_id, DispatchError::client_disconnected())
            .await;

        // Fire the close before removing the session from the registry:
        // once removed, a deferred close would have nothing to look up.
        if let Some(session) = self.registry.get(session_id) {
            if let Some(window_id) = session.window_id {
                self.router.fire_close_window(session_id, window_id).await;
            }
        }

        self.registry.remove_session(session_id);
        self.router.broadcast_sessions(&self.registry).await;
    }

    /// Runs the background sweeper that unregisters sessions which have gone
    /// quiet for longer than `keepalive_timeout`.
    async fn run_sweeper(self) {
        let mut interval = tokio::time::interval(self.config.keepalive_timeout / 2);
        loop {
            interval.tick().await;
            let stale = self.registry.stale_session_ids(self.config.keepalive_timeout);
            for session_id in stale {
                tracing::info!(session_id, "sweeping stale session");
                self.teardown_session(&session_id).await;
            }
        }
    }

    /// Runs the periodic agent keepalive ping. A no-op tick whenever no
    /// agent is currently bound.
    async fn run_ping_ticker(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        loop {
            interval.tick().await;
            self.router.ping_agent().await;
        }
    }

    /// Builds the axum app: the dual-role `/ws` upgrade route and the
    /// health snapshot endpoint.
    pub fn build_app(self) -> axum::Router {
        axum::Router::new()
            .route("/ws", get(transport::ws_handler))
            .route("/health", get(transport::health_handler))
            .layer(CorsLayer::permissive())
            .with_state(self)
    }

    /// Acquires the pidfile, binds the listener, starts the background
    /// tasks, and serves until ctrl-c, releasing the pidfile on the way out.
    pub async fn serve(self) -> Result<(), DaemonError> {
        let pidfile = PidFile::acquire(&self.config.pidfile_path, self.config.port)?;

        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| DaemonError::Bind(addr, e))?;

        tracing::info!(%addr, "helm daemon listening");

        tokio::spawn(self.clone().run_sweeper());
        tokio::spawn(self.clone().run_ping_ticker());

        let app = self.build_app();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.router.shutdown_all().await;
        pidfile.release();
        tracing::info!("helm daemon shut down cleanly");
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn teardown_session_removes_registration() {
        let daemon = Daemon::new(Config::default());
        daemon
            .registry
            .register("s1".into(), "l".into(), mpsc::unbounded_channel().0);
        daemon.teardown_session("s1").await;
        assert!(!daemon.registry.contains("s1"));
    }

    #[tokio::test]
    async fn welcome_payload_reflects_current_snapshot() {
        let daemon = Daemon::new(Config::default());
        daemon
            .registry
            .register("s1".into(), "l".into(), mpsc::unbounded_channel().0);
        let welcome = daemon.welcome_payload();
        assert_eq!(welcome.sessions.len(), 1);
        assert_eq!(welcome.protocol_version, PROTOCOL_VERSION);
    }
}
