//! Runtime configuration, read from the environment with sane defaults.
//!
//! Generalizes the teacher's scattered `std::env::var` reads in `main.rs`
//! into a single constructor, the way the oddjobs daemon's
//! `Config::load()` centralizes lifecycle configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 9876;

/// Wire protocol version advertised in `welcome`. Mismatches are logged but
/// never rejected — see the pidfile's advisory version handling.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub pidfile_path: PathBuf,
    /// How long a client session may go without a keepalive before the
    /// sweeper reaps it.
    pub keepalive_timeout: Duration,
    /// How long `Dispatch` waits for an agent to be connected before failing
    /// with `AGENT_NOT_CONNECTED`.
    pub agent_connect_timeout: Duration,
    /// How long `Dispatch` waits for a `route_result`/`error` reply before
    /// failing with `REQUEST_TIMEOUT`.
    pub request_timeout: Duration,
    /// Interval between agent keepalive pings.
    pub ping_interval: Duration,
}

impl Config {
    /// Builds configuration from the environment, falling back to the
    /// defaults spec'd for this daemon. `BROWSER_MCP_PORT` mirrors the
    /// teacher's single configurable port; the timeouts are not currently
    /// environment-tunable since no external caller has asked for that.
    pub fn from_env() -> Self {
        let port = std::env::var("BROWSER_MCP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let pidfile_path = std::env::var("HELM_PIDFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_pidfile_path());

        Self {
            port,
            pidfile_path,
            keepalive_timeout: Duration::from_secs(60),
            agent_connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
        }
    }
}

fn default_pidfile_path() -> PathBuf {
    std::env::temp_dir().join("helm-daemon.pid.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            pidfile_path: default_pidfile_path(),
            keepalive_timeout: Duration::from_secs(60),
            agent_connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        std::env::remove_var("BROWSER_MCP_PORT");
        std::env::remove_var("HELM_PIDFILE");
        let cfg = Config::from_env();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.ping_interval, Duration::from_secs(25));
        assert_eq!(cfg.keepalive_timeout, Duration::from_secs(60));
        assert_eq!(cfg.agent_connect_timeout, Duration::from_secs(15));
    }
}
