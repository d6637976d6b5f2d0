//! Pidfile-based single-instance guard.
//!
//! Shape grounded on the oddjobs daemon lifecycle module's lock-file
//! handling (`examples/other_examples/8a506428_*-lifecycle.rs.rs`):
//! open-if-absent, verify liveness, refuse-or-reclaim. Adapted here to the
//! JSON body (`{pid, port, startedAt}`) and liveness-only semantics this
//! daemon's spec calls for, rather than an `flock`-only guard.

use crate::error::DaemonError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PidFileBody {
    pid: u32,
    port: u16,
    started_at: DateTime<Utc>,
}

/// Holds the pidfile for the lifetime of the daemon process. Removed on
/// drop, so an ordinary process exit (graceful or panicking) always cleans
/// up; [`PidFile::release`] additionally removes it eagerly during an
/// orderly shutdown so a near-simultaneous restart never races the file's
/// existence against this process actually exiting.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquires the pidfile at `path`, reclaiming it if the pid it names is
    /// no longer alive.
    pub fn acquire(path: &Path, port: u16) -> Result<Self, DaemonError> {
        if let Some(existing) = read_body(path)? {
            if process_is_alive(existing.pid) {
                return Err(DaemonError::AlreadyRunning(existing.pid));
            }
            tracing::warn!(
                stale_pid = existing.pid,
                "removing stale pidfile left by a process that is no longer running"
            );
        }

        let body = PidFileBody {
            pid: std::process::id(),
            port,
            started_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&body).expect("pidfile body always serializes");
        fs::write(path, contents)?;

        Ok(Self { path: path.to_path_buf() })
    }

    /// Removes the pidfile immediately. Called on graceful shutdown.
    pub fn release(self) {
        let path = self.path.clone();
        std::mem::forget(self);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?err, path = %path.display(), "failed to remove pidfile on shutdown");
            }
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_body(path: &Path) -> Result<Option<PidFileBody>, DaemonError> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| DaemonError::InvalidPidfile {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DaemonError::Io(err)),
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op permission/existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // Conservative: assume alive so callers err on the side of refusing to
    // start a second instance rather than silently reclaiming on platforms
    // we have no liveness check for.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    #[test]
    fn acquire_writes_json_body_with_current_pid() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("helm-test-pidfile-{}.json", process::id()));
        let _ = fs::remove_file(&path);

        let pidfile = PidFile::acquire(&path, 9876).expect("first acquire succeeds");
        let body: PidFileBody = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(body.pid, process::id());
        assert_eq!(body.port, 9876);

        pidfile.release();
        assert!(!path.exists());
    }

    #[test]
    fn acquire_refuses_when_existing_pid_is_alive() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("helm-test-pidfile-live-{}.json", process::id()));
        let body = PidFileBody {
            pid: process::id(),
            port: 1234,
            started_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&body).unwrap()).unwrap();

        let result = PidFile::acquire(&path, 9876);
        assert!(matches!(result, Err(DaemonError::AlreadyRunning(p)) if p == process::id()));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn acquire_reclaims_when_existing_pid_is_dead() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("helm-test-pidfile-dead-{}.json", process::id()));
        // A pid far past any realistic pid_max so the liveness check always
        // reports it as dead, regardless of what's actually running.
        let body = PidFileBody {
            pid: 999_999_999,
            port: 1234,
            started_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&body).unwrap()).unwrap();

        let pidfile = PidFile::acquire(&path, 9876).expect("reclaims stale pidfile");
        pidfile.release();
        let _ = fs::remove_file(&path);
    }
}
