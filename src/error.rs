//! Internal error types and their mapping to stable wire [`ErrorCode`]s.

use crate::protocol::ErrorCode;
use std::net::SocketAddr;

/// A failure produced while dispatching a client command. Carries the wire
/// [`ErrorCode`] directly so the transport never has to re-derive it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn agent_not_connected() -> Self {
        Self::new(ErrorCode::AgentNotConnected, "no browser agent is currently connected")
    }

    pub fn window_creation_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::WindowCreationFailed, reason)
    }

    pub fn request_timeout() -> Self {
        Self::new(ErrorCode::RequestTimeout, "the agent did not reply in time")
    }

    pub fn agent_disconnected() -> Self {
        Self::new(ErrorCode::AgentDisconnected, "the browser agent disconnected")
    }

    pub fn client_disconnected() -> Self {
        Self::new(ErrorCode::ClientDisconnected, "the requesting client disconnected")
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(ErrorCode::SessionNotFound, format!("unknown session {session_id}"))
    }

    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, reason)
    }

    pub fn command_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandFailed, reason)
    }
}

/// Process-level failures: things that prevent the daemon from starting or
/// keep running at all. Distinct from [`DispatchError`], which is part of the
/// steady-state wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind listener on {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("invalid pidfile contents at {path}: {reason}")]
    InvalidPidfile { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_display_is_the_message() {
        let e = DispatchError::agent_not_connected();
        assert_eq!(e.code, ErrorCode::AgentNotConnected);
        assert_eq!(format!("{e}"), "no browser agent is currently connected");
    }

    #[test]
    fn session_not_found_includes_the_id() {
        let e = DispatchError::session_not_found("abc");
        assert!(e.message.contains("abc"));
    }
}
