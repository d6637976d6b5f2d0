//! Wire messages exchanged on the local socket.
//!
//! Two independent message families share the same listener: clients speak
//! [`ClientMessage`] / [`DaemonToClientMessage`], the single browser-side agent
//! speaks [`AgentMessage`] / [`DaemonToAgentMessage`]. Every message is a JSON
//! object carrying a `"type"` discriminant (internally tagged, as with the
//! teacher's `WsMessage`), with `camelCase` field names matching the wire
//! examples (`sessionId`, `reqId`, `windowId`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable error codes surfaced to clients. These never change shape once
/// published; callers match on them rather than parsing `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AgentNotConnected,
    WindowCreationFailed,
    RequestTimeout,
    AgentDisconnected,
    ClientDisconnected,
    SessionNotFound,
    ProtocolError,
    CommandFailed,
}

// ─── Client ↔ daemon ─────────────────────────────────────────────

/// Messages a client (an AI-assistant process) sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Announce a new session.
    Register { session_id: String, label: String },
    /// Tear a session down cleanly.
    Unregister { session_id: String },
    /// Invoke a browser operation.
    Command {
        req_id: String,
        session_id: String,
        command: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Liveness ping.
    Keepalive { session_id: String },
}

impl ClientMessage {
    /// The session this message concerns, used by the transport to bind a
    /// connection to a session identity before full dispatch.
    pub fn session_id(&self) -> &str {
        match self {
            ClientMessage::Register { session_id, .. }
            | ClientMessage::Unregister { session_id }
            | ClientMessage::Command { session_id, .. }
            | ClientMessage::Keepalive { session_id } => session_id,
        }
    }
}

/// Messages the daemon sends back to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonToClientMessage {
    /// Ack of `register`.
    Registered {
        session_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Successful result of a `command`.
    Response {
        req_id: String,
        session_id: String,
        payload: serde_json::Value,
    },
    /// Failure, correlated back to the originating `command` when possible.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
    /// Status push sent in reply to a client's `keepalive`.
    Status {
        agent_connected: bool,
        session_count: usize,
    },
}

// ─── Daemon ↔ agent ──────────────────────────────────────────────

/// Identity and capabilities the agent announces on `hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub profile_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Body of an agent-reported `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Nested form of `tab_closed`'s tab id, used when it arrives under `payload`
/// rather than at the top level. Both shapes are accepted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabClosedPayload {
    pub tab_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowClosedPayload {
    pub session_id: String,
}

/// Body of an agent-initiated manual tab-routing request: pin `tabId` to
/// `sessionId` in the registry's [`crate::registry::SessionRegistry`] tab
/// routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectTabPayload {
    pub tab_id: String,
    pub session_id: String,
}

/// Messages the agent sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    /// The agent attaches.
    Hello { payload: HelloPayload },
    /// Reply to a `route`.
    #[serde(rename = "route_result")]
    RouteResult {
        req_id: String,
        #[serde(default)]
        session_id: Option<String>,
        payload: serde_json::Value,
    },
    /// Reply failure for a `route`, or an out-of-band agent error.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        payload: AgentErrorPayload,
    },
    /// Agent-originated liveness ping.
    Keepalive {},
    /// A tab went away. Accepted whether `tabId` arrives at the top level or
    /// nested inside `payload`; see [`AgentMessage::resolved_tab_id`].
    #[serde(rename = "tab_closed")]
    TabClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<TabClosedPayload>,
    },
    /// A window went away.
    #[serde(rename = "window_closed")]
    WindowClosed { payload: WindowClosedPayload },
    /// The agent asks the daemon to pin a tab to a session for manual
    /// routing, acked with [`DaemonToAgentMessage::SessionSelected`].
    #[serde(rename = "select_tab")]
    SelectTab { req_id: String, payload: SelectTabPayload },
}

impl AgentMessage {
    /// Resolves a `tab_closed` message's tab id regardless of which shape it
    /// arrived in. Top-level wins if (implausibly) both are present.
    pub fn resolved_tab_id(tab_id: &Option<String>, payload: &Option<TabClosedPayload>) -> Option<String> {
        tab_id
            .clone()
            .or_else(|| payload.as_ref().map(|p| p.tab_id.clone()))
    }
}

/// One entry of the session snapshot broadcast to the agent and exposed over
/// the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub label: String,
    pub window_id: Option<i64>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub server_id: String,
    pub protocol_version: u32,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsPayload {
    pub sessions: Vec<SessionSnapshot>,
    pub tab_routing: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePayload {
    pub command: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSelectedPayload {
    pub tab_id: String,
    pub session_id: String,
    pub success: bool,
}

/// Messages the daemon sends to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DaemonToAgentMessage {
    /// Reply to `hello`.
    Welcome { payload: WelcomePayload },
    /// Sent whenever the session list, window bindings, or tab routes change.
    Sessions { payload: SessionsPayload },
    /// A forwarded client command.
    Route {
        req_id: String,
        session_id: String,
        payload: RoutePayload,
    },
    /// Keepalive ticker, independent of client activity.
    Ping {},
    /// Ack of a manual tab/session selection.
    #[serde(rename = "session_selected")]
    SessionSelected {
        req_id: String,
        payload: SessionSelectedPayload,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_command_round_trips_with_camel_case_fields() {
        let msg = ClientMessage::Command {
            req_id: "r1".into(),
            session_id: "s1".into(),
            command: "navigate".into(),
            params: serde_json::json!({"url": "https://example.com"}),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"command\""));
        assert!(text.contains("\"reqId\":\"r1\""));
        assert!(text.contains("\"sessionId\":\"s1\""));
        let back: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.session_id(), "s1");
    }

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let code = ErrorCode::AgentNotConnected;
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"AGENT_NOT_CONNECTED\"");
    }

    #[test]
    fn route_result_variant_uses_snake_case_type_tag() {
        let msg = AgentMessage::RouteResult {
            req_id: "r2".into(),
            session_id: Some("s1".into()),
            payload: serde_json::json!({"windowId": 42}),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"route_result\""));
    }

    #[test]
    fn tab_closed_accepts_top_level_tab_id() {
        let v = serde_json::json!({"type": "tab_closed", "tabId": "t1"});
        let msg: AgentMessage = serde_json::from_value(v).unwrap();
        match msg {
            AgentMessage::TabClosed { tab_id, payload } => {
                assert_eq!(AgentMessage::resolved_tab_id(&tab_id, &payload), Some("t1".to_string()));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tab_closed_accepts_nested_payload_tab_id() {
        let v = serde_json::json!({"type": "tab_closed", "payload": {"tabId": "t2"}});
        let msg: AgentMessage = serde_json::from_value(v).unwrap();
        match msg {
            AgentMessage::TabClosed { tab_id, payload } => {
                assert_eq!(AgentMessage::resolved_tab_id(&tab_id, &payload), Some("t2".to_string()));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn hello_parses_capabilities() {
        let v = serde_json::json!({
            "type": "hello",
            "payload": {"profileId": "p1", "capabilities": ["tabs", "screenshot"]}
        });
        let msg: AgentMessage = serde_json::from_value(v).unwrap();
        match msg {
            AgentMessage::Hello { payload } => {
                assert_eq!(payload.profile_id, "p1");
                assert_eq!(payload.capabilities, vec!["tabs", "screenshot"]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
