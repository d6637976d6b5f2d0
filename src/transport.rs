//! WebSocket transport: upgrades, first-message role inference, and the
//! per-connection read/write loops.
//!
//! Generalizes the teacher's single `/ws` route (which infers agent vs.
//! controller from the first `WsMessage` it reads) to infer client vs.
//! agent from the first inbound message's `"type"`. Each connection gets its
//! own outbound `mpsc` queue drained by a dedicated writer task, exactly as
//! the teacher's `handle_connection` does, so concurrent sends from
//! multiple spawned command handlers never interleave partial JSON frames.

use crate::daemon::Daemon;
use crate::error::DispatchError;
use crate::protocol::{
    AgentMessage, ClientMessage, DaemonToAgentMessage, DaemonToClientMessage, ErrorCode, HelloPayload,
    SessionSelectedPayload, WelcomePayload,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

pub async fn ws_handler(State(daemon): State<Daemon>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, daemon))
}

async fn handle_connection(socket: WebSocket, daemon: Daemon) {
    let (mut sink, mut stream) = socket.split();

    let first_text = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(?err, "websocket read error before first message");
                return;
            }
        }
    };

    let Ok(first_value) = serde_json::from_str::<serde_json::Value>(&first_text) else {
        close_with_protocol_error(&mut sink).await;
        return;
    };

    match first_value.get("type").and_then(|v| v.as_str()) {
        Some("hello") => handle_agent_connection(sink, stream, daemon, first_value).await,
        Some("register") | Some("unregister") | Some("command") | Some("keepalive") => {
            handle_client_connection(sink, stream, daemon, first_value).await
        }
        _ => close_with_protocol_error(&mut sink).await,
    }
}

async fn close_with_protocol_error<S>(sink: &mut S)
where
    S: futures::Sink<Message> + Unpin,
{
    let _ = sink
        .send(Message::Text(
            serde_json::to_string(&DaemonToClientMessage::Error {
                req_id: None,
                session_id: None,
                code: ErrorCode::ProtocolError,
                message: "first message must be a recognized hello/register/command/keepalive/unregister".into(),
            })
            .unwrap_or_default()
            .into(),
        ))
        .await;
    let _ = sink.send(Message::Close(None)).await;
}

// ─── Agent connections ───────────────────────────────────────────

async fn handle_agent_connection(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut stream: futures::stream::SplitStream<WebSocket>,
    daemon: Daemon,
    first_value: serde_json::Value,
) {
    let hello: AgentMessage = match serde_json::from_value(first_value) {
        Ok(msg @ AgentMessage::Hello { .. }) => msg,
        _ => {
            close_with_protocol_error(&mut sink).await;
            return;
        }
    };
    let HelloPayload { profile_id, capabilities } = match hello {
        AgentMessage::Hello { payload } => payload,
        _ => unreachable!(),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<DaemonToAgentMessage>();
    if daemon
        .router
        .bind_agent(&daemon.registry, tx.clone(), profile_id.clone(), capabilities)
        .await
        .is_err()
    {
        tracing::warn!(profile_id, "rejecting agent connection: one is already bound");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: 4000,
                reason: "agent already connected".into(),
            })))
            .await;
        return;
    }
    tracing::info!(profile_id, "agent connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let welcome = WelcomePayload {
        server_id: (*daemon.server_id).clone(),
        protocol_version: crate::config::PROTOCOL_VERSION,
        sessions: daemon.registry.snapshot(),
    };
    let _ = tx.send(DaemonToAgentMessage::Welcome { payload: welcome });
    daemon.router.broadcast_sessions(&daemon.registry).await;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(?err, "agent websocket read error");
                break;
            }
        };
        let Ok(msg) = serde_json::from_str::<AgentMessage>(&text) else {
            tracing::debug!(%text, "unparseable agent message, ignoring");
            continue;
        };
        handle_agent_message(&daemon, &tx, msg).await;
    }

    tracing::info!(profile_id, "agent disconnected");
    daemon.router.unbind_agent(&daemon.registry).await;
    writer.abort();
}

async fn handle_agent_message(daemon: &Daemon, agent_tx: &mpsc::UnboundedSender<DaemonToAgentMessage>, msg: AgentMessage) {
    match msg {
        AgentMessage::Hello { .. } => {
            tracing::debug!("ignoring duplicate hello on an already-bound agent connection");
        }
        AgentMessage::RouteResult { req_id, payload, .. } => {
            daemon.router.correlate_reply(&req_id, Ok(payload)).await;
        }
        AgentMessage::Error { req_id, payload } => {
            if let Some(req_id) = req_id {
                let err = DispatchError::command_failed(payload.message);
                daemon.router.correlate_reply(&req_id, Err(err)).await;
            } else {
                tracing::warn!(message = %payload.message, "agent reported an error with no reqId");
            }
        }
        AgentMessage::Keepalive {} => {}
        AgentMessage::TabClosed { tab_id, payload } => {
            if let Some(tab_id) = AgentMessage::resolved_tab_id(&tab_id, &payload) {
                daemon.registry.remove_tab_route_by_tab(&tab_id);
            }
        }
        AgentMessage::WindowClosed { payload } => {
            daemon.registry.clear_window_for_session(&payload.session_id);
            daemon.router.broadcast_sessions(&daemon.registry).await;
        }
        AgentMessage::SelectTab { req_id, payload } => {
            let success = daemon.registry.contains(&payload.session_id);
            if success {
                daemon.registry.add_tab_route(payload.tab_id.clone(), payload.session_id.clone());
            }
            let _ = agent_tx.send(DaemonToAgentMessage::SessionSelected {
                req_id,
                payload: SessionSelectedPayload {
                    tab_id: payload.tab_id,
                    session_id: payload.session_id,
                    success,
                },
            });
            if success {
                daemon.router.broadcast_sessions(&daemon.registry).await;
            }
        }
    }
}

// ─── Client connections ──────────────────────────────────────────

async fn handle_client_connection(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut stream: futures::stream::SplitStream<WebSocket>,
    daemon: Daemon,
    first_value: serde_json::Value,
) {
    let first_msg: ClientMessage = match serde_json::from_value(first_value) {
        Ok(msg) => msg,
        Err(_) => {
            close_with_protocol_error(&mut sink).await;
            return;
        }
    };
    let session_id = first_msg.session_id().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<DaemonToClientMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    handle_client_message(&daemon, &tx, first_msg).await;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(?err, "client websocket read error");
                break;
            }
        };
        daemon.registry.mark_last_seen(&session_id);
        let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) else {
            let _ = tx.send(DaemonToClientMessage::Error {
                req_id: None,
                session_id: Some(session_id.clone()),
                code: ErrorCode::ProtocolError,
                message: "unrecognized message".into(),
            });
            continue;
        };
        // Spawn per command so a slow Dispatch never blocks this connection
        // from draining subsequent frames (replies may then complete out of
        // the order their commands were issued in).
        let daemon = daemon.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            handle_client_message(&daemon, &tx, msg).await;
        });
    }

    tracing::info!(session_id, "client connection closed");
    daemon.teardown_session(&session_id).await;
    writer.abort();
}

async fn handle_client_message(daemon: &Daemon, tx: &mpsc::UnboundedSender<DaemonToClientMessage>, msg: ClientMessage) {
    match msg {
        ClientMessage::Register { session_id, label } => {
            daemon.registry.register(session_id.clone(), label, tx.clone());
            let _ = tx.send(DaemonToClientMessage::Registered {
                session_id,
                success: true,
                error: None,
            });
            daemon.router.broadcast_sessions(&daemon.registry).await;
        }
        ClientMessage::Unregister { session_id } => {
            daemon.teardown_session(&session_id).await;
        }
        ClientMessage::Keepalive { session_id } => {
            daemon.registry.mark_last_seen(&session_id);
            let _ = tx.send(DaemonToClientMessage::Status {
                agent_connected: daemon.router.is_agent_bound().await,
                session_count: daemon.registry.len(),
            });
        }
        ClientMessage::Command { req_id, session_id, command, params } => {
            let result = daemon
                .router
                .dispatch(&daemon.registry, session_id.clone(), command, params, &daemon.config)
                .await;
            match result {
                Ok(payload) => {
                    let _ = tx.send(DaemonToClientMessage::Response {
                        req_id,
                        session_id,
                        payload,
                    });
                }
                Err(err) => {
                    let _ = tx.send(DaemonToClientMessage::Error {
                        req_id: Some(req_id),
                        session_id: Some(session_id),
                        code: err.code,
                        message: err.message,
                    });
                }
            }
        }
    }
}

// ─── Health endpoint ──────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    agent_connected: bool,
    client_count: usize,
    sessions: Vec<crate::protocol::SessionSnapshot>,
}

pub async fn health_handler(State(daemon): State<Daemon>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok",
        agent_connected: daemon.router.is_agent_bound().await,
        client_count: daemon.registry.len(),
        sessions: daemon.registry.snapshot(),
    };
    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes_camel_case() {
        let resp = HealthResponse {
            status: "ok",
            agent_connected: true,
            client_count: 2,
            sessions: vec![],
        };
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("\"agentConnected\":true"));
        assert!(text.contains("\"clientCount\":2"));
    }

    #[tokio::test]
    async fn select_tab_for_known_session_acks_success_and_adds_route() {
        let daemon = Daemon::new(crate::config::Config::default());
        daemon
            .registry
            .register("s1".into(), "l".into(), mpsc::unbounded_channel().0);
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        handle_agent_message(
            &daemon,
            &agent_tx,
            AgentMessage::SelectTab {
                req_id: "r1".into(),
                payload: crate::protocol::SelectTabPayload {
                    tab_id: "t1".into(),
                    session_id: "s1".into(),
                },
            },
        )
        .await;

        assert_eq!(daemon.registry.resolve_tab_route("t1"), Some("s1".to_string()));
        match agent_rx.recv().await.expect("ack sent") {
            DaemonToAgentMessage::SessionSelected { req_id, payload } => {
                assert_eq!(req_id, "r1");
                assert!(payload.success);
            }
            other => panic!("expected session_selected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn select_tab_for_unknown_session_acks_failure_without_adding_route() {
        let daemon = Daemon::new(crate::config::Config::default());
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();

        handle_agent_message(
            &daemon,
            &agent_tx,
            AgentMessage::SelectTab {
                req_id: "r2".into(),
                payload: crate::protocol::SelectTabPayload {
                    tab_id: "t2".into(),
                    session_id: "ghost".into(),
                },
            },
        )
        .await;

        assert!(daemon.registry.resolve_tab_route("t2").is_none());
        match agent_rx.recv().await.expect("ack sent") {
            DaemonToAgentMessage::SessionSelected { payload, .. } => assert!(!payload.success),
            other => panic!("expected session_selected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keepalive_replies_with_status_push() {
        let daemon = Daemon::new(crate::config::Config::default());
        daemon
            .registry
            .register("s1".into(), "l".into(), mpsc::unbounded_channel().0);
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_client_message(&daemon, &tx, ClientMessage::Keepalive { session_id: "s1".into() }).await;

        match rx.recv().await.expect("status sent") {
            DaemonToClientMessage::Status { agent_connected, session_count } => {
                assert!(!agent_connected);
                assert_eq!(session_count, 1);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }
}
