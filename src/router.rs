//! The router: owns the single browser-agent connection and every
//! in-flight request's correlation state.
//!
//! The agent slot and the pending-request table live under one
//! `tokio::sync::Mutex` (`RouterCore`) so that binding a new agent,
//! unbinding the current one, and fan-out-rejecting every outstanding
//! request can all happen as one atomic step — no `Dispatch` can observe a
//! half-torn-down agent connection. No lock is held across an `.await` on a
//! reply; only the bookkeeping around it is synchronized.

use crate::config::Config;
use crate::error::DispatchError;
use crate::protocol::{DaemonToAgentMessage, RoutePayload, SessionSelectedPayload, SessionsPayload};
use crate::registry::SessionRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// The currently bound agent connection's outbound handle and identity.
#[derive(Clone)]
pub struct AgentHandle {
    pub tx: mpsc::UnboundedSender<DaemonToAgentMessage>,
    pub profile_id: String,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

struct PendingRequest {
    session_id: String,
    resolver: oneshot::Sender<Result<serde_json::Value, DispatchError>>,
}

struct RouterCore {
    agent: Option<AgentHandle>,
    pending: HashMap<String, PendingRequest>,
    counter: u64,
}

/// Returned when a second agent tries to attach while one is already bound.
/// The daemon treats this as a connection to refuse, not a wire error on an
/// existing one.
#[derive(Debug)]
pub struct DuplicateAgent;

pub struct Router {
    core: Mutex<RouterCore>,
    agent_watch: watch::Sender<bool>,
    boot_nonce: String,
}

impl Router {
    pub fn new() -> Self {
        let (agent_watch, _rx) = watch::channel(false);
        Self {
            core: Mutex::new(RouterCore {
                agent: None,
                pending: HashMap::new(),
                counter: 0,
            }),
            agent_watch,
            boot_nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    async fn current_agent(&self) -> Option<AgentHandle> {
        self.core.lock().await.agent.clone()
    }

    pub async fn is_agent_bound(&self) -> bool {
        self.core.lock().await.agent.is_some()
    }

    /// Binds a new agent connection. Clears every session's windowId and the
    /// tab-routing table first, since no windowId minted by a previous agent
    /// connection can be trusted once that connection is gone.
    pub async fn bind_agent(
        &self,
        registry: &SessionRegistry,
        tx: mpsc::UnboundedSender<DaemonToAgentMessage>,
        profile_id: String,
        capabilities: Vec<String>,
    ) -> Result<(), DuplicateAgent> {
        let mut core = self.core.lock().await;
        if core.agent.is_some() {
            return Err(DuplicateAgent);
        }
        registry.clear_all_window_ids();
        core.agent = Some(AgentHandle {
            tx,
            profile_id,
            capabilities,
            connected_at: Utc::now(),
        });
        drop(core);
        let _ = self.agent_watch.send(true);
        Ok(())
    }

    /// Tears down the current agent connection: every pending request is
    /// rejected with `AGENT_DISCONNECTED`, then windowIds and tab routes are
    /// cleared. A no-op if no agent is currently bound.
    ///
    /// The rejection sends happen while `core` is still held, not after it's
    /// dropped: `bind_agent` takes the same lock before it checks
    /// `core.agent.is_some()`, so a `hello` racing in concurrently blocks
    /// until every pending request here has been rejected. That's what makes
    /// "reject all pending, then allow a new agent to bind" atomic rather
    /// than just sequential.
    pub async fn unbind_agent(&self, registry: &SessionRegistry) {
        let mut core = self.core.lock().await;
        if core.agent.is_none() {
            return;
        }
        core.agent = None;
        let pending = std::mem::take(&mut core.pending);
        for (req_id, p) in pending {
            registry.remove_pending(&p.session_id, &req_id);
            let _ = p.resolver.send(Err(DispatchError::agent_disconnected()));
        }
        drop(core);
        let _ = self.agent_watch.send(false);
        registry.clear_all_window_ids();
    }

    async fn wait_for_agent(&self, timeout: Duration) -> Option<AgentHandle> {
        if let Some(h) = self.current_agent().await {
            return Some(h);
        }
        let mut rx = self.agent_watch.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    if *rx.borrow() {
                        if let Some(h) = self.current_agent().await {
                            return Some(h);
                        }
                    }
                }
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Routes a client command to the agent, lazily creating a window for
    /// the session if one isn't cached yet, and waits for the correlated
    /// reply (or a timeout).
    pub async fn dispatch(
        &self,
        registry: &SessionRegistry,
        session_id: String,
        command: String,
        params: serde_json::Value,
        cfg: &Config,
    ) -> Result<serde_json::Value, DispatchError> {
        if !registry.contains(&session_id) {
            return Err(DispatchError::session_not_found(&session_id));
        }

        let agent = self
            .wait_for_agent(cfg.agent_connect_timeout)
            .await
            .ok_or_else(DispatchError::agent_not_connected)?;

        if !registry.window_cache_contains(&session_id) {
            self.ensure_window_once(registry, &agent, &session_id, cfg).await?;
        }

        self.send_and_await(registry, &agent, session_id, command, params, cfg.request_timeout)
            .await
    }

    /// Ensures exactly one `create_window` round-trip is in flight per
    /// session at a time. Concurrent callers for the same uninitialized
    /// session serialize here instead of each issuing their own
    /// `create_window`: the first to win [`SessionRegistry::try_begin_window_creation`]
    /// performs it, the rest wait on its completion and then recheck the
    /// window cache (retrying as the creator themselves if it failed).
    async fn ensure_window_once(
        &self,
        registry: &SessionRegistry,
        agent: &AgentHandle,
        session_id: &str,
        cfg: &Config,
    ) -> Result<(), DispatchError> {
        loop {
            if registry.window_cache_contains(session_id) {
                return Ok(());
            }
            match registry.try_begin_window_creation(session_id) {
                Ok(()) => {
                    let result = self.ensure_window(registry, agent, session_id, cfg).await;
                    registry.finish_window_creation(session_id);
                    return result;
                }
                Err(notify) => {
                    let _ = tokio::time::timeout(cfg.request_timeout, notify.notified()).await;
                }
            }
        }
    }

    async fn ensure_window(
        &self,
        registry: &SessionRegistry,
        agent: &AgentHandle,
        session_id: &str,
        cfg: &Config,
    ) -> Result<(), DispatchError> {
        let result = self
            .send_and_await(
                registry,
                agent,
                session_id.to_string(),
                "create_window".to_string(),
                serde_json::json!({ "sessionId": session_id }),
                cfg.request_timeout,
            )
            .await
            .map_err(|e| DispatchError::window_creation_failed(e.message))?;

        let window_id = result
            .get("windowId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DispatchError::window_creation_failed("agent reply missing windowId"))?;

        registry.set_window_id(session_id, window_id);
        self.broadcast_sessions(registry).await;
        Ok(())
    }

    async fn send_and_await(
        &self,
        registry: &SessionRegistry,
        agent: &AgentHandle,
        session_id: String,
        command: String,
        mut params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchError> {
        if let serde_json::Value::Object(map) = &mut params {
            map.insert("sessionId".to_string(), serde_json::Value::String(session_id.clone()));
        }
        let (resolver, receiver) = oneshot::channel();
        let req_id = {
            let mut core = self.core.lock().await;
            match &core.agent {
                Some(current) if current.tx.same_channel(&agent.tx) => {}
                _ => return Err(DispatchError::agent_disconnected()),
            }
            let id = format!("{}-{}", self.boot_nonce, core.counter);
            core.counter += 1;
            core.pending.insert(
                id.clone(),
                PendingRequest {
                    session_id: session_id.clone(),
                    resolver,
                },
            );
            id
        };
        registry.add_pending(&session_id, &req_id);

        let message = DaemonToAgentMessage::Route {
            req_id: req_id.clone(),
            session_id: session_id.clone(),
            payload: RoutePayload { command, params },
        };
        if agent.tx.send(message).is_err() {
            self.drop_pending(&req_id).await;
            registry.remove_pending(&session_id, &req_id);
            return Err(DispatchError::agent_disconnected());
        }

        let outcome = tokio::time::timeout(timeout, receiver).await;
        registry.remove_pending(&session_id, &req_id);
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::agent_disconnected()),
            Err(_) => {
                self.drop_pending(&req_id).await;
                Err(DispatchError::request_timeout())
            }
        }
    }

    async fn drop_pending(&self, req_id: &str) {
        self.core.lock().await.pending.remove(req_id);
    }

    /// Correlates a `route_result`/`error` reply from the agent back to its
    /// waiting `Dispatch` call. An unknown or already-resolved reqId is
    /// dropped silently.
    pub async fn correlate_reply(&self, req_id: &str, result: Result<serde_json::Value, DispatchError>) {
        let pending = self.core.lock().await.pending.remove(req_id);
        if let Some(p) = pending {
            let _ = p.resolver.send(result);
        }
    }

    /// Rejects every request currently outstanding for a session, e.g. when
    /// the client itself disconnects mid-flight.
    pub async fn reject_all_for_session(&self, registry: &SessionRegistry, session_id: &str, error: DispatchError) {
        let req_ids = registry.take_pending(session_id);
        if req_ids.is_empty() {
            return;
        }
        let mut core = self.core.lock().await;
        for req_id in req_ids {
            if let Some(p) = core.pending.remove(&req_id) {
                let _ = p.resolver.send(Err(error.clone()));
            }
        }
    }

    /// Sends `close_window` without registering a pending entry or waiting
    /// for a reply — the session is being torn down regardless of whether
    /// the agent actually closes the window, or even whether one is
    /// connected at all. Any `route_result`/`error` the agent sends back for
    /// this reqId is simply dropped by `correlate_reply` as unrecognized.
    pub async fn fire_close_window(&self, session_id: &str, window_id: i64) {
        if let Some(agent) = self.current_agent().await {
            let message = DaemonToAgentMessage::Route {
                req_id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                payload: RoutePayload {
                    command: "close_window".to_string(),
                    params: serde_json::json!({ "windowId": window_id }),
                },
            };
            let _ = agent.tx.send(message);
        }
    }

    pub async fn broadcast_sessions(&self, registry: &SessionRegistry) {
        if let Some(agent) = self.current_agent().await {
            let payload = SessionsPayload {
                sessions: registry.snapshot(),
                tab_routing: registry.tab_routing_snapshot(),
            };
            let _ = agent.tx.send(DaemonToAgentMessage::Sessions { payload });
        }
    }

    /// Sends a keepalive ping to the agent, if one is bound. Ping failures
    /// don't by themselves close the connection; the next read failure will.
    pub async fn ping_agent(&self) {
        if let Some(agent) = self.current_agent().await {
            let _ = agent.tx.send(DaemonToAgentMessage::Ping {});
        }
    }

    /// Rejects every outstanding request, regardless of session, as part of
    /// daemon shutdown. Connections are closed separately by the listener's
    /// graceful-shutdown path; this only guarantees no `Dispatch` caller is
    /// left waiting forever.
    pub async fn shutdown_all(&self) {
        let pending = {
            let mut core = self.core.lock().await;
            core.agent = None;
            std::mem::take(&mut core.pending)
        };
        let _ = self.agent_watch.send(false);
        for (_, p) in pending {
            let _ = p.resolver.send(Err(DispatchError::agent_disconnected()));
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
