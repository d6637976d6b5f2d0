//! Session registry: the daemon's bookkeeping for connected clients,
//! window bindings, and manual tab routing.
//!
//! Built on `DashMap`/`DashSet` the way the teacher's `state.rs` holds its
//! `agents`/`connections`/`sessions` maps — concurrent, lock-free reads and
//! writes keyed by id, with no single giant mutex around the whole registry.

use crate::protocol::{DaemonToClientMessage, SessionSnapshot};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Outbound channel to a connected client's writer task.
pub type ClientTx = mpsc::UnboundedSender<DaemonToClientMessage>;

/// A single registered client session.
#[derive(Clone)]
pub struct ClientSession {
    pub session_id: String,
    pub label: String,
    pub tx: ClientTx,
    pub window_id: Option<i64>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl ClientSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            label: self.label.clone(),
            window_id: self.window_id,
            last_seen: self.last_seen_at,
            status: if self.window_id.is_some() { "ready".into() } else { "pending".into() },
        }
    }
}

/// Concurrent registry of client sessions, manual tab routes, and which
/// sessions already have a cached window. All three collections are kept
/// consistent by [`SessionRegistry::remove_session`], which is the single
/// place a session is ever fully torn down.
pub struct SessionRegistry {
    sessions: DashMap<String, ClientSession>,
    /// tabId → sessionId, populated by manual tab selection.
    tab_routes: DashMap<String, String>,
    /// Sessions for which the agent has already returned a windowId, so
    /// `Dispatch` can skip `create_window` on the common path.
    window_cache: DashSet<String>,
    /// reqIds currently outstanding per session, used to reject them all in
    /// O(k) when a session is torn down instead of scanning the router's
    /// whole pending table.
    pending_by_session: DashMap<String, Vec<String>>,
    /// Sessions for which a `create_window` round-trip is currently in
    /// flight. Guarantees at most one `create_window` per session is ever
    /// outstanding even when two `Dispatch` calls race on the same
    /// newly-registered session (each inbound client command runs on its own
    /// spawned task, so this race is reachable, not just theoretical).
    window_creation: DashMap<String, Arc<Notify>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            tab_routes: DashMap::new(),
            window_cache: DashSet::new(),
            pending_by_session: DashMap::new(),
            window_creation: DashMap::new(),
        }
    }

    /// Attempts to become the single creator of `session_id`'s window.
    /// Returns `Ok(())` if the caller won the race — it must call
    /// [`SessionRegistry::finish_window_creation`] when its `create_window`
    /// round-trip completes, success or not. Returns `Err(notify)` if
    /// another `Dispatch` call is already creating it; the caller should
    /// await `notify.notified()` and then recheck the window cache.
    pub fn try_begin_window_creation(&self, session_id: &str) -> Result<(), Arc<Notify>> {
        match self.window_creation.entry(session_id.to_string()) {
            Entry::Occupied(e) => Err(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(Arc::new(Notify::new()));
                Ok(())
            }
        }
    }

    /// Releases the in-flight marker for `session_id` and wakes every
    /// `Dispatch` call waiting on it.
    pub fn finish_window_creation(&self, session_id: &str) {
        if let Some((_, notify)) = self.window_creation.remove(session_id) {
            notify.notify_waiters();
        }
    }

    /// Registers a session, replacing any prior registration under the same
    /// id (a client re-registering after a reconnect is treated as fresh).
    pub fn register(&self, session_id: String, label: String, tx: ClientTx) {
        let now = Utc::now();
        self.sessions.insert(
            session_id.clone(),
            ClientSession {
                session_id,
                label,
                tx,
                window_id: None,
                registered_at: now,
                last_seen_at: now,
            },
        );
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<ClientSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Updates `lastSeenAt`. A no-op if the session is unknown (the inbound
    /// message is still processed normally; this just never revives a
    /// session the registry has already forgotten).
    pub fn mark_last_seen(&self, session_id: &str) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.last_seen_at = Utc::now();
        }
    }

    pub fn set_window_id(&self, session_id: &str, window_id: i64) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.window_id = Some(window_id);
        }
        self.window_cache.insert(session_id.to_string());
    }

    pub fn clear_window_for_session(&self, session_id: &str) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.window_id = None;
        }
        self.window_cache.remove(session_id);
    }

    pub fn window_cache_contains(&self, session_id: &str) -> bool {
        self.window_cache.contains(session_id)
    }

    /// Clears every session's `windowId`, empties the window cache, and
    /// empties the tab-routing table. Invoked whenever the agent connection
    /// is (re)created or torn down, so a stale windowId assigned by a
    /// previous agent connection can never be dispatched against.
    pub fn clear_all_window_ids(&self) {
        for mut entry in self.sessions.iter_mut() {
            entry.window_id = None;
        }
        self.window_cache.clear();
        self.tab_routes.clear();
    }

    pub fn add_tab_route(&self, tab_id: String, session_id: String) {
        self.tab_routes.insert(tab_id, session_id);
    }

    pub fn remove_tab_route_by_tab(&self, tab_id: &str) {
        self.tab_routes.remove(tab_id);
    }

    fn remove_tab_routes_for_session(&self, session_id: &str) {
        self.tab_routes.retain(|_, sid| sid != session_id);
    }

    pub fn tab_routing_snapshot(&self) -> HashMap<String, String> {
        self.tab_routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn resolve_tab_route(&self, tab_id: &str) -> Option<String> {
        self.tab_routes.get(tab_id).map(|v| v.clone())
    }

    pub fn add_pending(&self, session_id: &str, req_id: &str) {
        self.pending_by_session
            .entry(session_id.to_string())
            .or_default()
            .push(req_id.to_string());
    }

    pub fn remove_pending(&self, session_id: &str, req_id: &str) {
        if let Some(mut list) = self.pending_by_session.get_mut(session_id) {
            list.retain(|r| r != req_id);
        }
    }

    /// Removes and returns all reqIds outstanding for a session, so the
    /// caller can reject each of them in the router's pending table.
    pub fn take_pending(&self, session_id: &str) -> Vec<String> {
        self.pending_by_session
            .remove(session_id)
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    /// Fully removes a session: drops its registry entry, purges any tab
    /// routes pointing at it, and clears its window cache membership. Does
    /// NOT touch the router's pending table or send any `close_window` —
    /// callers (the daemon's teardown path) own that sequencing.
    pub fn remove_session(&self, session_id: &str) -> Option<ClientSession> {
        let removed = self.sessions.remove(session_id).map(|(_, s)| s);
        self.window_cache.remove(session_id);
        self.remove_tab_routes_for_session(session_id);
        removed
    }

    /// Sessions whose `lastSeenAt` is older than `timeout`, without removing
    /// them — the sweeper still routes through the full teardown path for
    /// each one so `close_window`/pending-rejection/broadcast all happen.
    pub fn stale_session_ids(&self, timeout: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        self.sessions
            .iter()
            .filter(|entry| entry.last_seen_at < cutoff)
            .map(|entry| entry.session_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|entry| entry.snapshot()).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedRegistry = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_tx() -> ClientTx {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn register_then_get_round_trips() {
        let reg = SessionRegistry::new();
        reg.register("s1".into(), "label".into(), dummy_tx());
        let s = reg.get("s1").expect("session present");
        assert_eq!(s.label, "label");
        assert!(s.window_id.is_none());
    }

    #[test]
    fn set_window_id_populates_cache() {
        let reg = SessionRegistry::new();
        reg.register("s1".into(), "l".into(), dummy_tx());
        assert!(!reg.window_cache_contains("s1"));
        reg.set_window_id("s1", 42);
        assert!(reg.window_cache_contains("s1"));
        assert_eq!(reg.get("s1").unwrap().window_id, Some(42));
    }

    #[test]
    fn clear_all_window_ids_empties_cache_and_routes() {
        let reg = SessionRegistry::new();
        reg.register("s1".into(), "l".into(), dummy_tx());
        reg.set_window_id("s1", 42);
        reg.add_tab_route("t1".into(), "s1".into());

        reg.clear_all_window_ids();

        assert!(!reg.window_cache_contains("s1"));
        assert_eq!(reg.get("s1").unwrap().window_id, None);
        assert!(reg.resolve_tab_route("t1").is_none());
    }

    #[test]
    fn remove_session_purges_tab_routes() {
        let reg = SessionRegistry::new();
        reg.register("s1".into(), "l".into(), dummy_tx());
        reg.add_tab_route("t1".into(), "s1".into());
        reg.set_window_id("s1", 1);

        let removed = reg.remove_session("s1");
        assert!(removed.is_some());
        assert!(reg.resolve_tab_route("t1").is_none());
        assert!(!reg.window_cache_contains("s1"));
        assert!(!reg.contains("s1"));
    }

    #[test]
    fn pending_tracking_round_trips() {
        let reg = SessionRegistry::new();
        reg.add_pending("s1", "r1");
        reg.add_pending("s1", "r2");
        reg.remove_pending("s1", "r1");
        let remaining = reg.take_pending("s1");
        assert_eq!(remaining, vec!["r2".to_string()]);
        assert!(reg.take_pending("s1").is_empty());
    }

    #[test]
    fn stale_sessions_are_detected_by_last_seen() {
        let reg = SessionRegistry::new();
        reg.register("s1".into(), "l".into(), dummy_tx());
        if let Some(mut s) = reg.sessions.get_mut("s1") {
            s.last_seen_at = Utc::now() - chrono::Duration::seconds(120);
        }
        let stale = reg.stale_session_ids(Duration::from_secs(60));
        assert_eq!(stale, vec!["s1".to_string()]);
    }
}
