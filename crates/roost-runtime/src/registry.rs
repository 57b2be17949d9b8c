//! In-memory session registry.
//!
//! Pure bookkeeping: session id to live handle plus lifecycle metadata. No
//! I/O happens here and nothing fails; every mutation stamps the entry's
//! activity clock so stale sweeps can reason about age.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use roost_core::{ConnectionHandle, SessionId, SessionMeta, SessionStatus};

/// One registered session: metadata plus, once connected, the live handle
/// and the peer address the transport bound it to.
#[derive(Clone)]
pub struct SessionEntry {
    pub meta: SessionMeta,
    pub handle: Option<Arc<dyn ConnectionHandle>>,
    pub peer_address: Option<String>,
}

impl SessionEntry {
    fn new(meta: SessionMeta) -> Self {
        Self {
            meta,
            handle: None,
            peer_address: None,
        }
    }
}

/// Map of session id to [`SessionEntry`], shared across the orchestrator's
/// tasks behind a read/write lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Registers a session, replacing any previous entry. Callers own the
    /// teardown of a replaced entry's handle.
    pub fn insert(&self, session_id: SessionId, meta: SessionMeta) {
        self.sessions
            .write()
            .insert(session_id, SessionEntry::new(meta));
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionEntry> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Applies `f` to the entry and stamps its activity clock. Returns false
    /// when the session is not registered.
    pub fn update(&self, session_id: &SessionId, f: impl FnOnce(&mut SessionEntry)) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(entry) => {
                f(entry);
                entry.meta.touch();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<SessionEntry> {
        self.sessions.write().remove(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Snapshot of every session's metadata.
    pub fn entries(&self) -> Vec<(SessionId, SessionMeta)> {
        self.sessions
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.meta.clone()))
            .collect()
    }

    pub fn get_by_status(&self, status: SessionStatus) -> Vec<SessionId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, entry)| entry.meta.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Sessions that have a recorded peer address, for reverse-lookup scans.
    pub fn connected_peers(&self) -> Vec<(SessionId, String)> {
        self.sessions
            .read()
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .peer_address
                    .as_ref()
                    .map(|peer| (id.clone(), peer.clone()))
            })
            .collect()
    }

    pub fn set_peer_address(&self, session_id: &SessionId, peer: Option<String>) -> bool {
        self.update(session_id, |entry| entry.peer_address = peer)
    }

    /// Sessions stuck in `connecting` with no activity for longer than
    /// `older_than`. These never acquired identity information and are not
    /// safely resumable.
    pub fn stale_connecting(&self, older_than: chrono::Duration) -> Vec<SessionId> {
        let now = chrono::Utc::now();
        self.sessions
            .read()
            .iter()
            .filter(|(_, entry)| {
                entry.meta.status == SessionStatus::Connecting
                    && now - entry.meta.last_activity > older_than
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Evicts entries untouched for longer than `max_age`. Bookkeeping only;
    /// live handles in evicted entries are not closed here.
    pub fn cleanup_stale(&self, max_age: chrono::Duration) -> usize {
        let now = chrono::Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| now - entry.meta.last_activity <= max_age);
        before - sessions.len()
    }
}
