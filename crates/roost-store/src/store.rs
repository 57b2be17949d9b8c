//! Credential store facade.
//!
//! The rule every path in here follows: the local vault is authoritative
//! and synchronous, the remote vault is a mirror fed through the sync
//! agent's queue. A local failure fails the caller; a remote failure only
//! ever moves counters and health state.
//!
//! Keyed records (ratchet state, one-time keys) churn hard during active
//! messaging, so their writes are debounced: the first write in a window
//! schedules a flush, later writes just replace the pending value, and one
//! local write with the latest value lands when the window closes. Reads
//! consult the pending overlay first, so a session always sees its own
//! writes.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use roost_core::{CredentialRecord, RecordKey, SessionId};

use crate::database::Database;
use crate::error::VaultError;
use crate::local::LocalVault;
use crate::remote::RemoteVault;
use crate::seal;
use crate::sync::{SyncAgent, SyncConfig, SyncCounters, SyncJob};

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Debounce window for keyed credential writes.
    pub debounce: Duration,
    /// Mirror keyed records even while the remote vault is unhealthy, and
    /// restore from remote when the local vault starts empty.
    pub full_backup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            full_backup: false,
        }
    }
}

struct StoreInner {
    local: LocalVault,
    remote: Arc<dyn RemoteVault>,
    agent: SyncAgent,
    seal_key: [u8; 32],
    /// Keyed writes waiting out their debounce window, latest value wins.
    pending: DashMap<(SessionId, RecordKey), Value>,
    /// Sessions currently inside a pairing window.
    pairing: DashMap<SessionId, ()>,
    debounce: Duration,
    full_backup: bool,
    flush_failures: AtomicU64,
}

impl StoreInner {
    fn should_mirror(&self, key: &RecordKey) -> bool {
        if key.is_primary() {
            return true;
        }
        self.full_backup || self.agent.is_healthy()
    }

    fn seal_value(&self, value: &Value) -> Result<String, VaultError> {
        let json = serde_json::to_string(value)?;
        Ok(seal::seal(&json, &self.seal_key)?)
    }

    fn unseal_value(&self, payload: &str) -> Result<Value, VaultError> {
        let json = seal::unseal(payload, &self.seal_key)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Writes the pending value for one key to the local vault and queues
    /// its mirror. Returns false when the pending entry was already gone
    /// (flushed earlier, or deleted).
    fn flush_key(&self, session_id: &SessionId, key: &RecordKey) -> Result<bool, VaultError> {
        let removed = self.pending.remove(&(session_id.clone(), key.clone()));
        let value = match removed {
            Some((_, value)) => value,
            None => return Ok(false),
        };

        let payload = self.seal_value(&value)?;
        self.local.put(session_id, key, &payload)?;
        if self.should_mirror(key) {
            self.agent.enqueue(SyncJob::MirrorWrite {
                session_id: session_id.clone(),
                key: key.clone(),
                payload,
            });
        }
        Ok(true)
    }
}

/// Session credential store: local SQLite authority plus background-synced
/// remote mirror.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    /// Opens the store under `data_dir` (database and sealing key live
    /// there) and starts the sync agent against `remote`.
    pub fn open(
        data_dir: &Path,
        remote: Arc<dyn RemoteVault>,
        config: StoreConfig,
        sync_config: SyncConfig,
    ) -> Result<Self, VaultError> {
        let db = Database::open(&data_dir.join("vault.db"))?;
        let seal_key = seal::load_or_create_key(&data_dir.join("vault.key"))?;
        Ok(Self::build(db, seal_key, remote, config, sync_config))
    }

    /// In-memory store for tests.
    pub fn in_memory(
        remote: Arc<dyn RemoteVault>,
        config: StoreConfig,
        sync_config: SyncConfig,
    ) -> Result<Self, VaultError> {
        let db = Database::in_memory()?;
        Ok(Self::build(db, seal::generate_key(), remote, config, sync_config))
    }

    fn build(
        db: Database,
        seal_key: [u8; 32],
        remote: Arc<dyn RemoteVault>,
        config: StoreConfig,
        sync_config: SyncConfig,
    ) -> Self {
        let local = LocalVault::new(db);
        let agent = SyncAgent::spawn(local.clone(), remote.clone(), sync_config);
        Self {
            inner: Arc::new(StoreInner {
                local,
                remote,
                agent,
                seal_key,
                pending: DashMap::new(),
                pairing: DashMap::new(),
                debounce: config.debounce,
                full_backup: config.full_backup,
                flush_failures: AtomicU64::new(0),
            }),
        }
    }

    // ── Primary record ──────────────────────────────────────────────

    /// Loads the session's primary credential record.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn load_credentials(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<CredentialRecord>, VaultError> {
        match self.load(session_id, &RecordKey::Primary)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Persists the primary record: local write first (fatal on failure),
    /// then an unconditional mirror enqueue. Incomplete records are rejected
    /// unless the session is inside a pairing window.
    #[instrument(skip(self, record), fields(session_id = %session_id))]
    pub fn save_credentials(
        &self,
        session_id: &SessionId,
        record: &CredentialRecord,
    ) -> Result<(), VaultError> {
        if !record.is_complete() && !self.is_pairing(session_id) {
            return Err(VaultError::Incomplete(format!(
                "primary record for {session_id} is missing required fields"
            )));
        }

        let value = serde_json::to_value(record)?;
        let payload = self.inner.seal_value(&value)?;
        self.inner.local.put(session_id, &RecordKey::Primary, &payload)?;
        self.inner.agent.enqueue(SyncJob::MirrorWrite {
            session_id: session_id.clone(),
            key: RecordKey::Primary,
            payload,
        });
        Ok(())
    }

    // ── Keyed records ───────────────────────────────────────────────

    /// Reads one record, preferring a pending debounced value so callers
    /// always see their own writes.
    pub fn load(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<Option<Value>, VaultError> {
        if let Some(pending) = self.inner.pending.get(&(session_id.clone(), key.clone())) {
            return Ok(Some(pending.clone()));
        }
        match self.inner.local.get(session_id, key)? {
            Some(payload) => Ok(Some(self.inner.unseal_value(&payload)?)),
            None => Ok(None),
        }
    }

    /// Stages a keyed write. Returns immediately; the local write happens
    /// when the debounce window closes, with the latest staged value.
    pub fn save_key_file(&self, session_id: &SessionId, key: &RecordKey, value: Value) {
        let map_key = (session_id.clone(), key.clone());
        let first = self.inner.pending.insert(map_key.clone(), value).is_none();
        if !first {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let (session_id, key) = map_key;
            if let Err(e) = inner.flush_key(&session_id, &key) {
                inner.flush_failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    session_id = %session_id,
                    key = %key,
                    error = %e,
                    "debounced credential flush failed"
                );
            }
        });
    }

    /// Deletes one record: pending value discarded, local row removed,
    /// mirror delete queued.
    #[instrument(skip(self), fields(session_id = %session_id, key = %key))]
    pub fn delete(&self, session_id: &SessionId, key: &RecordKey) -> Result<bool, VaultError> {
        let had_pending = self
            .inner
            .pending
            .remove(&(session_id.clone(), key.clone()))
            .is_some();
        let had_row = self.inner.local.delete(session_id, key)?;
        self.inner.agent.enqueue(SyncJob::MirrorDelete {
            session_id: session_id.clone(),
            key: key.clone(),
        });
        Ok(had_pending || had_row)
    }

    /// Key ids in one category, merged with any still-pending writes.
    pub fn list_ids(
        &self,
        session_id: &SessionId,
        category: &str,
    ) -> Result<Vec<String>, VaultError> {
        let mut ids: std::collections::BTreeSet<String> = self
            .inner
            .local
            .list_ids(session_id, category)?
            .into_iter()
            .collect();
        for entry in self.inner.pending.iter() {
            let (pending_session, pending_key) = entry.key();
            if pending_session == session_id {
                let (pending_category, pending_id) = pending_key.parts();
                if pending_category == category {
                    ids.insert(pending_id.to_string());
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Every key the session holds, merged with any still-pending writes.
    pub fn list_keys(&self, session_id: &SessionId) -> Result<Vec<RecordKey>, VaultError> {
        let mut keys: std::collections::BTreeSet<RecordKey> = self
            .inner
            .local
            .list_keys(session_id)?
            .into_iter()
            .collect();
        for entry in self.inner.pending.iter() {
            let (pending_session, pending_key) = entry.key();
            if pending_session == session_id {
                keys.insert(pending_key.clone());
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Sessions with any stored or pending material.
    pub fn known_sessions(&self) -> Result<Vec<SessionId>, VaultError> {
        let mut sessions: std::collections::BTreeSet<SessionId> =
            self.inner.local.known_sessions()?.into_iter().collect();
        for entry in self.inner.pending.iter() {
            sessions.insert(entry.key().0.clone());
        }
        Ok(sessions.into_iter().collect())
    }

    /// Removes every trace of one session: pending writes, pairing state,
    /// local rows, and (via the queue) remote rows.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn wipe_session(&self, session_id: &SessionId) -> Result<u64, VaultError> {
        self.inner.pending.retain(|(sid, _), _| sid != session_id);
        self.inner.pairing.remove(session_id);
        let removed = self.inner.local.wipe_session(session_id)?;
        self.inner.agent.enqueue(SyncJob::WipeSession {
            session_id: session_id.clone(),
        });
        info!(removed, "session credentials wiped");
        Ok(removed)
    }

    // ── Pairing window ──────────────────────────────────────────────

    /// Opens a pairing window, during which incomplete primary records are
    /// accepted (the handshake builds them up field by field).
    pub fn begin_pairing(&self, session_id: &SessionId) {
        self.inner.pairing.insert(session_id.clone(), ());
    }

    pub fn end_pairing(&self, session_id: &SessionId) {
        self.inner.pairing.remove(session_id);
    }

    pub fn is_pairing(&self, session_id: &SessionId) -> bool {
        self.inner.pairing.contains_key(session_id)
    }

    // ── Restore & lifecycle ─────────────────────────────────────────

    /// Full-backup mode only: when the local vault starts empty, pull
    /// everything the remote holds. A non-empty local vault always wins;
    /// remote failures are absorbed. Returns the number of records pulled.
    #[instrument(skip(self))]
    pub async fn pull_remote_if_empty(&self) -> Result<usize, VaultError> {
        if !self.inner.full_backup {
            debug!("file-first mode, skipping remote pull");
            return Ok(0);
        }
        if !self.inner.local.is_empty()? {
            info!("local vault non-empty, skipping remote pull");
            return Ok(0);
        }

        let sessions = match self.inner.remote.sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "remote pull failed, starting with empty vault");
                self.inner.agent.health().record_failure();
                return Ok(0);
            }
        };

        let mut pulled = 0usize;
        for session_id in &sessions {
            let keys = match self.inner.remote.list(session_id).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "remote list failed during pull");
                    self.inner.agent.health().record_failure();
                    continue;
                }
            };
            for key in keys {
                match self.inner.remote.read(session_id, &key).await {
                    Ok(Some(payload)) => {
                        self.inner.local.put(session_id, &key, &payload)?;
                        pulled += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            session_id = %session_id,
                            key = %key,
                            error = %e,
                            "remote read failed during pull"
                        );
                        self.inner.agent.health().record_failure();
                    }
                }
            }
        }
        info!(sessions = sessions.len(), pulled, "restored credentials from remote vault");
        Ok(pulled)
    }

    /// Foreground pull of one session's records from the remote vault,
    /// used to verify a takeover claim. Unlike the startup restore this is a
    /// verify operation: remote failures propagate so the caller can roll
    /// the claim back. Local material, if any exists, wins untouched.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn pull_session_from_remote(
        &self,
        session_id: &SessionId,
    ) -> Result<usize, VaultError> {
        if !self.list_keys(session_id)?.is_empty() {
            debug!("session has local material, skipping remote pull");
            return Ok(0);
        }

        let keys = match self.inner.remote.list(session_id).await {
            Ok(keys) => keys,
            Err(e) => {
                self.inner.agent.health().record_failure();
                return Err(e.into());
            }
        };

        let mut pulled = 0usize;
        for key in keys {
            match self.inner.remote.read(session_id, &key).await {
                Ok(Some(payload)) => {
                    self.inner.local.put(session_id, &key, &payload)?;
                    pulled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    self.inner.agent.health().record_failure();
                    return Err(e.into());
                }
            }
        }
        self.inner.agent.health().record_success();
        info!(pulled, "pulled session credentials from remote vault");
        Ok(pulled)
    }

    /// Flushes every pending debounced write now. Returns how many records
    /// were written; failures are logged and counted, not propagated.
    pub fn flush(&self) -> usize {
        let keys: Vec<(SessionId, RecordKey)> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut flushed = 0usize;
        for (session_id, key) in keys {
            match self.inner.flush_key(&session_id, &key) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.inner.flush_failures.fetch_add(1, Ordering::SeqCst);
                    error!(
                        session_id = %session_id,
                        key = %key,
                        error = %e,
                        "flush failed"
                    );
                }
            }
        }
        flushed
    }

    /// Flush pending writes, then stop the sync agent (draining its queue).
    pub async fn shutdown(&self) {
        let flushed = self.flush();
        if flushed > 0 {
            info!(flushed, "flushed pending credential writes");
        }
        self.inner.agent.shutdown().await;
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn remote_healthy(&self) -> bool {
        self.inner.agent.is_healthy()
    }

    pub fn sync_counters(&self) -> SyncCounters {
        self.inner.agent.counters()
    }

    pub fn flush_failures(&self) -> u64 {
        self.inner.flush_failures.load(Ordering::SeqCst)
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.pending.len()
    }
}
