//! Remote backup vault implementations.
//!
//! [`HttpVault`] talks to the real backup service. [`MemoryVault`] is an
//! in-process stand-in with scripted failure injection, used by tests and by
//! the daemon when no remote endpoint is configured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::instrument;

use roost_core::{RecordKey, SessionId, VaultToken};

use crate::error::RemoteVaultError;

/// Mirror of the local vault, holding the same sealed payloads.
///
/// Implementations must treat every operation as independent; the sync agent
/// provides ordering, retries via re-sweep, and health accounting.
#[async_trait]
pub trait RemoteVault: Send + Sync {
    async fn read(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<Option<String>, RemoteVaultError>;

    async fn write(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
        payload: &str,
    ) -> Result<(), RemoteVaultError>;

    async fn delete(&self, session_id: &SessionId, key: &RecordKey)
        -> Result<(), RemoteVaultError>;

    async fn list(&self, session_id: &SessionId) -> Result<Vec<RecordKey>, RemoteVaultError>;

    /// Sessions the remote holds any records for. Drives restore-on-empty.
    async fn sessions(&self) -> Result<Vec<SessionId>, RemoteVaultError>;

    async fn wipe(&self, session_id: &SessionId) -> Result<(), RemoteVaultError>;

    /// Cheap liveness check, used by the health probe ticker.
    async fn ping(&self) -> Result<(), RemoteVaultError>;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PayloadBody {
    payload: String,
}

/// HTTP client for the backup vault service.
pub struct HttpVault {
    client: reqwest::Client,
    base_url: String,
    token: Option<VaultToken>,
}

impl HttpVault {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<VaultToken>,
        timeout: Duration,
    ) -> Result<Self, RemoteVaultError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteVaultError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn record_url(&self, session_id: &SessionId) -> String {
        format!("{}/v1/vault/{}/record", self.base_url, session_id)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose()),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteVault for HttpVault {
    #[instrument(skip(self), fields(session_id = %session_id, key = %key))]
    async fn read(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<Option<String>, RemoteVaultError> {
        let (category, key_id) = key.parts();
        let req = self
            .client
            .get(self.record_url(session_id))
            .query(&[("category", category), ("id", key_id)]);
        let resp = self.authorized(req).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(RemoteVaultError::Status {
                status: resp.status().as_u16(),
            });
        }
        let body: PayloadBody = resp
            .json()
            .await
            .map_err(|e| RemoteVaultError::Payload(e.to_string()))?;
        Ok(Some(body.payload))
    }

    #[instrument(skip(self, payload), fields(session_id = %session_id, key = %key))]
    async fn write(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
        payload: &str,
    ) -> Result<(), RemoteVaultError> {
        let (category, key_id) = key.parts();
        let req = self
            .client
            .put(self.record_url(session_id))
            .query(&[("category", category), ("id", key_id)])
            .json(&PayloadBody {
                payload: payload.to_string(),
            });
        let resp = self.authorized(req).send().await?;

        if !resp.status().is_success() {
            return Err(RemoteVaultError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id, key = %key))]
    async fn delete(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<(), RemoteVaultError> {
        let (category, key_id) = key.parts();
        let req = self
            .client
            .delete(self.record_url(session_id))
            .query(&[("category", category), ("id", key_id)]);
        let resp = self.authorized(req).send().await?;

        // Deleting an absent record is a success from the mirror's view.
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        Err(RemoteVaultError::Status {
            status: resp.status().as_u16(),
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list(&self, session_id: &SessionId) -> Result<Vec<RecordKey>, RemoteVaultError> {
        let url = format!("{}/v1/vault/{}/keys", self.base_url, session_id);
        let resp = self.authorized(self.client.get(url)).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(RemoteVaultError::Status {
                status: resp.status().as_u16(),
            });
        }
        let raw: Vec<String> = resp
            .json()
            .await
            .map_err(|e| RemoteVaultError::Payload(e.to_string()))?;
        Ok(raw
            .iter()
            .map(|s| s.parse().unwrap_or(RecordKey::Primary))
            .collect())
    }

    #[instrument(skip(self))]
    async fn sessions(&self) -> Result<Vec<SessionId>, RemoteVaultError> {
        let url = format!("{}/v1/vault/sessions", self.base_url);
        let resp = self.authorized(self.client.get(url)).send().await?;

        if !resp.status().is_success() {
            return Err(RemoteVaultError::Status {
                status: resp.status().as_u16(),
            });
        }
        let raw: Vec<String> = resp
            .json()
            .await
            .map_err(|e| RemoteVaultError::Payload(e.to_string()))?;
        Ok(raw.into_iter().map(SessionId::from_raw).collect())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn wipe(&self, session_id: &SessionId) -> Result<(), RemoteVaultError> {
        let url = format!("{}/v1/vault/{}", self.base_url, session_id);
        let resp = self.authorized(self.client.delete(url)).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        Err(RemoteVaultError::Status {
            status: resp.status().as_u16(),
        })
    }

    async fn ping(&self) -> Result<(), RemoteVaultError> {
        let url = format!("{}/v1/health", self.base_url);
        let resp = self.authorized(self.client.get(url)).send().await?;
        if !resp.status().is_success() {
            return Err(RemoteVaultError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// In-memory vault with scripted failure injection.
///
/// Two knobs: `set_down` fails every operation until cleared, and
/// `push_failure` queues one-shot failures consumed in order. Storage is a
/// plain map, inspectable through the trait's own `read`/`list`.
#[derive(Default)]
pub struct MemoryVault {
    records: DashMap<(SessionId, String, String), String>,
    scripted_failures: Mutex<VecDeque<RemoteVaultError>>,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot failure for the next operation.
    pub fn push_failure(&self, error: RemoteVaultError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Take the vault down (every operation fails) or bring it back.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Total operations attempted, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Records currently held, across all sessions.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn gate(&self) -> Result<(), RemoteVaultError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteVaultError::Http("vault offline".to_string()));
        }
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }

    fn entry_key(session_id: &SessionId, key: &RecordKey) -> (SessionId, String, String) {
        let (category, key_id) = key.parts();
        (session_id.clone(), category.to_string(), key_id.to_string())
    }
}

#[async_trait]
impl RemoteVault for MemoryVault {
    async fn read(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<Option<String>, RemoteVaultError> {
        self.gate()?;
        Ok(self
            .records
            .get(&Self::entry_key(session_id, key))
            .map(|v| v.clone()))
    }

    async fn write(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
        payload: &str,
    ) -> Result<(), RemoteVaultError> {
        self.gate()?;
        self.records
            .insert(Self::entry_key(session_id, key), payload.to_string());
        Ok(())
    }

    async fn delete(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<(), RemoteVaultError> {
        self.gate()?;
        self.records.remove(&Self::entry_key(session_id, key));
        Ok(())
    }

    async fn list(&self, session_id: &SessionId) -> Result<Vec<RecordKey>, RemoteVaultError> {
        self.gate()?;
        let mut keys: Vec<RecordKey> = self
            .records
            .iter()
            .filter(|entry| &entry.key().0 == session_id)
            .map(|entry| RecordKey::from_parts(&entry.key().1, &entry.key().2))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, RemoteVaultError> {
        self.gate()?;
        let mut sessions: Vec<SessionId> = self
            .records
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        sessions.sort();
        sessions.dedup();
        Ok(sessions)
    }

    async fn wipe(&self, session_id: &SessionId) -> Result<(), RemoteVaultError> {
        self.gate()?;
        self.records.retain(|k, _| &k.0 != session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteVaultError> {
        self.gate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::TenantId;

    fn session(tenant: &str) -> SessionId {
        SessionId::for_tenant(&TenantId::from_raw(tenant))
    }

    #[tokio::test]
    async fn memory_vault_stores_and_lists() {
        let vault = MemoryVault::new();
        let sid = session("t1");
        vault.write(&sid, &RecordKey::Primary, "p").await.unwrap();
        vault
            .write(&sid, &RecordKey::keyed("pre_key", "1"), "a")
            .await
            .unwrap();

        assert_eq!(vault.read(&sid, &RecordKey::Primary).await.unwrap().as_deref(), Some("p"));
        let keys = vault.list(&sid).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&RecordKey::Primary));
    }

    #[tokio::test]
    async fn memory_vault_wipe_is_scoped() {
        let vault = MemoryVault::new();
        let a = session("a");
        let b = session("b");
        vault.write(&a, &RecordKey::Primary, "a").await.unwrap();
        vault.write(&b, &RecordKey::Primary, "b").await.unwrap();

        vault.wipe(&a).await.unwrap();
        assert!(vault.read(&a, &RecordKey::Primary).await.unwrap().is_none());
        assert!(vault.read(&b, &RecordKey::Primary).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let vault = MemoryVault::new();
        let sid = session("t1");
        vault.push_failure(RemoteVaultError::Timeout);

        let err = vault.write(&sid, &RecordKey::Primary, "p").await.unwrap_err();
        assert!(matches!(err, RemoteVaultError::Timeout));

        // Next call succeeds
        vault.write(&sid, &RecordKey::Primary, "p").await.unwrap();
        assert_eq!(vault.calls(), 2);
    }

    #[tokio::test]
    async fn down_vault_fails_everything() {
        let vault = MemoryVault::new();
        let sid = session("t1");
        vault.set_down(true);

        assert!(vault.ping().await.is_err());
        assert!(vault.write(&sid, &RecordKey::Primary, "p").await.is_err());

        vault.set_down(false);
        assert!(vault.ping().await.is_ok());
    }

    #[tokio::test]
    async fn delete_absent_is_ok() {
        let vault = MemoryVault::new();
        let sid = session("t1");
        vault.delete(&sid, &RecordKey::keyed("pre_key", "9")).await.unwrap();
    }

    #[tokio::test]
    async fn sessions_lists_distinct_holders() {
        let vault = MemoryVault::new();
        let a = session("a");
        let b = session("b");
        vault.write(&a, &RecordKey::Primary, "p").await.unwrap();
        vault.write(&a, &RecordKey::keyed("pre_key", "1"), "k").await.unwrap();
        vault.write(&b, &RecordKey::Primary, "p").await.unwrap();

        let sessions = vault.sessions().await.unwrap();
        assert_eq!(sessions, vec![a, b]);
    }
}
