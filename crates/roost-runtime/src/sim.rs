//! Scripted protocol client and in-memory tenant directory.
//!
//! The real wire protocol lives outside this repository; this module stands
//! in for it. `SimClient` plays back scripted connection outcomes per tenant
//! (tests script failures and delays, the daemon scripts nothing and takes
//! the defaults), and `MemoryDirectory` backs the tenant directory seam
//! without an external system.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;

use roost_core::{
    ConnectionHandle, CredentialEvent, CredentialRecord, DirectoryEntry, DirectoryError, HandleId,
    ProtocolClient, RecordKey, SessionEvents, SessionSource, SessionStatus, StatusUpdate, TenantId,
    TenantDirectory, TransportError,
};

/// One scripted step of a tenant's connect sequence.
#[derive(Debug, Clone)]
pub enum SimBehavior {
    /// Establish: emit the credential events, then report connected with
    /// this peer address and return an open handle.
    Open {
        peer_address: String,
        credential_events: Vec<CredentialEvent>,
    },
    /// Fail the connect attempt with this error.
    Fail(TransportError),
    /// Sleep before taking the next scripted step.
    Delay(Duration),
}

/// Credential material a pairing handshake would produce.
pub fn default_pairing_events() -> Vec<CredentialEvent> {
    vec![
        CredentialEvent::Write {
            key: RecordKey::Primary,
            value: json!({
                "identityKeys": {"public": "sim-ipk", "private": "sim-isk"},
                "account": {"id": "sim-account"},
                "registered": true,
            }),
        },
        CredentialEvent::Write {
            key: RecordKey::keyed("pre_key", "1"),
            value: json!({"material": "sim-prekey-1"}),
        },
    ]
}

/// Scripted stand-in for the protocol client.
///
/// Unscripted tenants connect successfully: with credentials they just open,
/// without credentials they first play a pairing handshake that emits
/// [`default_pairing_events`].
#[derive(Default)]
pub struct SimClient {
    scripts: DashMap<TenantId, VecDeque<SimBehavior>>,
    handles: DashMap<TenantId, Arc<SimHandle>>,
    events: DashMap<TenantId, Arc<dyn SessionEvents>>,
    attempts: DashMap<TenantId, u64>,
}

impl SimClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends behaviors to the tenant's script. Each connect attempt
    /// consumes steps until it reaches an `Open` or `Fail`.
    pub fn script(&self, tenant: &TenantId, behaviors: impl IntoIterator<Item = SimBehavior>) {
        self.scripts
            .entry(tenant.clone())
            .or_default()
            .extend(behaviors);
    }

    pub fn connect_attempts(&self, tenant: &TenantId) -> u64 {
        self.attempts.get(tenant).map(|n| *n).unwrap_or(0)
    }

    /// The most recently issued handle for a tenant.
    pub fn handle(&self, tenant: &TenantId) -> Option<Arc<SimHandle>> {
        self.handles.get(tenant).map(|h| h.clone())
    }

    /// Drives the session's `on_error` callback, as an established
    /// connection failing would.
    pub async fn emit_error(&self, tenant: &TenantId, error: TransportError) {
        let events = self.events.get(tenant).map(|e| e.clone());
        if let Some(events) = events {
            events.on_error(error).await;
        }
    }

    /// Drives the session's `on_credential_event` callback.
    pub async fn emit_credential_event(&self, tenant: &TenantId, event: CredentialEvent) {
        let events = self.events.get(tenant).map(|e| e.clone());
        if let Some(events) = events {
            events.on_credential_event(event).await;
        }
    }

    async fn open(
        &self,
        tenant: &TenantId,
        peer_address: String,
        credential_events: Vec<CredentialEvent>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn ConnectionHandle>, TransportError> {
        for event in credential_events {
            events.on_credential_event(event).await;
        }
        let handle = Arc::new(SimHandle::new(tenant.clone()));
        self.handles.insert(tenant.clone(), handle.clone());
        self.events.insert(tenant.clone(), events.clone());
        events.on_connected(peer_address).await;
        Ok(handle)
    }
}

#[async_trait]
impl ProtocolClient for SimClient {
    async fn connect(
        &self,
        tenant: &TenantId,
        credentials: Option<CredentialRecord>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn ConnectionHandle>, TransportError> {
        *self.attempts.entry(tenant.clone()).or_insert(0) += 1;

        loop {
            let next = self
                .scripts
                .get_mut(tenant)
                .and_then(|mut queue| queue.pop_front());
            match next {
                Some(SimBehavior::Delay(wait)) => {
                    tokio::time::sleep(wait).await;
                }
                Some(SimBehavior::Fail(error)) => return Err(error),
                Some(SimBehavior::Open {
                    peer_address,
                    credential_events,
                }) => {
                    return self
                        .open(tenant, peer_address, credential_events, events)
                        .await;
                }
                None => {
                    let credential_events = if credentials.is_none() {
                        default_pairing_events()
                    } else {
                        Vec::new()
                    };
                    let peer_address = format!("{}@sim", tenant.as_str().to_ascii_lowercase());
                    return self
                        .open(tenant, peer_address, credential_events, events)
                        .await;
                }
            }
        }
    }
}

/// Connection handle issued by [`SimClient`].
pub struct SimHandle {
    id: HandleId,
    tenant: TenantId,
    open: AtomicBool,
    probe_script: Mutex<VecDeque<Result<(), TransportError>>>,
}

impl SimHandle {
    fn new(tenant: TenantId) -> Self {
        Self {
            id: HandleId::new(),
            tenant,
            open: AtomicBool::new(true),
            probe_script: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues the outcome of a future probe; unscripted probes succeed
    /// while the handle is open.
    pub fn push_probe_result(&self, result: Result<(), TransportError>) {
        self.probe_script.lock().push_back(result);
    }
}

#[async_trait]
impl ConnectionHandle for SimHandle {
    fn id(&self) -> &HandleId {
        &self.id
    }

    fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if let Some(result) = self.probe_script.lock().pop_front() {
            return result;
        }
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost("handle closed".into()))
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// In-memory tenant directory.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: DashMap<TenantId, DirectoryEntry>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a tenant record the way an external producer would.
    pub fn seed(&self, tenant: &TenantId, source: SessionSource, detected: bool) {
        self.entries.insert(
            tenant.clone(),
            DirectoryEntry {
                tenant_id: tenant.clone(),
                source,
                detected,
                is_connected: false,
                status: SessionStatus::Uninitialized,
                reconnect_attempts: 0,
                updated_at: chrono::Utc::now(),
            },
        );
    }

    /// Simulates a directory outage; all operations fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Synchronous read for assertions.
    pub fn entry(&self, tenant: &TenantId) -> Option<DirectoryEntry> {
        self.entries.get(tenant).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("directory offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for MemoryDirectory {
    async fn list_tenants(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        self.check_available()?;
        let mut entries: Vec<DirectoryEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(entries)
    }

    async fn get(&self, tenant: &TenantId) -> Result<Option<DirectoryEntry>, DirectoryError> {
        self.check_available()?;
        Ok(self.entries.get(tenant).map(|e| e.clone()))
    }

    async fn upsert(&self, mut entry: DirectoryEntry) -> Result<(), DirectoryError> {
        self.check_available()?;
        entry.updated_at = chrono::Utc::now();
        self.entries.insert(entry.tenant_id.clone(), entry);
        Ok(())
    }

    async fn update_status(
        &self,
        tenant: &TenantId,
        update: StatusUpdate,
    ) -> Result<(), DirectoryError> {
        self.check_available()?;
        let mut entry = self.entries.get_mut(tenant).ok_or(DirectoryError::NotFound)?;
        entry.is_connected = update.is_connected;
        entry.status = update.status;
        entry.reconnect_attempts = update.reconnect_attempts;
        entry.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_source(
        &self,
        tenant: &TenantId,
        source: SessionSource,
        detected: bool,
    ) -> Result<(), DirectoryError> {
        self.check_available()?;
        let mut entry = self.entries.get_mut(tenant).ok_or(DirectoryError::NotFound)?;
        entry.source = source;
        entry.detected = detected;
        entry.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn remove(&self, tenant: &TenantId) -> Result<bool, DirectoryError> {
        self.check_available()?;
        Ok(self.entries.remove(tenant).is_some())
    }
}
