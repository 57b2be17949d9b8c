//! Session orchestrator.
//!
//! Owns the lifecycle of every tenant session: creation and pairing,
//! bounded-concurrency bulk startup, reconnect scheduling with backoff,
//! liveness escalation, takeover adoption hooks, cleanup, and shutdown.
//! All coordination state lives on this instance; the process entry point
//! constructs exactly one and hands out the `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use roost_core::{
    ConnectionHandle, CredentialEvent, CredentialRecord, DirectoryEntry, ProtocolClient,
    SessionId, SessionMeta, SessionSource, SessionStatus, StatusUpdate, TenantDirectory, TenantId,
    TransportError,
};
use roost_store::{CredentialStore, SyncCounters};

use crate::error::OrchestratorError;
use crate::events::OrchestratorEvents;
use crate::health::{HealthConfig, HealthMonitor};
use crate::lookup::{normalize_address, LookupConfig, ReverseLookupCache};
use crate::registry::{SessionEntry, SessionRegistry};
use crate::scheduler::ReconnectScheduler;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard ceiling on registered sessions.
    pub max_sessions: usize,
    /// Parallel session starts per bulk-startup batch.
    pub startup_concurrency: usize,
    /// Delay between starts within one batch.
    pub startup_stagger: Duration,
    /// Delay between batches.
    pub startup_batch_delay: Duration,
    /// How often the background retry loop runs.
    pub retry_interval: Duration,
    /// Sessions the retry loop will touch per pass.
    pub retry_batch_limit: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub jitter_factor: f64,
    /// Minimum time between reinitialization attempts for one session.
    pub reinit_cooldown: Duration,
    /// Settle time between teardown and recreate during reinitialization.
    pub reinit_settle: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 900,
            startup_concurrency: 3,
            startup_stagger: Duration::from_millis(500),
            startup_batch_delay: Duration::from_secs(2),
            retry_interval: Duration::from_secs(5 * 60),
            retry_batch_limit: 5,
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(5 * 60),
            jitter_factor: 0.2,
            reinit_cooldown: Duration::from_secs(60),
            reinit_settle: Duration::from_secs(1),
        }
    }
}

/// Options for one `create_session` call.
#[derive(Debug, Clone, Copy)]
pub struct CreateOpts {
    /// Force a fresh connection even if a live handle exists.
    pub reconnect: bool,
    /// Permit the pairing path when no credentials are stored. Reconnects
    /// and takeovers must pass false: their credentials already exist.
    pub allow_pairing: bool,
    pub source: SessionSource,
    /// Whether this process has claimed the session. Set by the takeover
    /// path so the claim survives the placeholder's directory upsert.
    pub detected: bool,
}

impl Default for CreateOpts {
    fn default() -> Self {
        Self {
            reconnect: false,
            allow_pairing: true,
            source: SessionSource::Primary,
            detected: false,
        }
    }
}

/// Outcome of a `reinitialize_session` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinitOutcome {
    Reinitialized,
    /// Another reinit for the session is running; nothing was done.
    AlreadyInFlight,
    /// The cooldown window since the last attempt has not lapsed.
    CoolingDown,
}

/// Tally of one bulk startup run.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupReport {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
    /// Sessions left alone: unclaimed secondaries and directory rows
    /// without stored credentials.
    pub skipped: usize,
    /// Records pulled from the remote vault before startup (full-backup
    /// mode only).
    pub restored_records: usize,
}

/// Point-in-time orchestrator state for logs and operators.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub total_sessions: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub detected_sessions: usize,
    pub monitored_sessions: usize,
    pub unhealthy_sessions: usize,
    pub pending_reconnects: usize,
    pub sessions_created: u64,
    pub connects_failed: u64,
    pub reconnects_scheduled: u64,
    pub cleanups_performed: u64,
    pub probes_sent: u64,
    pub probes_failed: u64,
    pub sessions_expired: u64,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub remote_healthy: bool,
    pub pending_writes: usize,
    pub flush_failures: u64,
    pub sync: SyncCounters,
}

struct InFlight {
    watcher: watch::Receiver<()>,
    cancel: CancellationToken,
}

/// Top-level session coordinator.
pub struct SessionOrchestrator {
    client: Arc<dyn ProtocolClient>,
    store: CredentialStore,
    directory: Arc<dyn TenantDirectory>,
    registry: SessionRegistry,
    lookup: ReverseLookupCache,
    scheduler: ReconnectScheduler,
    monitor: HealthMonitor,
    config: OrchestratorConfig,
    /// One connect at a time per session; waiters hold the receiver.
    in_flight: DashMap<SessionId, InFlight>,
    reinit_guard: DashMap<SessionId, ()>,
    reinit_done_at: DashMap<SessionId, Instant>,
    shutting_down: AtomicBool,
    sessions_created: AtomicU64,
    connects_failed: AtomicU64,
    reconnects_scheduled: AtomicU64,
    cleanups_performed: AtomicU64,
}

impl SessionOrchestrator {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        store: CredentialStore,
        directory: Arc<dyn TenantDirectory>,
        config: OrchestratorConfig,
        health: HealthConfig,
        lookup: LookupConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            directory,
            registry: SessionRegistry::new(),
            lookup: ReverseLookupCache::new(lookup),
            scheduler: ReconnectScheduler::new(),
            monitor: HealthMonitor::new(health),
            config,
            in_flight: DashMap::new(),
            reinit_guard: DashMap::new(),
            reinit_done_at: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            sessions_created: AtomicU64::new(0),
            connects_failed: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            cleanups_performed: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn TenantDirectory> {
        &self.directory
    }

    pub fn health_config(&self) -> &HealthConfig {
        self.monitor.config()
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // ── Session creation ────────────────────────────────────────────

    /// Establishes (or reuses) the session for one tenant.
    ///
    /// A live connected handle is returned unchanged unless `opts.reconnect`
    /// forces a fresh connection. Concurrent calls for the same session do
    /// not duplicate work: later callers wait for the in-flight attempt and
    /// share its result.
    pub async fn create_session(
        self: &Arc<Self>,
        tenant: &TenantId,
        opts: CreateOpts,
    ) -> Result<Arc<dyn ConnectionHandle>, OrchestratorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let session_id = SessionId::for_tenant(tenant);

        if !opts.reconnect {
            if let Some(entry) = self.registry.get(&session_id) {
                if entry.meta.status == SessionStatus::Connected {
                    if let Some(handle) = entry.handle {
                        if handle.is_open() {
                            debug!(session_id = %session_id, "reusing live session handle");
                            return Ok(handle);
                        }
                    }
                }
            }
        }

        let cancel = CancellationToken::new();
        let (owner_tx, owner_rx) = watch::channel(());
        match self.in_flight.entry(session_id.clone()) {
            Entry::Occupied(existing) => {
                let mut watcher = existing.get().watcher.clone();
                drop(existing);
                debug!(session_id = %session_id, "create already in flight, waiting");
                let _ = watcher.changed().await;
                return self.resolve_in_flight(&session_id);
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    watcher: owner_rx,
                    cancel: cancel.clone(),
                });
            }
        }

        let result = self.connect_locked(&session_id, tenant, opts, cancel).await;
        self.in_flight.remove(&session_id);
        drop(owner_tx);
        result
    }

    /// What a waiter sees once the owning attempt finishes.
    fn resolve_in_flight(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn ConnectionHandle>, OrchestratorError> {
        match self.registry.get(session_id).and_then(|entry| entry.handle) {
            Some(handle) if handle.is_open() => Ok(handle),
            _ => Err(OrchestratorError::InFlightFailed),
        }
    }

    async fn connect_locked(
        self: &Arc<Self>,
        session_id: &SessionId,
        tenant: &TenantId,
        opts: CreateOpts,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ConnectionHandle>, OrchestratorError> {
        // Tear down whatever is left of a previous incarnation first, so at
        // most one live handle ever exists per session.
        let previous = self.registry.get(session_id);
        if let Some(entry) = &previous {
            self.scheduler.cancel(session_id);
            self.monitor.detach(session_id);
            self.lookup.invalidate_session(session_id);
            if let Some(handle) = &entry.handle {
                handle.close().await;
            }
        } else if self.registry.len() >= self.config.max_sessions {
            return Err(OrchestratorError::SessionLimit(self.registry.len()));
        }

        let credentials = self.store.load_credentials(session_id)?;
        if credentials.is_none() {
            if !opts.allow_pairing {
                return Err(OrchestratorError::NoCredentials(tenant.clone()));
            }
            // A brand-new pairing must not inherit stale keyed material.
            let wiped = self.store.wipe_session(session_id)?;
            if wiped > 0 {
                info!(session_id = %session_id, wiped, "cleared stale material before pairing");
            }
            self.store.begin_pairing(session_id);
        }

        // Register before connecting: credential events can arrive while
        // the transport is still establishing.
        let mut meta = SessionMeta::new(tenant.clone(), opts.source);
        meta.status = SessionStatus::Connecting;
        meta.detected = opts.detected;
        if let Some(entry) = &previous {
            meta.created_at = entry.meta.created_at;
            meta.detected = entry.meta.detected || opts.detected;
            if opts.reconnect {
                meta.reconnect_attempts = entry.meta.reconnect_attempts;
            }
        }
        let detected = meta.detected;
        let attempts = meta.reconnect_attempts;
        self.registry.insert(session_id.clone(), meta);
        self.push_directory_entry(tenant, opts.source, detected, attempts)
            .await;

        let events = Arc::new(OrchestratorEvents::new(
            session_id.clone(),
            Arc::downgrade(self),
        ));
        let connected = tokio::select! {
            result = self.client.connect(tenant, credentials, events) => result,
            () = cancel.cancelled() => Err(TransportError::Timeout),
        };

        match connected {
            Ok(handle) => {
                self.store.end_pairing(session_id);
                self.registry
                    .update(session_id, |entry| entry.handle = Some(handle.clone()));
                self.sessions_created.fetch_add(1, Ordering::Relaxed);
                info!(session_id = %session_id, handle_id = %handle.id(), "session established");
                Ok(handle)
            }
            Err(error) => {
                self.store.end_pairing(session_id);
                self.connects_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %session_id,
                    kind = error.kind(),
                    error = %error,
                    "connect failed"
                );
                let fatal = error.is_fatal();
                self.registry.update(session_id, |entry| {
                    entry.handle = None;
                    entry.meta.status = SessionStatus::Failed;
                    if fatal {
                        entry.meta.voluntary_disconnect = true;
                    }
                });
                self.push_status(tenant, false, SessionStatus::Failed).await;
                if error.is_retryable() && !self.shutting_down.load(Ordering::SeqCst) {
                    self.schedule_reconnect(session_id, error.suggested_delay());
                }
                Err(error.into())
            }
        }
    }

    // ── Bulk startup ────────────────────────────────────────────────

    /// Brings up every session with durable credentials, in batches of
    /// `startup_concurrency` with stagger and inter-batch delays. Retryable
    /// failures get one serial retry after all batches complete.
    pub async fn initialize_existing_sessions(self: &Arc<Self>) -> StartupReport {
        let mut report = StartupReport::default();

        match self.store.pull_remote_if_empty().await {
            Ok(pulled) => report.restored_records = pulled,
            Err(error) => warn!(error = %error, "startup restore failed"),
        }

        let known = match self.store.known_sessions() {
            Ok(known) => known,
            Err(error) => {
                error!(error = %error, "cannot enumerate stored sessions");
                return report;
            }
        };

        let directory_entries: HashMap<TenantId, DirectoryEntry> =
            match self.directory.list_tenants().await {
                Ok(entries) => entries
                    .into_iter()
                    .map(|entry| (entry.tenant_id.clone(), entry))
                    .collect(),
                Err(error) => {
                    warn!(error = %error, "directory unavailable at startup, using stored sessions only");
                    HashMap::new()
                }
            };

        let mut candidates: Vec<(TenantId, CreateOpts)> = Vec::new();
        for session_id in &known {
            let tenant = session_id.tenant();
            match directory_entries.get(&tenant) {
                Some(entry) if entry.source == SessionSource::Secondary && !entry.detected => {
                    debug!(tenant = %tenant, "unclaimed secondary session, leaving for takeover");
                    report.skipped += 1;
                }
                Some(entry) => candidates.push((
                    tenant,
                    CreateOpts {
                        reconnect: false,
                        allow_pairing: false,
                        source: entry.source,
                        detected: entry.detected,
                    },
                )),
                None => candidates.push((
                    tenant,
                    CreateOpts {
                        reconnect: false,
                        allow_pairing: false,
                        source: SessionSource::Primary,
                        detected: false,
                    },
                )),
            }
        }
        let known_tenants: HashSet<TenantId> =
            known.iter().map(|session_id| session_id.tenant()).collect();
        for tenant in directory_entries.keys() {
            if !known_tenants.contains(tenant) {
                debug!(tenant = %tenant, "directory session has no stored credentials, skipping");
                report.skipped += 1;
            }
        }

        info!(
            candidates = candidates.len(),
            skipped = report.skipped,
            restored = report.restored_records,
            "starting stored sessions"
        );

        let mut retry_queue: Vec<(TenantId, CreateOpts)> = Vec::new();
        let batches: Vec<Vec<(TenantId, CreateOpts)>> = candidates
            .chunks(self.config.startup_concurrency.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let total_batches = batches.len();

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let results =
                futures::future::join_all(batch.into_iter().enumerate().map(|(offset, (tenant, opts))| {
                    let orchestrator = Arc::clone(self);
                    let stagger = self.config.startup_stagger * offset as u32;
                    async move {
                        tokio::time::sleep(stagger).await;
                        let result = orchestrator.create_session(&tenant, opts).await;
                        (tenant, opts, result)
                    }
                }))
                .await;

            for (tenant, opts, result) in results {
                report.attempted += 1;
                match result {
                    Ok(_) => report.connected += 1,
                    Err(error) if error.is_retryable() => {
                        warn!(tenant = %tenant, error = %error, "startup connect failed, queueing serial retry");
                        retry_queue.push((tenant, opts));
                    }
                    Err(error) => {
                        warn!(tenant = %tenant, error = %error, "startup connect failed");
                        report.failed += 1;
                    }
                }
            }

            if batch_index + 1 < total_batches {
                tokio::time::sleep(self.config.startup_batch_delay).await;
            }
        }

        for (tenant, opts) in retry_queue {
            let retry_opts = CreateOpts {
                reconnect: true,
                ..opts
            };
            match self.create_session(&tenant, retry_opts).await {
                Ok(_) => report.connected += 1,
                Err(error) => {
                    warn!(tenant = %tenant, error = %error, "serial retry failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            connected = report.connected,
            failed = report.failed,
            skipped = report.skipped,
            "startup complete"
        );
        report
    }

    // ── Teardown paths ──────────────────────────────────────────────

    /// Closes the transport, keeping credentials so the session can come
    /// back. `voluntary` suppresses every automatic reconnect path until
    /// the next explicit `create_session`.
    pub async fn disconnect_session(
        &self,
        tenant: &TenantId,
        voluntary: bool,
    ) -> Result<(), OrchestratorError> {
        let session_id = SessionId::for_tenant(tenant);
        let entry = self
            .registry
            .get(&session_id)
            .ok_or_else(|| OrchestratorError::NotFound(session_id.clone()))?;

        self.scheduler.cancel(&session_id);
        self.monitor.detach(&session_id);
        self.lookup.invalidate_session(&session_id);
        if let Some(handle) = entry.handle {
            handle.close().await;
        }

        self.registry.update(&session_id, |entry| {
            entry.handle = None;
            entry.peer_address = None;
            entry.meta.status = SessionStatus::Disconnected;
            entry.meta.voluntary_disconnect = voluntary;
        });
        self.push_status(tenant, false, SessionStatus::Disconnected)
            .await;
        info!(session_id = %session_id, voluntary, "session disconnected");
        Ok(())
    }

    /// The destructive path: cancels pending work, closes the transport,
    /// wipes credentials from both stores, and evicts every trace of the
    /// session. For confirmed-invalid credentials, not ordinary disconnects.
    pub async fn complete_user_cleanup(&self, tenant: &TenantId) -> Result<u64, OrchestratorError> {
        let session_id = SessionId::for_tenant(tenant);
        info!(session_id = %session_id, "starting complete user cleanup");

        let in_flight_cancel = self
            .in_flight
            .get(&session_id)
            .map(|entry| entry.cancel.clone());
        if let Some(cancel) = in_flight_cancel {
            cancel.cancel();
        }
        self.scheduler.cancel(&session_id);
        self.monitor.forget(&session_id);
        self.lookup.invalidate_session(&session_id);
        self.reinit_done_at.remove(&session_id);

        if let Some(entry) = self.registry.remove(&session_id) {
            if let Some(handle) = entry.handle {
                handle.close().await;
            }
        }

        let removed = self.store.wipe_session(&session_id)?;
        if let Err(error) = self.directory.remove(tenant).await {
            warn!(tenant = %tenant, error = %error, "directory removal failed during cleanup");
        }

        self.cleanups_performed.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %session_id, removed, "user cleanup complete");
        Ok(removed)
    }

    /// Forced recreate that keeps credentials: close the transport, wait
    /// for teardown to settle, connect again. Guarded against concurrent
    /// calls and rate-limited by a cooldown window.
    pub async fn reinitialize_session(
        self: &Arc<Self>,
        tenant: &TenantId,
    ) -> Result<ReinitOutcome, OrchestratorError> {
        let session_id = SessionId::for_tenant(tenant);
        if self.reinit_guard.insert(session_id.clone(), ()).is_some() {
            debug!(session_id = %session_id, "reinit already in flight");
            return Ok(ReinitOutcome::AlreadyInFlight);
        }
        let result = self.reinitialize_locked(&session_id, tenant).await;
        self.reinit_guard.remove(&session_id);
        result
    }

    async fn reinitialize_locked(
        self: &Arc<Self>,
        session_id: &SessionId,
        tenant: &TenantId,
    ) -> Result<ReinitOutcome, OrchestratorError> {
        if let Some(done_at) = self.reinit_done_at.get(session_id).map(|at| *at) {
            if done_at.elapsed() < self.config.reinit_cooldown {
                debug!(session_id = %session_id, "reinit cooling down");
                return Ok(ReinitOutcome::CoolingDown);
            }
        }
        info!(session_id = %session_id, "reinitializing session");

        if let Some(entry) = self.registry.get(session_id) {
            self.scheduler.cancel(session_id);
            self.monitor.detach(session_id);
            self.lookup.invalidate_session(session_id);
            if let Some(handle) = entry.handle {
                handle.close().await;
            }
            self.registry.update(session_id, |entry| {
                entry.handle = None;
                entry.peer_address = None;
                entry.meta.status = SessionStatus::Disconnected;
            });
        }
        tokio::time::sleep(self.config.reinit_settle).await;

        let source = self
            .registry
            .get(session_id)
            .map(|entry| entry.meta.source)
            .unwrap_or(SessionSource::Primary);
        let result = self
            .create_session(
                tenant,
                CreateOpts {
                    reconnect: true,
                    allow_pairing: false,
                    source,
                    detected: false,
                },
            )
            .await;
        // The cooldown applies whether or not the attempt succeeded.
        self.reinit_done_at.insert(session_id.clone(), Instant::now());
        result.map(|_| ReinitOutcome::Reinitialized)
    }

    // ── Background passes ───────────────────────────────────────────

    /// One pass of the background retry loop: reattempt failed or
    /// involuntarily disconnected sessions, a few at a time.
    pub(crate) async fn run_retry_pass(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut picked = 0usize;
        for (session_id, meta) in self.registry.entries() {
            if picked >= self.config.retry_batch_limit {
                break;
            }
            let eligible = matches!(
                meta.status,
                SessionStatus::Failed | SessionStatus::Disconnected
            ) && !meta.voluntary_disconnect
                && meta.reconnect_attempts < self.config.max_reconnect_attempts
                && !self.scheduler.is_scheduled(&session_id)
                && !self.in_flight.contains_key(&session_id);
            if !eligible {
                continue;
            }
            picked += 1;
            info!(
                session_id = %session_id,
                attempts = meta.reconnect_attempts,
                "retry loop reattempting session"
            );
            let opts = CreateOpts {
                reconnect: true,
                allow_pairing: false,
                source: meta.source,
                detected: false,
            };
            if let Err(error) = self.create_session(&meta.tenant_id, opts).await {
                warn!(session_id = %session_id, error = %error, "retry attempt failed");
            }
        }
    }

    /// Drives `run_retry_pass` on its interval until cancelled.
    pub async fn run_retry_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.retry_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The interval fires immediately, which would race bulk startup.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_retry_pass().await;
                }
                () = cancel.cancelled() => {
                    return;
                }
            }
        }
    }

    /// One pass of the liveness monitor: probe quiet sessions, expire the
    /// ones that keep failing. Expiry only marks the session unhealthy;
    /// recovery goes through `reinitialize_session`, explicitly.
    pub(crate) async fn run_probe_pass(&self) {
        for session_id in self.monitor.watched_sessions() {
            if !self.monitor.needs_probe(&session_id) {
                continue;
            }
            let handle = match self.registry.get(&session_id).and_then(|entry| entry.handle) {
                Some(handle) => handle,
                None => {
                    self.monitor.detach(&session_id);
                    continue;
                }
            };

            self.monitor.record_probe_sent();
            let outcome =
                tokio::time::timeout(self.monitor.config().probe_timeout, handle.probe()).await;
            match outcome {
                Ok(Ok(())) => {
                    self.monitor.note_activity(&session_id);
                    self.registry.update(&session_id, |_| {});
                }
                _ => {
                    let failures = self.monitor.record_probe_failure(&session_id);
                    warn!(session_id = %session_id, failures, "liveness probe failed");
                    if failures >= self.monitor.config().max_probe_failures {
                        self.monitor.expire(&session_id);
                        error!(
                            session_id = %session_id,
                            "liveness probes exhausted, session marked unhealthy"
                        );
                    }
                }
            }
        }
    }

    /// Cleans up sessions wedged in `connecting`. A partial handshake is
    /// not resumable, so these go through full cleanup, not reinit.
    pub(crate) async fn sweep_stuck_sessions(&self) {
        let threshold =
            chrono::Duration::from_std(self.monitor.config().stale_connecting_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        for session_id in self.registry.stale_connecting(threshold) {
            warn!(session_id = %session_id, "session wedged in connecting, cleaning up");
            let in_flight_cancel = self
                .in_flight
                .get(&session_id)
                .map(|entry| entry.cancel.clone());
            if let Some(cancel) = in_flight_cancel {
                cancel.cancel();
            }
            let tenant = session_id.tenant();
            if let Err(error) = self.complete_user_cleanup(&tenant).await {
                error!(session_id = %session_id, error = %error, "stuck-session cleanup failed");
            }
        }
    }

    // ── Event handlers (called by the transport adapter) ────────────

    pub(crate) async fn handle_connected(&self, session_id: &SessionId, peer_identity: String) {
        info!(session_id = %session_id, peer = %peer_identity, "session connected");
        self.store.end_pairing(session_id);
        self.registry.update(session_id, |entry| {
            entry.meta.status = SessionStatus::Connected;
            entry.meta.reconnect_attempts = 0;
            entry.meta.voluntary_disconnect = false;
            entry.peer_address = Some(peer_identity.clone());
        });
        self.scheduler.cancel(session_id);
        self.monitor.attach(session_id);
        self.push_status(&session_id.tenant(), true, SessionStatus::Connected)
            .await;
    }

    pub(crate) async fn handle_transport_error(
        self: &Arc<Self>,
        session_id: &SessionId,
        error: TransportError,
    ) {
        warn!(
            session_id = %session_id,
            kind = error.kind(),
            error = %error,
            "transport error"
        );
        let entry = match self.registry.get(session_id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.meta.voluntary_disconnect {
            debug!(session_id = %session_id, "session voluntarily disconnected, ignoring");
            return;
        }

        self.monitor.detach(session_id);
        self.lookup.invalidate_session(session_id);
        if let Some(handle) = entry.handle {
            handle.close().await;
        }

        if error.is_fatal() {
            self.registry.update(session_id, |entry| {
                entry.handle = None;
                entry.peer_address = None;
                entry.meta.status = SessionStatus::Failed;
                entry.meta.voluntary_disconnect = true;
            });
            self.push_status(&session_id.tenant(), false, SessionStatus::Failed)
                .await;
            error!(
                session_id = %session_id,
                kind = error.kind(),
                "fatal transport error, automatic retry disabled"
            );
            return;
        }

        let status = if error.is_retryable() {
            SessionStatus::Disconnected
        } else {
            SessionStatus::Failed
        };
        self.registry.update(session_id, |entry| {
            entry.handle = None;
            entry.peer_address = None;
            entry.meta.status = status;
        });
        self.push_status(&session_id.tenant(), false, status).await;

        if error.is_retryable() && !self.shutting_down.load(Ordering::SeqCst) {
            self.schedule_reconnect(session_id, error.suggested_delay());
        }
    }

    pub(crate) fn handle_credential_event(&self, session_id: &SessionId, event: CredentialEvent) {
        self.monitor.note_activity(session_id);
        self.registry.update(session_id, |_| {});
        match event {
            CredentialEvent::Write { key, value } if key.is_primary() => {
                match serde_json::from_value::<CredentialRecord>(value) {
                    Ok(record) => {
                        if let Err(error) = self.store.save_credentials(session_id, &record) {
                            error!(
                                session_id = %session_id,
                                error = %error,
                                "failed to persist primary record"
                            );
                        }
                    }
                    Err(error) => {
                        error!(
                            session_id = %session_id,
                            error = %error,
                            "malformed primary credential payload"
                        );
                    }
                }
            }
            CredentialEvent::Write { key, value } => {
                self.store.save_key_file(session_id, &key, value);
            }
            CredentialEvent::Delete { key } => {
                if let Err(error) = self.store.delete(session_id, &key) {
                    error!(
                        session_id = %session_id,
                        key = %key,
                        error = %error,
                        "failed to delete credential record"
                    );
                }
            }
        }
    }

    // ── Reconnect scheduling ────────────────────────────────────────

    fn schedule_reconnect(self: &Arc<Self>, session_id: &SessionId, suggested: Option<Duration>) {
        let entry = match self.registry.get(session_id) {
            Some(entry) => entry,
            None => return,
        };
        let attempt = entry.meta.reconnect_attempts;
        if attempt >= self.config.max_reconnect_attempts {
            warn!(session_id = %session_id, attempt, "reconnect budget exhausted");
            self.registry
                .update(session_id, |entry| entry.meta.status = SessionStatus::Failed);
            return;
        }
        self.registry
            .update(session_id, |entry| entry.meta.reconnect_attempts += 1);

        let delay = self.reconnect_delay(attempt, suggested);
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %session_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let orchestrator = Arc::clone(self);
        let sid = session_id.clone();
        self.scheduler.schedule(session_id.clone(), delay, async move {
            let tenant = sid.tenant();
            let source = orchestrator
                .registry
                .get(&sid)
                .map(|entry| entry.meta.source)
                .unwrap_or(SessionSource::Primary);
            let opts = CreateOpts {
                reconnect: true,
                allow_pairing: false,
                source,
                detected: false,
            };
            if let Err(error) = orchestrator.create_session(&tenant, opts).await {
                warn!(session_id = %sid, error = %error, "scheduled reconnect failed");
            }
        });
    }

    /// Exponential backoff with jitter; a server-suggested delay wins.
    fn reconnect_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp =
            self.config.reconnect_base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.config.reconnect_max_delay.as_millis() as f64);
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        Duration::from_millis((capped + jitter).max(100.0) as u64)
    }

    // ── Lookups & stats ─────────────────────────────────────────────

    pub fn get_session(&self, tenant: &TenantId) -> Option<SessionEntry> {
        self.registry.get(&SessionId::for_tenant(tenant))
    }

    /// Resolves an inbound peer address to its session, via the cache with
    /// a linear fallback scan that repopulates it.
    pub fn get_session_by_peer_address(&self, address: &str) -> Option<SessionId> {
        if let Some(session_id) = self.lookup.get(address) {
            if self.registry.contains(&session_id) {
                return Some(session_id);
            }
            self.lookup.invalidate_session(&session_id);
        }

        let needle = normalize_address(address);
        for (session_id, peer) in self.registry.connected_peers() {
            if normalize_address(&peer) == needle {
                self.lookup.insert(address, session_id.clone());
                return Some(session_id);
            }
        }
        None
    }

    /// Stamps inbound activity for a session, keeping the liveness monitor
    /// from probing a tenant that is actively talking.
    pub fn note_activity(&self, tenant: &TenantId) {
        let session_id = SessionId::for_tenant(tenant);
        self.monitor.note_activity(&session_id);
        self.registry.update(&session_id, |_| {});
    }

    /// Sessions the monitor has given up on, awaiting explicit reinit.
    pub fn unhealthy_sessions(&self) -> Vec<SessionId> {
        self.monitor.unhealthy_sessions()
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let entries = self.registry.entries();
        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut detected = 0usize;
        for (_, meta) in &entries {
            *status_counts.entry(meta.status.to_string()).or_insert(0) += 1;
            if meta.detected {
                detected += 1;
            }
        }
        OrchestratorStats {
            total_sessions: entries.len(),
            status_counts,
            detected_sessions: detected,
            monitored_sessions: self.monitor.watched(),
            unhealthy_sessions: self.monitor.unhealthy_sessions().len(),
            pending_reconnects: self.scheduler.len(),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            connects_failed: self.connects_failed.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            cleanups_performed: self.cleanups_performed.load(Ordering::Relaxed),
            probes_sent: self.monitor.probes_sent(),
            probes_failed: self.monitor.probes_failed(),
            sessions_expired: self.monitor.sessions_expired(),
            lookup_hits: self.lookup.hits(),
            lookup_misses: self.lookup.misses(),
            remote_healthy: self.store.remote_healthy(),
            pending_writes: self.store.pending_writes(),
            flush_failures: self.store.flush_failures(),
            sync: self.store.sync_counters(),
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stops all session activity: rejects new creates, cancels pending
    /// reconnects, aborts in-flight connects, and closes every handle.
    /// The credential store is left running for the owner to drain.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let cancelled = self.scheduler.cancel_all();
        for entry in self.in_flight.iter() {
            entry.value().cancel.cancel();
        }
        self.monitor.clear();

        let mut closed = 0usize;
        for session_id in self.registry.session_ids() {
            let entry = match self.registry.get(&session_id) {
                Some(entry) => entry,
                None => continue,
            };
            if let Some(handle) = entry.handle {
                handle.close().await;
                closed += 1;
            }
            let was_live = matches!(
                entry.meta.status,
                SessionStatus::Connected | SessionStatus::Connecting
            );
            self.registry.update(&session_id, |entry| {
                entry.handle = None;
                entry.peer_address = None;
                if matches!(
                    entry.meta.status,
                    SessionStatus::Connected | SessionStatus::Connecting
                ) {
                    entry.meta.status = SessionStatus::Disconnected;
                }
            });
            if was_live {
                self.push_status(&session_id.tenant(), false, SessionStatus::Disconnected)
                    .await;
            }
        }
        info!(closed, cancelled, "orchestrator shut down");
    }

    // ── Directory plumbing (best-effort) ────────────────────────────

    async fn push_directory_entry(
        &self,
        tenant: &TenantId,
        source: SessionSource,
        detected: bool,
        reconnect_attempts: u32,
    ) {
        let entry = DirectoryEntry {
            tenant_id: tenant.clone(),
            source,
            detected,
            is_connected: false,
            status: SessionStatus::Connecting,
            reconnect_attempts,
            updated_at: chrono::Utc::now(),
        };
        if let Err(error) = self.directory.upsert(entry).await {
            warn!(tenant = %tenant, error = %error, "directory upsert failed");
        }
    }

    async fn push_status(&self, tenant: &TenantId, is_connected: bool, status: SessionStatus) {
        let reconnect_attempts = self
            .registry
            .get(&SessionId::for_tenant(tenant))
            .map(|entry| entry.meta.reconnect_attempts)
            .unwrap_or(0);
        let update = StatusUpdate {
            is_connected,
            status,
            reconnect_attempts,
        };
        if let Err(error) = self.directory.update_status(tenant, update).await {
            warn!(tenant = %tenant, error = %error, "directory status update failed");
        }
    }
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemoryDirectory, SimBehavior, SimClient};
    use roost_store::{MemoryVault, StoreConfig, SyncConfig};
    use serde_json::json;

    fn tenant(raw: &str) -> TenantId {
        TenantId::from_raw(raw)
    }

    fn sid(raw: &str) -> SessionId {
        SessionId::for_tenant(&tenant(raw))
    }

    fn complete_record() -> CredentialRecord {
        serde_json::from_value(json!({
            "identityKeys": {"public": "pk", "private": "sk"},
            "account": {"id": "acct"},
            "registered": true,
        }))
        .unwrap()
    }

    fn quick_sync() -> SyncConfig {
        SyncConfig {
            queue_capacity: 64,
            probe_interval: Duration::from_secs(60),
            resweep_interval: Duration::from_secs(3600),
            op_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_sessions: 16,
            startup_concurrency: 3,
            startup_stagger: Duration::from_millis(100),
            startup_batch_delay: Duration::from_millis(500),
            retry_interval: Duration::from_secs(60),
            retry_batch_limit: 5,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            reinit_cooldown: Duration::from_secs(60),
            reinit_settle: Duration::from_millis(100),
        }
    }

    fn test_health() -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            max_probe_failures: 3,
            stale_sweep_interval: Duration::from_secs(120),
            stale_connecting_after: Duration::from_secs(120),
        }
    }

    struct Harness {
        orchestrator: Arc<SessionOrchestrator>,
        client: Arc<SimClient>,
        directory: Arc<MemoryDirectory>,
        store: CredentialStore,
        remote: Arc<MemoryVault>,
    }

    fn setup_with(config: OrchestratorConfig) -> Harness {
        let remote = Arc::new(MemoryVault::new());
        let store =
            CredentialStore::in_memory(remote.clone(), StoreConfig::default(), quick_sync())
                .unwrap();
        let client = Arc::new(SimClient::new());
        let directory = Arc::new(MemoryDirectory::new());
        let orchestrator = SessionOrchestrator::new(
            client.clone(),
            store.clone(),
            directory.clone(),
            config,
            test_health(),
            LookupConfig::default(),
        );
        Harness {
            orchestrator,
            client,
            directory,
            store,
            remote,
        }
    }

    fn setup() -> Harness {
        setup_with(test_config())
    }

    fn seed_credentials(store: &CredentialStore, raw: &str) {
        store.save_credentials(&sid(raw), &complete_record()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn create_session_establishes_and_registers() {
        let h = setup();
        seed_credentials(&h.store, "15551230001");

        let handle = h
            .orchestrator
            .create_session(&tenant("15551230001"), CreateOpts::default())
            .await
            .unwrap();
        assert!(handle.is_open());

        let entry = h.orchestrator.get_session(&tenant("15551230001")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);
        assert_eq!(entry.peer_address.as_deref(), Some("15551230001@sim"));
        assert_eq!(entry.meta.reconnect_attempts, 0);

        let dir = h.directory.entry(&tenant("15551230001")).unwrap();
        assert!(dir.is_connected);
        assert_eq!(dir.status, SessionStatus::Connected);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn create_without_credentials_requires_pairing() {
        let h = setup();
        let result = h
            .orchestrator
            .create_session(
                &tenant("t1"),
                CreateOpts {
                    allow_pairing: false,
                    ..CreateOpts::default()
                },
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::NoCredentials(_))));
        assert!(h.orchestrator.get_session(&tenant("t1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_persists_incrementally_built_record() {
        let h = setup();
        let t = tenant("t1");
        h.client.script(
            &t,
            [SimBehavior::Open {
                peer_address: "t1@sim".into(),
                credential_events: vec![
                    // The handshake builds the record up field by field;
                    // early writes are incomplete.
                    CredentialEvent::Write {
                        key: roost_core::RecordKey::Primary,
                        value: json!({"identityKeys": {"public": "pk"}}),
                    },
                    CredentialEvent::Write {
                        key: roost_core::RecordKey::Primary,
                        value: json!({
                            "identityKeys": {"public": "pk", "private": "sk"},
                            "account": {"id": "acct"},
                            "registered": true,
                        }),
                    },
                    CredentialEvent::Write {
                        key: roost_core::RecordKey::keyed("pre_key", "7"),
                        value: json!({"material": "pk7"}),
                    },
                ],
            }],
        );

        h.orchestrator
            .create_session(&t, CreateOpts::default())
            .await
            .unwrap();

        let record = h.store.load_credentials(&sid("t1")).unwrap().unwrap();
        assert!(record.is_complete());
        assert!(!h.store.is_pairing(&sid("t1")));
        // The keyed write is debounced; flush lands it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.store.list_ids(&sid("t1"), "pre_key").unwrap(), vec!["7"]);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_handle_is_reused_without_reconnect() {
        let h = setup();
        seed_credentials(&h.store, "t1");

        let first = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 1);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_reconnect_replaces_handle() {
        let h = setup();
        seed_credentials(&h.store, "t1");

        let first = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .create_session(
                &tenant("t1"),
                CreateOpts {
                    reconnect: true,
                    ..CreateOpts::default()
                },
            )
            .await
            .unwrap();

        assert_ne!(first.id(), second.id());
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 2);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creates_share_one_attempt() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.client.script(
            &tenant("t1"),
            [
                SimBehavior::Delay(Duration::from_millis(200)),
                SimBehavior::Open {
                    peer_address: "t1@sim".into(),
                    credential_events: vec![],
                },
            ],
        );

        let t1 = tenant("t1");
        let (a, b) = tokio::join!(
            h.orchestrator.create_session(&t1, CreateOpts::default()),
            h.orchestrator.create_session(&t1, CreateOpts::default()),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 1);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_observes_in_flight_failure() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.client.script(
            &tenant("t1"),
            [
                SimBehavior::Delay(Duration::from_millis(200)),
                SimBehavior::Fail(TransportError::ConnectFailed("refused".into())),
            ],
        );

        let t1 = tenant("t1");
        let (owner, waiter) = tokio::join!(
            h.orchestrator.create_session(&t1, CreateOpts::default()),
            h.orchestrator.create_session(&t1, CreateOpts::default()),
        );

        assert!(matches!(owner, Err(OrchestratorError::Transport(_))));
        assert!(matches!(waiter, Err(OrchestratorError::InFlightFailed)));
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_limit_is_enforced() {
        let h = setup_with(OrchestratorConfig {
            max_sessions: 1,
            ..test_config()
        });
        seed_credentials(&h.store, "t1");
        seed_credentials(&h.store, "t2");

        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        let result = h
            .orchestrator
            .create_session(&tenant("t2"), CreateOpts::default())
            .await;
        assert!(matches!(result, Err(OrchestratorError::SessionLimit(1))));
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_schedules_backoff_reconnect() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.client.script(
            &tenant("t1"),
            [SimBehavior::Fail(TransportError::Timeout)],
        );

        let result = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await;
        assert!(result.is_err());

        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Failed);
        assert_eq!(entry.meta.reconnect_attempts, 1);
        assert_eq!(h.orchestrator.get_stats().pending_reconnects, 1);

        // Base delay 2s, attempt 0, no jitter. The scripted queue is empty
        // now, so the retry takes the default open path.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);
        assert_eq!(entry.meta.reconnect_attempts, 0);
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 2);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_overrides_backoff() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.client.script(
            &tenant("t1"),
            [SimBehavior::Fail(TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            })],
        );

        let _ = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 1);

        tokio::time::sleep(Duration::from_secs(27)).await;
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 2);
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_disables_automatic_recovery() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        let handle = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        h.client.emit_error(&tenant("t1"), TransportError::Conflict).await;

        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Failed);
        assert!(entry.meta.voluntary_disconnect);
        assert!(!handle.is_open());

        h.orchestrator.run_retry_pass().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 1);
        assert_eq!(h.orchestrator.get_stats().pending_reconnects, 0);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_recovers_via_backoff() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        let first = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        h.client
            .emit_error(&tenant("t1"), TransportError::ConnectionLost("reset".into()))
            .await;

        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Disconnected);
        assert!(!first.is_open());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);
        assert_eq!(entry.meta.reconnect_attempts, 0);
        let second = entry.handle.unwrap();
        assert_ne!(first.id(), second.id());
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn voluntary_disconnect_suppresses_retries() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        h.orchestrator
            .disconnect_session(&tenant("t1"), true)
            .await
            .unwrap();

        h.orchestrator.run_retry_pass().await;
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 1);

        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Disconnected);
        assert!(entry.meta.voluntary_disconnect);
        assert!(h.store.load_credentials(&sid("t1")).unwrap().is_some());

        // An explicit create clears the voluntary flag.
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);
        assert!(!entry.meta.voluntary_disconnect);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_reattempts_failed_sessions() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        // Protocol errors are neither retryable nor fatal: the session
        // parks in failed with no scheduled reconnect.
        h.client.script(
            &tenant("t1"),
            [SimBehavior::Fail(TransportError::Protocol("bad frame".into()))],
        );
        let _ = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await;
        assert_eq!(h.orchestrator.get_stats().pending_reconnects, 0);

        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(
            Arc::clone(&h.orchestrator).run_retry_loop(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);

        cancel.cancel();
        loop_handle.await.unwrap();
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reinit_replaces_handle_and_cools_down() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        let first = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .reinitialize_session(&tenant("t1"))
            .await
            .unwrap();
        assert_eq!(outcome, ReinitOutcome::Reinitialized);
        assert!(!first.is_open());
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_ne!(entry.handle.unwrap().id(), first.id());
        assert!(h.store.load_credentials(&sid("t1")).unwrap().is_some());

        let outcome = h
            .orchestrator
            .reinitialize_session(&tenant("t1"))
            .await
            .unwrap();
        assert_eq!(outcome, ReinitOutcome::CoolingDown);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let outcome = h
            .orchestrator
            .reinitialize_session(&tenant("t1"))
            .await
            .unwrap();
        assert_eq!(outcome, ReinitOutcome::Reinitialized);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reinit_is_guarded() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        h.client.script(
            &tenant("t1"),
            [
                SimBehavior::Delay(Duration::from_millis(300)),
                SimBehavior::Open {
                    peer_address: "t1@sim".into(),
                    credential_events: vec![],
                },
            ],
        );

        let orchestrator = Arc::clone(&h.orchestrator);
        let running = tokio::spawn(async move {
            orchestrator.reinitialize_session(&tenant("t1")).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = h
            .orchestrator
            .reinitialize_session(&tenant("t1"))
            .await
            .unwrap();
        assert_eq!(second, ReinitOutcome::AlreadyInFlight);

        let first = running.await.unwrap().unwrap();
        assert_eq!(first, ReinitOutcome::Reinitialized);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn probe_exhaustion_marks_unhealthy_and_reinit_recovers() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        let handle = h.client.handle(&tenant("t1")).unwrap();
        for _ in 0..3 {
            handle.push_probe_result(Err(TransportError::Timeout));
        }

        // Quiet long enough to earn probes, then three failing passes.
        tokio::time::advance(Duration::from_secs(301)).await;
        for _ in 0..3 {
            h.orchestrator.run_probe_pass().await;
        }

        assert_eq!(h.orchestrator.unhealthy_sessions(), vec![sid("t1")]);
        let stats = h.orchestrator.get_stats();
        assert_eq!(stats.monitored_sessions, 0);
        assert_eq!(stats.probes_sent, 3);
        assert_eq!(stats.probes_failed, 3);
        assert_eq!(stats.sessions_expired, 1);
        // No automatic teardown: escalation is explicit.
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);

        let outcome = h
            .orchestrator
            .reinitialize_session(&tenant("t1"))
            .await
            .unwrap();
        assert_eq!(outcome, ReinitOutcome::Reinitialized);
        assert!(h.orchestrator.unhealthy_sessions().is_empty());
        assert_eq!(h.orchestrator.get_stats().monitored_sessions, 1);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probe_resets_the_clock() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        h.orchestrator.run_probe_pass().await;

        let stats = h.orchestrator.get_stats();
        assert_eq!(stats.probes_sent, 1);
        assert_eq!(stats.probes_failed, 0);
        assert!(h.orchestrator.unhealthy_sessions().is_empty());

        // Fresh activity clock: the next pass has nothing to probe.
        h.orchestrator.run_probe_pass().await;
        assert_eq!(h.orchestrator.get_stats().probes_sent, 1);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connecting_routes_to_full_cleanup() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.client.script(
            &tenant("t1"),
            [SimBehavior::Delay(Duration::from_secs(600))],
        );

        let orchestrator = Arc::clone(&h.orchestrator);
        let create = tokio::spawn(async move {
            orchestrator
                .create_session(&tenant("t1"), CreateOpts::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut meta = h.orchestrator.get_session(&tenant("t1")).unwrap().meta;
        assert_eq!(meta.status, SessionStatus::Connecting);

        // Staleness is wall-clock based; backdate the entry instead of
        // waiting out the threshold.
        meta.last_activity = chrono::Utc::now() - chrono::Duration::minutes(20);
        h.orchestrator.registry.insert(sid("t1"), meta);
        h.orchestrator.sweep_stuck_sessions().await;

        let result = create.await.unwrap();
        assert!(matches!(
            result,
            Err(OrchestratorError::Transport(TransportError::Timeout))
        ));
        assert!(h.orchestrator.get_session(&tenant("t1")).is_none());
        assert!(h.store.load_credentials(&sid("t1")).unwrap().is_none());
        assert!(h.directory.entry(&tenant("t1")).is_none());
        assert_eq!(h.orchestrator.get_stats().cleanups_performed, 1);

        // Nothing lingers to resurrect the session.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.orchestrator.get_session(&tenant("t1")).is_none());
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_startup_batches_with_stagger() {
        let h = setup();
        for i in 0..10 {
            seed_credentials(&h.store, &format!("t{i}"));
            h.directory.seed(&tenant(&format!("t{i}")), SessionSource::Primary, false);
        }
        // Unclaimed secondary: left for the takeover detector.
        seed_credentials(&h.store, "foreign");
        h.directory.seed(&tenant("foreign"), SessionSource::Secondary, false);
        // Directory row without stored credentials.
        h.directory.seed(&tenant("credless"), SessionSource::Primary, false);

        let started = tokio::time::Instant::now();
        let report = h.orchestrator.initialize_existing_sessions().await;

        assert_eq!(report.attempted, 10);
        assert_eq!(report.connected, 10);
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.restored_records, 0);
        // 4 batches: stagger inside each plus delays between them.
        assert!(started.elapsed() >= Duration::from_millis(1500));

        let stats = h.orchestrator.get_stats();
        assert_eq!(stats.status_counts.get("connected"), Some(&10));
        assert!(h.orchestrator.get_session(&tenant("foreign")).is_none());
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_startup_serially_retries_transient_failures() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.directory.seed(&tenant("t1"), SessionSource::Primary, false);
        h.client.script(
            &tenant("t1"),
            [SimBehavior::Fail(TransportError::ConnectFailed("dns".into()))],
        );

        let report = h.orchestrator.initialize_existing_sessions().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.connected, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.client.connect_attempts(&tenant("t1")), 2);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn startup_without_directory_still_starts_stored_sessions() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.directory.set_unavailable(true);

        let report = h.orchestrator.initialize_existing_sessions().await;
        assert_eq!(report.connected, 1);

        h.directory.set_unavailable(false);
        let entry = h.orchestrator.get_session(&tenant("t1")).unwrap();
        assert_eq!(entry.meta.status, SessionStatus::Connected);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn peer_lookup_scans_then_caches() {
        let h = setup();
        seed_credentials(&h.store, "15551230001");
        h.orchestrator
            .create_session(&tenant("15551230001"), CreateOpts::default())
            .await
            .unwrap();

        // First resolution misses the cache and falls back to the scan.
        let resolved = h
            .orchestrator
            .get_session_by_peer_address("15551230001@SIM/device:2");
        assert_eq!(resolved, Some(sid("15551230001")));
        let stats = h.orchestrator.get_stats();
        assert_eq!(stats.lookup_misses, 1);
        assert_eq!(stats.lookup_hits, 0);

        let resolved = h
            .orchestrator
            .get_session_by_peer_address("15551230001@sim");
        assert_eq!(resolved, Some(sid("15551230001")));
        assert_eq!(h.orchestrator.get_stats().lookup_hits, 1);

        assert_eq!(h.orchestrator.get_session_by_peer_address("unknown@sim"), None);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_invalidates_peer_lookup() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.get_session_by_peer_address("t1@sim"),
            Some(sid("t1"))
        );

        h.orchestrator
            .disconnect_session(&tenant("t1"), true)
            .await
            .unwrap();
        assert_eq!(h.orchestrator.get_session_by_peer_address("t1@sim"), None);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_wipes_both_stores_and_directory() {
        let h = setup();
        let t = tenant("t1");
        // Pair from scratch so primary and keyed material exist.
        h.orchestrator
            .create_session(&t, CreateOpts::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.remote.len() > 0);

        let removed = h.orchestrator.complete_user_cleanup(&t).await.unwrap();
        assert!(removed >= 1);
        assert!(h.orchestrator.get_session(&t).is_none());
        assert!(h.store.load_credentials(&sid("t1")).unwrap().is_none());
        assert!(h.directory.entry(&t).is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.remote.len(), 0);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn credential_events_flow_into_the_store() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();

        h.client
            .emit_credential_event(
                &tenant("t1"),
                CredentialEvent::Write {
                    key: roost_core::RecordKey::keyed("sender_key", "g1"),
                    value: json!({"chain": 3}),
                },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            h.store.list_ids(&sid("t1"), "sender_key").unwrap(),
            vec!["g1"]
        );

        h.client
            .emit_credential_event(
                &tenant("t1"),
                CredentialEvent::Delete {
                    key: roost_core::RecordKey::keyed("sender_key", "g1"),
                },
            )
            .await;
        assert!(h.store.list_ids(&sid("t1"), "sender_key").unwrap().is_empty());
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_sessions_and_rejects_creates() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        seed_credentials(&h.store, "t2");
        let h1 = h
            .orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        let h2 = h
            .orchestrator
            .create_session(&tenant("t2"), CreateOpts::default())
            .await
            .unwrap();

        h.orchestrator.shutdown().await;

        assert!(!h1.is_open());
        assert!(!h2.is_open());
        for t in ["t1", "t2"] {
            let entry = h.orchestrator.get_session(&tenant(t)).unwrap();
            assert_eq!(entry.meta.status, SessionStatus::Disconnected);
            assert!(entry.handle.is_none());
        }

        seed_credentials(&h.store, "t3");
        let result = h
            .orchestrator
            .create_session(&tenant("t3"), CreateOpts::default())
            .await;
        assert!(matches!(result, Err(OrchestratorError::ShuttingDown)));
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_lifecycle_counters() {
        let h = setup();
        seed_credentials(&h.store, "t1");
        h.orchestrator
            .create_session(&tenant("t1"), CreateOpts::default())
            .await
            .unwrap();
        h.client.script(
            &tenant("t2"),
            [SimBehavior::Fail(TransportError::ConnectFailed("dns".into()))],
        );
        seed_credentials(&h.store, "t2");
        let _ = h
            .orchestrator
            .create_session(&tenant("t2"), CreateOpts::default())
            .await;

        let stats = h.orchestrator.get_stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(stats.connects_failed, 1);
        assert_eq!(stats.reconnects_scheduled, 1);
        assert_eq!(stats.status_counts.get("connected"), Some(&1));
        assert_eq!(stats.status_counts.get("failed"), Some(&1));
        assert!(stats.remote_healthy);
        h.store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delay_grows_and_caps() {
        let h = setup();
        assert_eq!(
            h.orchestrator.reconnect_delay(0, None),
            Duration::from_millis(2000)
        );
        assert_eq!(
            h.orchestrator.reconnect_delay(2, None),
            Duration::from_millis(8000)
        );
        // Capped at the configured max.
        assert_eq!(
            h.orchestrator.reconnect_delay(30, None),
            Duration::from_secs(60)
        );
        // A server hint always wins.
        assert_eq!(
            h.orchestrator.reconnect_delay(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        h.store.shutdown().await;
    }
}
