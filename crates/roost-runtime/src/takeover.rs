//! Secondary-session takeover.
//!
//! Other deployments of this service can park sessions in the shared
//! directory for this process to adopt. The detector polls for unclaimed
//! secondary entries, marks them claimed first so competing processes back
//! off, then verifies that credentials actually exist (pulling them from
//! the remote vault when the local one has nothing). A claim that cannot
//! be verified is rolled back and its directory record removed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roost_core::{SessionId, SessionSource, TenantId};

use crate::orchestrator::{CreateOpts, SessionOrchestrator};

#[derive(Debug, Clone)]
pub struct TakeoverConfig {
    /// How often the directory is scanned for unclaimed secondaries.
    pub poll_interval: Duration,
}

impl Default for TakeoverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// What happened to one takeover candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverOutcome {
    /// Claim verified; the session now belongs to this process.
    Claimed,
    /// Something else already owns the claim (this process, a concurrent
    /// claim attempt, or another process entirely).
    AlreadyClaimed,
    /// Verification failed; the claim mark was undone and the directory
    /// record removed.
    RolledBack,
}

/// Polls the directory and adopts unclaimed secondary sessions.
pub struct TakeoverDetector {
    orchestrator: Arc<SessionOrchestrator>,
    config: TakeoverConfig,
    in_flight: DashMap<TenantId, ()>,
    detected: AtomicU64,
    rolled_back: AtomicU64,
}

impl TakeoverDetector {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, config: TakeoverConfig) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            config,
            in_flight: DashMap::new(),
            detected: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        })
    }

    /// Scans on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.scan_once().await;
                }
                () = cancel.cancelled() => {
                    debug!("takeover detector stopping");
                    return;
                }
            }
        }
    }

    /// One directory scan. A directory outage skips the pass; the next
    /// tick tries again.
    pub async fn scan_once(&self) -> Vec<(TenantId, TakeoverOutcome)> {
        let entries = match self.orchestrator.directory().list_tenants().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(error = %error, "directory scan failed, skipping takeover pass");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for entry in entries {
            if entry.source != SessionSource::Secondary || entry.detected {
                continue;
            }
            let outcome = self.claim(&entry.tenant_id).await;
            match outcome {
                TakeoverOutcome::Claimed => {
                    info!(tenant = %entry.tenant_id, "adopted secondary session")
                }
                TakeoverOutcome::AlreadyClaimed => {
                    debug!(tenant = %entry.tenant_id, "secondary session already claimed")
                }
                TakeoverOutcome::RolledBack => {}
            }
            outcomes.push((entry.tenant_id, outcome));
        }
        outcomes
    }

    /// Attempts to claim one session. Marks the claim in the directory
    /// before verifying credentials, so a competing process scanning at the
    /// same moment sees the session as taken.
    pub async fn claim(&self, tenant: &TenantId) -> TakeoverOutcome {
        if self.in_flight.insert(tenant.clone(), ()).is_some() {
            return TakeoverOutcome::AlreadyClaimed;
        }
        let outcome = self.claim_locked(tenant).await;
        self.in_flight.remove(tenant);
        outcome
    }

    async fn claim_locked(&self, tenant: &TenantId) -> TakeoverOutcome {
        if let Some(entry) = self.orchestrator.get_session(tenant) {
            if entry.meta.detected {
                return TakeoverOutcome::AlreadyClaimed;
            }
        }
        match self.orchestrator.directory().get(tenant).await {
            Ok(Some(entry)) if entry.detected => return TakeoverOutcome::AlreadyClaimed,
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(tenant = %tenant, "directory record gone before claim");
                return TakeoverOutcome::AlreadyClaimed;
            }
            Err(error) => {
                warn!(tenant = %tenant, error = %error, "directory read failed, skipping claim");
                return TakeoverOutcome::AlreadyClaimed;
            }
        }

        if let Err(error) = self
            .orchestrator
            .directory()
            .set_source(tenant, SessionSource::Secondary, true)
            .await
        {
            warn!(tenant = %tenant, error = %error, "could not mark session claimed");
            return TakeoverOutcome::RolledBack;
        }

        let session_id = SessionId::for_tenant(tenant);
        if !self.verify_credentials(&session_id).await {
            self.rollback(tenant).await;
            self.rolled_back.fetch_add(1, Ordering::Relaxed);
            return TakeoverOutcome::RolledBack;
        }

        self.detected.fetch_add(1, Ordering::Relaxed);
        info!(tenant = %tenant, "takeover claim verified, starting session");
        let opts = CreateOpts {
            reconnect: false,
            allow_pairing: false,
            source: SessionSource::Secondary,
            detected: true,
        };
        if let Err(error) = self.orchestrator.create_session(tenant, opts).await {
            // The claim stands; the connection retries like any other.
            warn!(tenant = %tenant, error = %error, "adopted session failed to connect");
        }
        TakeoverOutcome::Claimed
    }

    /// A claim is only valid when credentials exist. Local material wins;
    /// otherwise the session's records are pulled from the remote vault in
    /// the foreground, with failures treated as verification failures.
    async fn verify_credentials(&self, session_id: &SessionId) -> bool {
        let store = self.orchestrator.store();
        match store.load_credentials(session_id) {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "credential read failed during verify");
                return false;
            }
        }
        match store.pull_session_from_remote(session_id).await {
            Ok(pulled) => {
                info!(session_id = %session_id, pulled, "pulled adopted session from remote vault")
            }
            Err(error) => {
                warn!(session_id = %session_id, error = %error, "remote pull failed during verify");
                return false;
            }
        }
        matches!(store.load_credentials(session_id), Ok(Some(_)))
    }

    async fn rollback(&self, tenant: &TenantId) {
        warn!(tenant = %tenant, "takeover verify failed, rolling claim back");
        let directory = self.orchestrator.directory();
        if let Err(error) = directory
            .set_source(tenant, SessionSource::Secondary, false)
            .await
        {
            warn!(tenant = %tenant, error = %error, "could not clear claim mark");
        }
        if let Err(error) = directory.remove(tenant).await {
            warn!(tenant = %tenant, error = %error, "could not remove rolled-back session record");
        }
    }

    pub fn detected(&self) -> u64 {
        self.detected.load(Ordering::Relaxed)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }
}
