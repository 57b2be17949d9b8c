//! Per-session liveness monitoring.
//!
//! Sessions that stay quiet for too long get an active probe over their
//! live connection. Repeated probe failures stop monitoring and mark the
//! session unhealthy; escalation to reinitialization is a separate,
//! explicitly invoked operation so a flapping connection cannot trigger a
//! teardown storm by itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use roost_core::SessionId;

use crate::orchestrator::SessionOrchestrator;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often the probe pass runs.
    pub check_interval: Duration,
    /// Quiet time after which a session earns an active probe.
    pub inactivity_threshold: Duration,
    pub probe_timeout: Duration,
    /// Consecutive probe failures before the session is given up on.
    pub max_probe_failures: u32,
    /// How often the stuck-connecting sweep runs.
    pub stale_sweep_interval: Duration,
    /// Age at which a `connecting` session counts as wedged.
    pub stale_connecting_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            inactivity_threshold: Duration::from_secs(30 * 60),
            probe_timeout: Duration::from_secs(10),
            max_probe_failures: 3,
            stale_sweep_interval: Duration::from_secs(10 * 60),
            stale_connecting_after: Duration::from_secs(10 * 60),
        }
    }
}

struct Liveness {
    last_activity: Instant,
    probe_failures: u32,
}

/// Tracks activity and probe failures for each monitored session.
pub struct HealthMonitor {
    config: HealthConfig,
    sessions: DashMap<SessionId, Liveness>,
    unhealthy: DashMap<SessionId, ()>,
    probes_sent: AtomicU64,
    probes_failed: AtomicU64,
    sessions_expired: AtomicU64,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            unhealthy: DashMap::new(),
            probes_sent: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Starts monitoring a session, clearing any previous unhealthy mark.
    pub fn attach(&self, session_id: &SessionId) {
        self.unhealthy.remove(session_id);
        self.sessions.insert(
            session_id.clone(),
            Liveness {
                last_activity: Instant::now(),
                probe_failures: 0,
            },
        );
    }

    pub fn detach(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drops every trace of the session, including an unhealthy mark.
    pub fn forget(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
        self.unhealthy.remove(session_id);
    }

    /// Stamps activity. Any sign of life resets the failure count.
    pub fn note_activity(&self, session_id: &SessionId) {
        if let Some(mut liveness) = self.sessions.get_mut(session_id) {
            liveness.last_activity = Instant::now();
            liveness.probe_failures = 0;
        }
    }

    /// Whether the session has been quiet long enough to deserve a probe.
    pub fn needs_probe(&self, session_id: &SessionId) -> bool {
        self.sessions
            .get(session_id)
            .map(|liveness| liveness.last_activity.elapsed() >= self.config.inactivity_threshold)
            .unwrap_or(false)
    }

    pub(crate) fn record_probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed probe; returns the consecutive failure count.
    pub(crate) fn record_probe_failure(&self, session_id: &SessionId) -> u32 {
        self.probes_failed.fetch_add(1, Ordering::Relaxed);
        match self.sessions.get_mut(session_id) {
            Some(mut liveness) => {
                liveness.probe_failures += 1;
                liveness.probe_failures
            }
            None => 0,
        }
    }

    /// Gives up on a session: monitoring stops and it lands in the
    /// unhealthy set until something re-attaches it.
    pub(crate) fn expire(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
        self.unhealthy.insert(session_id.clone(), ());
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_watched(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn watched(&self) -> usize {
        self.sessions.len()
    }

    pub fn watched_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_unhealthy(&self, session_id: &SessionId) -> bool {
        self.unhealthy.contains_key(session_id)
    }

    pub fn unhealthy_sessions(&self) -> Vec<SessionId> {
        self.unhealthy.iter().map(|e| e.key().clone()).collect()
    }

    /// Stops monitoring everything, e.g. at shutdown.
    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    pub fn probes_failed(&self) -> u64 {
        self.probes_failed.load(Ordering::Relaxed)
    }

    pub fn sessions_expired(&self) -> u64 {
        self.sessions_expired.load(Ordering::Relaxed)
    }
}

/// Drives the orchestrator's probe pass and stuck-session sweep until
/// cancelled.
pub async fn run_health_monitor(orchestrator: Arc<SessionOrchestrator>, cancel: CancellationToken) {
    let config = orchestrator.health_config().clone();
    let mut probe_tick = time::interval(config.check_interval);
    let mut sweep_tick = time::interval(config.stale_sweep_interval);
    probe_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = probe_tick.tick() => {
                orchestrator.run_probe_pass().await;
            }
            _ = sweep_tick.tick() => {
                orchestrator.sweep_stuck_sessions().await;
            }
            () = cancel.cancelled() => {
                return;
            }
        }
    }
}
