//! Background sync agent.
//!
//! All remote vault traffic flows through one worker task fed by a bounded
//! job queue. Enqueueing never blocks: when the queue is full the job is
//! dropped and counted, on the theory that the periodic re-sweep will
//! recover anything a dropped mirror missed. The worker also owns the
//! health probe ticker and the re-sweep ticker, so remote I/O has exactly
//! one home.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roost_core::{RecordKey, SessionId};

use crate::health::RemoteHealth;
use crate::local::LocalVault;
use crate::remote::RemoteVault;

/// One unit of remote mirror work.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncJob {
    MirrorWrite {
        session_id: SessionId,
        key: RecordKey,
        payload: String,
    },
    MirrorDelete {
        session_id: SessionId,
        key: RecordKey,
    },
    WipeSession {
        session_id: SessionId,
    },
    /// Full local-to-remote sweep, also run on health recovery.
    Resweep,
}

impl SyncJob {
    fn kind(&self) -> &'static str {
        match self {
            Self::MirrorWrite { .. } => "mirror_write",
            Self::MirrorDelete { .. } => "mirror_delete",
            Self::WipeSession { .. } => "wipe_session",
            Self::Resweep => "resweep",
        }
    }
}

/// Sync agent tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub queue_capacity: usize,
    pub probe_interval: Duration,
    pub resweep_interval: Duration,
    pub op_timeout: Duration,
    pub drain_timeout: Duration,
    pub unhealthy_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            probe_interval: Duration::from_secs(60),
            resweep_interval: Duration::from_secs(3600),
            op_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
        }
    }
}

/// Live counters for the sync pipeline.
#[derive(Default)]
pub struct SyncStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    resweeps: AtomicU64,
}

impl SyncStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Point-in-time snapshot of the sync pipeline, for stats surfaces.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounters {
    pub enqueued: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
    pub resweeps: u64,
    pub queue_depth: usize,
    pub remote_healthy: bool,
    pub consecutive_failures: u32,
    pub unhealthy_transitions: u64,
}

/// Handle to the background sync worker.
pub struct SyncAgent {
    tx: mpsc::Sender<SyncJob>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<SyncStats>,
    health: Arc<RemoteHealth>,
}

impl SyncAgent {
    /// Spawns the worker task and returns the handle used to feed it.
    pub fn spawn(
        local: LocalVault,
        remote: Arc<dyn RemoteVault>,
        config: SyncConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let stats = Arc::new(SyncStats::default());
        let health = Arc::new(RemoteHealth::new(config.unhealthy_threshold));

        let worker = SyncWorker {
            local,
            remote,
            health: health.clone(),
            stats: stats.clone(),
            config,
        };
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));

        Self {
            tx,
            cancel,
            worker: Mutex::new(Some(handle)),
            stats,
            health,
        }
    }

    /// Queue a job without blocking. Full or closed queues drop the job and
    /// bump the dropped counter.
    pub fn enqueue(&self, job: SyncJob) {
        match self.tx.try_send(job) {
            Ok(()) => SyncStats::inc(&self.stats.enqueued),
            Err(mpsc::error::TrySendError::Full(job)) => {
                SyncStats::inc(&self.stats.dropped);
                warn!(kind = job.kind(), "sync queue full, dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                SyncStats::inc(&self.stats.dropped);
                warn!(kind = job.kind(), "sync agent stopped, dropping job");
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn health(&self) -> Arc<RemoteHealth> {
        self.health.clone()
    }

    pub fn counters(&self) -> SyncCounters {
        SyncCounters {
            enqueued: self.stats.enqueued.load(Ordering::SeqCst),
            dropped: self.stats.dropped.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            resweeps: self.stats.resweeps.load(Ordering::SeqCst),
            queue_depth: self.tx.max_capacity() - self.tx.capacity(),
            remote_healthy: self.health.is_healthy(),
            consecutive_failures: self.health.consecutive_failures(),
            unhealthy_transitions: self.health.unhealthy_transitions(),
        }
    }

    /// Stops the worker, draining queued jobs within the drain budget.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct SyncWorker {
    local: LocalVault,
    remote: Arc<dyn RemoteVault>,
    health: Arc<RemoteHealth>,
    stats: Arc<SyncStats>,
    config: SyncConfig,
}

impl SyncWorker {
    async fn run(self, mut rx: mpsc::Receiver<SyncJob>, cancel: CancellationToken) {
        let mut probe_interval = tokio::time::interval(self.config.probe_interval);
        // The first resweep waits a full period; boot is not the moment to
        // re-push every record.
        let mut resweep_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.resweep_interval,
            self.config.resweep_interval,
        );

        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => self.run_job(job).await,
                    None => break,
                },
                _ = probe_interval.tick() => self.probe().await,
                _ = resweep_interval.tick() => {
                    if self.health.is_healthy() {
                        self.run_job(SyncJob::Resweep).await;
                    }
                }
                () = cancel.cancelled() => {
                    self.drain(&mut rx).await;
                    break;
                }
            }
        }
        debug!("sync worker stopped");
    }

    async fn probe(&self) {
        let outcome = tokio::time::timeout(self.config.op_timeout, self.remote.ping()).await;
        match outcome {
            Ok(Ok(())) => {
                let recovered = self.health.record_success();
                if recovered {
                    // A vault that was dark for a while may have missed
                    // mirrors; push everything it should have.
                    self.run_job(SyncJob::Resweep).await;
                }
            }
            Ok(Err(error)) => {
                debug!(%error, "remote vault probe failed");
                self.health.record_failure();
            }
            Err(_) => {
                debug!("remote vault probe timed out");
                self.health.record_failure();
            }
        }
    }

    async fn run_job(&self, job: SyncJob) {
        let kind = job.kind();
        // The per-operation timeout applies to single record ops; a resweep
        // spans many records and carries the timeout inside instead.
        let result = match job {
            SyncJob::Resweep => self.resweep().await,
            other => {
                match tokio::time::timeout(self.config.op_timeout, self.execute(other)).await {
                    Ok(result) => result,
                    Err(_) => Err("timed out".to_string()),
                }
            }
        };
        match result {
            Ok(()) => {
                SyncStats::inc(&self.stats.completed);
                self.health.record_success();
            }
            Err(error) => {
                SyncStats::inc(&self.stats.failed);
                self.health.record_failure();
                warn!(kind, error = %error, "sync job failed");
            }
        }
    }

    async fn execute(&self, job: SyncJob) -> Result<(), String> {
        match job {
            SyncJob::MirrorWrite {
                session_id,
                key,
                payload,
            } => self
                .remote
                .write(&session_id, &key, &payload)
                .await
                .map_err(|e| e.to_string()),
            SyncJob::MirrorDelete { session_id, key } => self
                .remote
                .delete(&session_id, &key)
                .await
                .map_err(|e| e.to_string()),
            SyncJob::WipeSession { session_id } => self
                .remote
                .wipe(&session_id)
                .await
                .map_err(|e| e.to_string()),
            SyncJob::Resweep => unreachable!("resweep handled in run_job"),
        }
    }

    /// Push every local record to the remote. Stops at the first failure so
    /// a dark vault is not hammered with hundreds of doomed writes.
    async fn resweep(&self) -> Result<(), String> {
        let sessions = self.local.known_sessions().map_err(|e| e.to_string())?;
        let mut pushed = 0usize;
        for session_id in &sessions {
            let keys = self.local.list_keys(session_id).map_err(|e| e.to_string())?;
            for key in keys {
                let payload = match self.local.get(session_id, &key).map_err(|e| e.to_string())? {
                    Some(payload) => payload,
                    None => continue,
                };
                let write = self.remote.write(session_id, &key, &payload);
                match tokio::time::timeout(self.config.op_timeout, write).await {
                    Ok(Ok(())) => pushed += 1,
                    Ok(Err(e)) => return Err(e.to_string()),
                    Err(_) => return Err("timed out".to_string()),
                }
            }
        }
        SyncStats::inc(&self.stats.resweeps);
        info!(sessions = sessions.len(), records = pushed, "resweep completed");
        Ok(())
    }

    /// Best-effort drain at shutdown: run what fits in the budget, count the
    /// rest as dropped.
    async fn drain(&self, rx: &mut mpsc::Receiver<SyncJob>) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while let Ok(job) = rx.try_recv() {
            if tokio::time::Instant::now() >= deadline {
                SyncStats::inc(&self.stats.dropped);
                continue;
            }
            self.run_job(job).await;
        }
    }
}
