//! Cancellable delayed-task scheduler.
//!
//! Reconnects are not nested timers; they are explicit scheduled jobs keyed
//! by session id. Scheduling again for the same session replaces the pending
//! job, and teardown paths cancel outright, so a reconnect can never fire
//! against a session mid-cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct ScheduledJob {
    cancel: CancellationToken,
    generation: u64,
}

/// One pending delayed task per session.
pub struct ReconnectScheduler {
    jobs: Arc<DashMap<roost_core::SessionId, ScheduledJob>>,
    next_generation: AtomicU64,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Schedules `task` to run after `delay`, replacing (and cancelling) any
    /// job already pending for the session.
    pub fn schedule<F>(&self, session_id: roost_core::SessionId, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.jobs.insert(
            session_id.clone(),
            ScheduledJob {
                cancel: cancel.clone(),
                generation,
            },
        ) {
            previous.cancel.cancel();
        }

        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    // Only clear our own entry; a replacement job may own
                    // the slot by now.
                    jobs.remove_if(&session_id, |_, job| job.generation == generation);
                    task.await;
                }
                () = cancel.cancelled() => {}
            }
        });
    }

    /// Cancels the pending job for a session, if any.
    pub fn cancel(&self, session_id: &roost_core::SessionId) -> bool {
        match self.jobs.remove(session_id) {
            Some((_, job)) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending job. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let count = self.jobs.len();
        for entry in self.jobs.iter() {
            entry.value().cancel.cancel();
        }
        self.jobs.clear();
        count
    }

    pub fn is_scheduled(&self, session_id: &roost_core::SessionId) -> bool {
        self.jobs.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::{SessionId, TenantId};
    use std::sync::atomic::AtomicU32;

    fn sid(tenant: &str) -> SessionId {
        SessionId::for_tenant(&TenantId::from_raw(tenant))
    }

    #[tokio::test(start_paused = true)]
    async fn job_fires_after_delay() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();

        scheduler.schedule(sid("t1"), Duration::from_secs(5), async move {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.is_scheduled(&sid("t1")));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&sid("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_job() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let first = fired.clone();
        scheduler.schedule(sid("t1"), Duration::from_secs(5), async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        scheduler.schedule(sid("t1"), Duration::from_secs(5), async move {
            second.fetch_add(10, Ordering::SeqCst);
        });

        assert_eq!(scheduler.len(), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();

        scheduler.schedule(sid("t1"), Duration::from_secs(5), async move {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(&sid("t1")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.cancel(&sid("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_every_job() {
        let scheduler = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        for tenant in ["a", "b", "c"] {
            let counter = fired.clone();
            scheduler.schedule(sid(tenant), Duration::from_secs(5), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(scheduler.cancel_all(), 3);
        assert!(scheduler.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
