//! Remote vault health tracking.
//!
//! Consecutive-failure counting with an explicit healthy flag. Any remote
//! operation or probe reports its outcome here; the store consults the flag
//! to decide whether keyed-record mirroring is worth attempting at all.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tracing::{info, warn};

/// Tracks whether the remote vault is currently worth talking to.
///
/// Unhealthy after `threshold` consecutive failures; healthy again after a
/// single success. Both transitions are logged and counted.
pub struct RemoteHealth {
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
    threshold: u32,
    unhealthy_transitions: AtomicU64,
}

impl RemoteHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            threshold: threshold.max(1),
            unhealthy_transitions: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Times the vault went healthy → unhealthy since startup.
    pub fn unhealthy_transitions(&self) -> u64 {
        self.unhealthy_transitions.load(Ordering::SeqCst)
    }

    /// Records a successful remote operation. Returns true when this healed
    /// an unhealthy vault.
    pub fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let recovered = !self.healthy.swap(true, Ordering::SeqCst);
        if recovered {
            info!("remote vault recovered");
        }
        recovered
    }

    /// Records a failed remote operation. Returns true when this tripped the
    /// vault into the unhealthy state.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            let tripped = self.healthy.swap(false, Ordering::SeqCst);
            if tripped {
                self.unhealthy_transitions.fetch_add(1, Ordering::SeqCst);
                warn!(failures, "remote vault marked unhealthy");
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let health = RemoteHealth::new(3);
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn trips_after_threshold_failures() {
        let health = RemoteHealth::new(3);
        assert!(!health.record_failure());
        assert!(!health.record_failure());
        assert!(health.is_healthy());
        assert!(health.record_failure());
        assert!(!health.is_healthy());
        assert_eq!(health.unhealthy_transitions(), 1);
    }

    #[test]
    fn single_success_heals() {
        let health = RemoteHealth::new(3);
        for _ in 0..5 {
            health.record_failure();
        }
        assert!(!health.is_healthy());
        assert!(health.record_success());
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let health = RemoteHealth::new(3);
        health.record_failure();
        health.record_failure();
        health.record_success();
        health.record_failure();
        health.record_failure();
        assert!(health.is_healthy());
    }

    #[test]
    fn repeated_failures_count_one_transition() {
        let health = RemoteHealth::new(2);
        health.record_failure();
        health.record_failure();
        health.record_failure();
        health.record_failure();
        assert_eq!(health.unhealthy_transitions(), 1);
    }

    #[test]
    fn zero_threshold_clamps_to_one() {
        let health = RemoteHealth::new(0);
        assert!(health.record_failure());
        assert!(!health.is_healthy());
    }
}
