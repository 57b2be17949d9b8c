//! Settings schema.
//!
//! Every field has a default so a missing or partial settings file still
//! yields a runnable configuration. Durations are encoded in the unit named
//! by the field suffix; conversion to `Duration` happens at the edges, when
//! the daemon builds component configs out of these sections.

/// Root settings document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoostSettings {
    pub store: StoreSettings,
    pub sync: SyncSettings,
    pub remote: RemoteSettings,
    pub orchestrator: OrchestratorSettings,
    pub lookup: LookupSettings,
    pub health: HealthSettings,
    pub takeover: TakeoverSettings,
    pub logging: LoggingSettings,
}

impl Default for RoostSettings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            sync: SyncSettings::default(),
            remote: RemoteSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            lookup: LookupSettings::default(),
            health: HealthSettings::default(),
            takeover: TakeoverSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Local credential store.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSettings {
    /// Data directory. Defaults to `~/.roost` when unset.
    pub data_dir: Option<String>,
    /// Debounce window for high-churn keyed credential writes.
    pub debounce_ms: u64,
    /// When true, keyed records are mirrored even while the remote vault is
    /// unhealthy (full-backup mode). Default is file-first: local always,
    /// keyed mirroring only while healthy.
    pub full_backup: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            debounce_ms: 100,
            full_backup: false,
        }
    }
}

/// Background sync agent.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Bounded job queue depth. Jobs beyond this are dropped and counted.
    pub queue_capacity: usize,
    /// Remote health probe cadence, seconds.
    pub probe_interval_secs: u64,
    /// Full re-sweep cadence while healthy, seconds.
    pub resweep_interval_secs: u64,
    /// Per-operation timeout against the remote vault, milliseconds.
    pub op_timeout_ms: u64,
    /// How long shutdown waits for queued jobs to drain, milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            probe_interval_secs: 60,
            resweep_interval_secs: 3600,
            op_timeout_ms: 5000,
            drain_timeout_ms: 2000,
        }
    }
}

/// Remote backup vault endpoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteSettings {
    /// Base URL of the backup vault service. Unset disables remote backup
    /// entirely; the store then runs local-only.
    pub url: Option<String>,
    /// HTTP client timeout, milliseconds.
    pub timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5000,
        }
    }
}

/// Session orchestration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorSettings {
    /// Hard ceiling on concurrently registered sessions.
    pub max_sessions: usize,
    /// How many sessions may be mid-connect at once during bulk startup.
    pub startup_concurrency: usize,
    /// Stagger between connect launches inside one startup batch, ms.
    pub startup_stagger_ms: u64,
    /// Pause between startup batches, milliseconds.
    pub batch_delay_ms: u64,
    /// Background retry loop cadence for failed sessions, seconds.
    pub retry_interval_secs: u64,
    /// How many failed sessions one retry tick picks up.
    pub retry_batch: usize,
    /// Reconnect attempts before a session is left failed.
    pub max_reconnect_attempts: u32,
    /// Reconnect backoff base, milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect backoff cap, milliseconds.
    pub reconnect_max_ms: u64,
    /// Minimum gap between reinitializations of one session, seconds.
    pub reinit_cooldown_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_sessions: 900,
            startup_concurrency: 3,
            startup_stagger_ms: 250,
            batch_delay_ms: 1000,
            retry_interval_secs: 300,
            retry_batch: 3,
            max_reconnect_attempts: 10,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 60_000,
            reinit_cooldown_secs: 60,
        }
    }
}

/// Reverse lookup cache (peer identity to session).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LookupSettings {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            capacity: 200,
        }
    }
}

/// Session health monitoring.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthSettings {
    /// Health tick cadence, seconds.
    pub check_interval_secs: u64,
    /// Inactivity span after which a connected session gets probed, seconds.
    pub inactivity_timeout_secs: u64,
    /// Consecutive probe failures before a session is flagged unhealthy.
    pub max_failed_pings: u32,
    /// Timeout for one liveness probe, milliseconds.
    pub probe_timeout_ms: u64,
    /// Stale sweep cadence, seconds.
    pub stale_sweep_interval_secs: u64,
    /// Age at which a session stuck mid-connect is considered wedged, secs.
    pub stale_age_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            inactivity_timeout_secs: 1800,
            max_failed_pings: 3,
            probe_timeout_ms: 10_000,
            stale_sweep_interval_secs: 600,
            stale_age_secs: 600,
        }
    }
}

/// Takeover detection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TakeoverSettings {
    /// Directory poll cadence, seconds.
    pub poll_interval_secs: u64,
}

impl Default for TakeoverSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
        }
    }
}

/// Logging.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Default tracing filter, overridable via `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operating_envelope() {
        let settings = RoostSettings::default();
        assert_eq!(settings.orchestrator.max_sessions, 900);
        assert_eq!(settings.orchestrator.startup_concurrency, 3);
        assert_eq!(settings.store.debounce_ms, 100);
        assert!(!settings.store.full_backup);
        assert_eq!(settings.lookup.ttl_secs, 30);
        assert_eq!(settings.lookup.capacity, 200);
        assert_eq!(settings.health.max_failed_pings, 3);
        assert_eq!(settings.takeover.poll_interval_secs, 10);
        assert!(settings.remote.url.is_none());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let settings: RoostSettings =
            serde_json::from_str(r#"{"orchestrator":{"maxSessions":10}}"#).unwrap();
        assert_eq!(settings.orchestrator.max_sessions, 10);
        assert_eq!(settings.orchestrator.startup_concurrency, 3);
        assert_eq!(settings.sync.queue_capacity, 1024);
    }

    #[test]
    fn round_trips_through_json() {
        let settings = RoostSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: RoostSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn fields_serialize_camel_case() {
        let json = serde_json::to_value(RoostSettings::default()).unwrap();
        assert!(json["orchestrator"]["maxSessions"].is_number());
        assert!(json["sync"]["queueCapacity"].is_number());
        assert!(json["store"]["debounceMs"].is_number());
        assert!(json["health"]["maxFailedPings"].is_number());
    }
}
