use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use roost_core::{ProtocolClient, TenantDirectory, VaultToken};
use roost_runtime::sim::{MemoryDirectory, SimClient};
use roost_runtime::{
    run_health_monitor, HealthConfig, LookupConfig, OrchestratorConfig, OrchestratorStats,
    SessionOrchestrator, ShutdownCoordinator, TakeoverConfig, TakeoverDetector,
};
use roost_settings::{
    load_settings, load_settings_from_path, HealthSettings, OrchestratorSettings, RoostSettings,
    SyncSettings,
};
use roost_store::{CredentialStore, HttpVault, MemoryVault, RemoteVault, StoreConfig, SyncConfig};
use roost_telemetry::{init_telemetry, spawn_snapshot_task, MetricsRecorder, TelemetryConfig};

/// How often orchestrator counters are mirrored into the metrics recorder.
const STATS_MIRROR_INTERVAL: Duration = Duration::from_secs(30);

/// Multi-tenant session daemon: keeps every paired session connected,
/// credentials persisted, and failed links on a reconnect schedule.
#[derive(Parser, Debug)]
#[command(name = "roost", version)]
struct Cli {
    /// Settings file to load instead of ~/.roost/settings.json.
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,
    /// Data directory for the vault database and sealing key.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;

    let data_dir = cli
        .data_dir
        .or_else(|| settings.store.data_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| dirs_home().join(".roost"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let telemetry_config = telemetry_config(&settings, &data_dir);
    let snapshot_interval = Duration::from_secs(telemetry_config.metrics_snapshot_interval_secs);
    let retention_days = telemetry_config.metrics_retention_days;
    let telemetry = init_telemetry(telemetry_config);

    tracing::info!(data_dir = %data_dir.display(), "Starting roost daemon");

    // Remote vault: HTTP mirror when a URL is configured, local-only otherwise.
    let remote: Arc<dyn RemoteVault> = match &settings.remote.url {
        Some(url) => {
            let token = std::env::var("ROOST_VAULT_TOKEN").ok().map(VaultToken::new);
            if token.is_none() {
                tracing::warn!(
                    "ROOST_VAULT_TOKEN is not set, remote vault requests are unauthenticated"
                );
            }
            let vault = HttpVault::new(
                url.clone(),
                token,
                Duration::from_millis(settings.remote.timeout_ms),
            )
            .context("failed to build remote vault client")?;
            tracing::info!(url = %url, "Remote vault configured");
            Arc::new(vault)
        }
        None => {
            tracing::info!("No remote vault configured, credentials stay local");
            Arc::new(MemoryVault::new())
        }
    };

    let store = CredentialStore::open(
        &data_dir,
        remote,
        StoreConfig {
            debounce: Duration::from_millis(settings.store.debounce_ms),
            full_backup: settings.store.full_backup,
        },
        sync_config(&settings.sync),
    )
    .context("failed to open credential store")?;
    tracing::info!(path = %data_dir.join("vault.db").display(), "Credential store opened");

    // The sim transport and directory stand in until a real protocol backend
    // is linked in; the orchestrator only sees the traits.
    let client: Arc<dyn ProtocolClient> = Arc::new(SimClient::new());
    let directory: Arc<dyn TenantDirectory> = Arc::new(MemoryDirectory::new());

    let orchestrator = SessionOrchestrator::new(
        client,
        store.clone(),
        directory,
        orchestrator_config(&settings.orchestrator),
        health_config(&settings.health),
        LookupConfig {
            ttl: Duration::from_secs(settings.lookup.ttl_secs),
            capacity: settings.lookup.capacity,
        },
    );

    let report = orchestrator.initialize_existing_sessions().await;
    tracing::info!(
        attempted = report.attempted,
        connected = report.connected,
        failed = report.failed,
        skipped = report.skipped,
        restored_records = report.restored_records,
        "Bulk startup finished"
    );

    let coordinator = ShutdownCoordinator::new();
    coordinator.register(
        "retry-loop",
        tokio::spawn(orchestrator.clone().run_retry_loop(coordinator.token())),
    );
    coordinator.register(
        "health-monitor",
        tokio::spawn(run_health_monitor(orchestrator.clone(), coordinator.token())),
    );

    let takeover = TakeoverDetector::new(
        orchestrator.clone(),
        TakeoverConfig {
            poll_interval: Duration::from_secs(settings.takeover.poll_interval_secs),
        },
    );
    coordinator.register("takeover", tokio::spawn(takeover.run(coordinator.token())));

    if let Some(recorder) = telemetry.metrics() {
        coordinator.register(
            "stats-mirror",
            tokio::spawn(mirror_stats(
                orchestrator.clone(),
                recorder.clone(),
                coordinator.token(),
            )),
        );
        coordinator.register(
            "metrics-snapshot",
            spawn_snapshot_task(recorder, snapshot_interval, retention_days),
        );
    }

    tracing::info!(
        max_sessions = settings.orchestrator.max_sessions,
        "Roost daemon ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("Shutting down");

    orchestrator.shutdown().await;
    coordinator.graceful(None).await;
    store.shutdown().await;

    Ok(())
}

fn telemetry_config(settings: &RoostSettings, data_dir: &Path) -> TelemetryConfig {
    let log_level = settings
        .logging
        .level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    TelemetryConfig {
        log_level,
        log_db_path: data_dir.join("logs.db"),
        metrics_db_path: data_dir.join("metrics.db"),
        ..TelemetryConfig::default()
    }
}

fn sync_config(settings: &SyncSettings) -> SyncConfig {
    SyncConfig {
        queue_capacity: settings.queue_capacity,
        probe_interval: Duration::from_secs(settings.probe_interval_secs),
        resweep_interval: Duration::from_secs(settings.resweep_interval_secs),
        op_timeout: Duration::from_millis(settings.op_timeout_ms),
        drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
        ..SyncConfig::default()
    }
}

fn orchestrator_config(settings: &OrchestratorSettings) -> OrchestratorConfig {
    OrchestratorConfig {
        max_sessions: settings.max_sessions,
        startup_concurrency: settings.startup_concurrency,
        startup_stagger: Duration::from_millis(settings.startup_stagger_ms),
        startup_batch_delay: Duration::from_millis(settings.batch_delay_ms),
        retry_interval: Duration::from_secs(settings.retry_interval_secs),
        retry_batch_limit: settings.retry_batch,
        max_reconnect_attempts: settings.max_reconnect_attempts,
        reconnect_base_delay: Duration::from_millis(settings.reconnect_base_ms),
        reconnect_max_delay: Duration::from_millis(settings.reconnect_max_ms),
        reinit_cooldown: Duration::from_secs(settings.reinit_cooldown_secs),
        ..OrchestratorConfig::default()
    }
}

fn health_config(settings: &HealthSettings) -> HealthConfig {
    HealthConfig {
        check_interval: Duration::from_secs(settings.check_interval_secs),
        inactivity_threshold: Duration::from_secs(settings.inactivity_timeout_secs),
        probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
        max_probe_failures: settings.max_failed_pings,
        stale_sweep_interval: Duration::from_secs(settings.stale_sweep_interval_secs),
        stale_connecting_after: Duration::from_secs(settings.stale_age_secs),
    }
}

/// Copies orchestrator counters into the metrics recorder on an interval so
/// snapshots and queries see them without the runtime depending on telemetry.
async fn mirror_stats(
    orchestrator: Arc<SessionOrchestrator>,
    recorder: Arc<MetricsRecorder>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(STATS_MIRROR_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => record_stats(&recorder, &orchestrator.get_stats()),
            () = cancel.cancelled() => break,
        }
    }
}

fn record_stats(recorder: &MetricsRecorder, stats: &OrchestratorStats) {
    recorder.counter_store("sessions.created.total", &[], stats.sessions_created);
    recorder.counter_store("sessions.expired.total", &[], stats.sessions_expired);
    recorder.counter_store("connects.failed.total", &[], stats.connects_failed);
    recorder.counter_store("reconnects.scheduled.total", &[], stats.reconnects_scheduled);
    recorder.counter_store("cleanups.total", &[], stats.cleanups_performed);
    recorder.counter_store("probes.sent.total", &[], stats.probes_sent);
    recorder.counter_store("probes.failed.total", &[], stats.probes_failed);
    recorder.counter_store("lookup.hits.total", &[], stats.lookup_hits);
    recorder.counter_store("lookup.misses.total", &[], stats.lookup_misses);
    recorder.counter_store("store.flush_failures.total", &[], stats.flush_failures);
    recorder.counter_store("sync.completed.total", &[], stats.sync.completed);
    recorder.counter_store("sync.failed.total", &[], stats.sync.failed);
    recorder.counter_store("sync.dropped.total", &[], stats.sync.dropped);

    recorder.gauge_set("sessions.total", &[], stats.total_sessions as f64);
    for (status, count) in &stats.status_counts {
        recorder.gauge_set(
            "sessions.by_status",
            &[("status", status.as_str())],
            *count as f64,
        );
    }
    recorder.gauge_set("sessions.detected", &[], stats.detected_sessions as f64);
    recorder.gauge_set("sessions.monitored", &[], stats.monitored_sessions as f64);
    recorder.gauge_set("sessions.unhealthy", &[], stats.unhealthy_sessions as f64);
    recorder.gauge_set("reconnects.pending", &[], stats.pending_reconnects as f64);
    recorder.gauge_set("store.pending_writes", &[], stats.pending_writes as f64);
    recorder.gauge_set("sync.queue_depth", &[], stats.sync.queue_depth as f64);
    recorder.gauge_set(
        "remote.healthy",
        &[],
        if stats.remote_healthy { 1.0 } else { 0.0 },
    );
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
