//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RoostSettings::default()`]
//! 2. If `~/.roost/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RoostSettings;

/// Resolve the path to the settings file (`~/.roost/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".roost").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RoostSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RoostSettings> {
    let defaults = serde_json::to_value(RoostSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RoostSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are silently ignored (fall back to file/default)
pub fn apply_env_overrides(settings: &mut RoostSettings) {
    // ── Store settings ──────────────────────────────────────────────
    if let Some(v) = read_env_string("ROOST_DATA_DIR") {
        settings.store.data_dir = Some(v);
    }
    if let Some(v) = read_env_u64("ROOST_DEBOUNCE_MS", 10, 10_000) {
        settings.store.debounce_ms = v;
    }
    if let Some(v) = read_env_bool("ROOST_FULL_BACKUP") {
        settings.store.full_backup = v;
    }

    // ── Sync settings ───────────────────────────────────────────────
    if let Some(v) = read_env_usize("ROOST_SYNC_QUEUE_CAPACITY", 16, 65_536) {
        settings.sync.queue_capacity = v;
    }
    if let Some(v) = read_env_u64("ROOST_SYNC_PROBE_INTERVAL", 5, 3600) {
        settings.sync.probe_interval_secs = v;
    }
    if let Some(v) = read_env_u64("ROOST_SYNC_RESWEEP_INTERVAL", 60, 86_400) {
        settings.sync.resweep_interval_secs = v;
    }

    // ── Remote vault settings ───────────────────────────────────────
    if let Some(v) = read_env_string("ROOST_REMOTE_URL") {
        settings.remote.url = Some(v);
    }
    if let Some(v) = read_env_u64("ROOST_REMOTE_TIMEOUT_MS", 100, 60_000) {
        settings.remote.timeout_ms = v;
    }

    // ── Orchestrator settings ───────────────────────────────────────
    if let Some(v) = read_env_usize("ROOST_MAX_SESSIONS", 1, 10_000) {
        settings.orchestrator.max_sessions = v;
    }
    if let Some(v) = read_env_usize("ROOST_STARTUP_CONCURRENCY", 1, 64) {
        settings.orchestrator.startup_concurrency = v;
    }
    if let Some(v) = read_env_u64("ROOST_RETRY_INTERVAL", 10, 86_400) {
        settings.orchestrator.retry_interval_secs = v;
    }
    if let Some(v) = read_env_u32("ROOST_MAX_RECONNECT_ATTEMPTS", 1, 1000) {
        settings.orchestrator.max_reconnect_attempts = v;
    }

    // ── Health settings ─────────────────────────────────────────────
    if let Some(v) = read_env_u64("ROOST_HEALTH_INTERVAL", 5, 3600) {
        settings.health.check_interval_secs = v;
    }
    if let Some(v) = read_env_u64("ROOST_INACTIVITY_TIMEOUT", 60, 86_400) {
        settings.health.inactivity_timeout_secs = v;
    }

    // ── Takeover settings ───────────────────────────────────────────
    if let Some(v) = read_env_u64("ROOST_TAKEOVER_POLL_INTERVAL", 1, 3600) {
        settings.takeover.poll_interval_secs = v;
    }

    // ── Logging settings ────────────────────────────────────────────
    if let Some(v) = read_env_string("ROOST_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
