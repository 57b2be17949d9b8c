//! Settings for the roost daemon.
//!
//! A settings document lives at `~/.roost/settings.json`. Loading starts
//! from compiled defaults, deep-merges the file when present, then applies
//! `ROOST_*` environment overrides. Every field has a sane default, so a
//! fresh install runs with no file at all.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    HealthSettings, LoggingSettings, LookupSettings, OrchestratorSettings, RemoteSettings,
    RoostSettings, StoreSettings, SyncSettings, TakeoverSettings,
};
