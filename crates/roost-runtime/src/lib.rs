//! Session runtime: orchestration, liveness, reconnects, and takeover.
//!
//! [`SessionOrchestrator`] is the entry point. It owns the session
//! registry, the reconnect scheduler, the reverse-address lookup cache,
//! and the liveness monitor, and coordinates all of them against a
//! [`roost_core::ProtocolClient`], a [`roost_store::CredentialStore`],
//! and a [`roost_core::TenantDirectory`]. The background loops
//! ([`run_health_monitor`], [`SessionOrchestrator::run_retry_loop`],
//! [`TakeoverDetector::run`]) are free-standing tasks the embedding
//! process spawns and cancels through a [`ShutdownCoordinator`].

mod events;

pub mod error;
pub mod health;
pub mod lookup;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod sim;
pub mod takeover;

pub use error::OrchestratorError;
pub use health::{run_health_monitor, HealthConfig, HealthMonitor};
pub use lookup::{LookupConfig, ReverseLookupCache};
pub use orchestrator::{
    CreateOpts, OrchestratorConfig, OrchestratorStats, ReinitOutcome, SessionOrchestrator,
    StartupReport,
};
pub use registry::{SessionEntry, SessionRegistry};
pub use scheduler::ReconnectScheduler;
pub use shutdown::ShutdownCoordinator;
pub use takeover::{TakeoverConfig, TakeoverDetector, TakeoverOutcome};
