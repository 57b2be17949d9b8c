//! Tenant directory seam.
//!
//! The directory is the external system of record for which tenants exist
//! and which device currently owns each one. We read it at startup to decide
//! what to roost, push connection status into it as sessions move through
//! their lifecycle, and persist takeover verdicts through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ids::TenantId;
use crate::session::{SessionSource, SessionStatus};

/// One tenant as the directory sees it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub tenant_id: TenantId,
    pub source: SessionSource,
    /// True once a takeover by another device has been verified.
    pub detected: bool,
    pub is_connected: bool,
    pub status: SessionStatus,
    pub reconnect_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Connection-state fields the orchestrator pushes back into the directory.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub is_connected: bool,
    pub status: SessionStatus,
    pub reconnect_attempts: u32,
}

/// Errors from the directory backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("tenant not found in directory")]
    NotFound,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// All tenants this process should maintain sessions for.
    async fn list_tenants(&self) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn get(&self, tenant: &TenantId) -> Result<Option<DirectoryEntry>, DirectoryError>;

    /// Creates or replaces the tenant's session record.
    async fn upsert(&self, entry: DirectoryEntry) -> Result<(), DirectoryError>;

    /// Pushes connection status for one tenant. Best-effort from the
    /// caller's point of view; the session itself is unaffected by failure.
    async fn update_status(
        &self,
        tenant: &TenantId,
        update: StatusUpdate,
    ) -> Result<(), DirectoryError>;

    /// Records an ownership verdict. Written before any destructive local
    /// action so a crash never loses the fact that a takeover was seen.
    async fn set_source(
        &self,
        tenant: &TenantId,
        source: SessionSource,
        detected: bool,
    ) -> Result<(), DirectoryError>;

    /// Removes the tenant's session record. The tenant's account record in
    /// the backing system is not ours to touch.
    async fn remove(&self, tenant: &TenantId) -> Result<bool, DirectoryError>;
}
