//! Session lifecycle types shared by the registry and orchestrator.

use chrono::{DateTime, Utc};

use crate::ids::TenantId;

/// Connection lifecycle state for one tenant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Whether this process is the tenant's primary owner or a bystander that
/// detected a takeover by another device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Primary,
    Secondary,
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown session source: {other}")),
        }
    }
}

/// Mutable bookkeeping attached to a registered session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub tenant_id: TenantId,
    pub status: SessionStatus,
    pub source: SessionSource,
    /// Set when another device claimed this tenant and we verified the claim.
    pub detected: bool,
    /// Set when the session was closed on purpose, so retry loops skip it.
    pub voluntary_disconnect: bool,
    pub reconnect_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(tenant_id: TenantId, source: SessionSource) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            status: SessionStatus::Uninitialized,
            source,
            detected: false,
            voluntary_disconnect: false,
            reconnect_attempts: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Stamps the last-activity clock, used by stale sweeps.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Uninitialized,
            SessionStatus::Connecting,
            SessionStatus::Connected,
            SessionStatus::Disconnected,
            SessionStatus::Failed,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "zombie".parse::<SessionStatus>().unwrap_err();
        assert!(err.contains("zombie"));
    }

    #[test]
    fn source_round_trips_through_str() {
        for source in [SessionSource::Primary, SessionSource::Secondary] {
            let parsed: SessionSource = source.to_string().parse().unwrap();
            assert_eq!(parsed, source);
        }
    }

    #[test]
    fn new_meta_starts_uninitialized() {
        let meta = SessionMeta::new(TenantId::from_raw("t1"), SessionSource::Primary);
        assert_eq!(meta.status, SessionStatus::Uninitialized);
        assert_eq!(meta.reconnect_attempts, 0);
        assert!(!meta.detected);
        assert!(!meta.voluntary_disconnect);
    }

    #[test]
    fn touch_advances_last_activity() {
        let mut meta = SessionMeta::new(TenantId::from_raw("t1"), SessionSource::Primary);
        let before = meta.last_activity;
        std::thread::sleep(std::time::Duration::from_millis(2));
        meta.touch();
        assert!(meta.last_activity > before);
    }

    #[test]
    fn meta_serializes_camel_case() {
        let meta = SessionMeta::new(TenantId::from_raw("t1"), SessionSource::Secondary);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["status"], "uninitialized");
        assert_eq!(json["source"], "secondary");
        assert!(json["voluntaryDisconnect"].is_boolean());
    }
}
