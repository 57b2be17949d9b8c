//! Orchestrator error taxonomy.

use roost_core::{SessionId, TenantId, TransportError};
use roost_store::VaultError;

/// Errors surfaced by session lifecycle operations.
///
/// Transport failures keep their own classification (retryable, fatal,
/// delay hint) so callers can route them back into the reconnect machinery.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Neither store holds usable credential material and the caller
    /// disallowed the pairing path.
    #[error("no credentials for tenant {0}; pairing required")]
    NoCredentials(TenantId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session limit reached ({0} active)")]
    SessionLimit(usize),

    /// A concurrent create for the same session was already running and
    /// finished without producing a live handle.
    #[error("concurrent connect attempt failed")]
    InFlightFailed,

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("vault error: {0}")]
    Store(#[from] VaultError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    /// Whether retrying the operation later could succeed without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::InFlightFailed => true,
            Self::NoCredentials(_)
            | Self::SessionLimit(_)
            | Self::NotFound(_)
            | Self::Store(_)
            | Self::ShuttingDown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retryability_passes_through() {
        let err = OrchestratorError::from(TransportError::Timeout);
        assert!(err.is_retryable());

        let err = OrchestratorError::from(TransportError::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn lifecycle_errors_are_not_retryable() {
        let tenant = TenantId::from_raw("t1");
        assert!(!OrchestratorError::NoCredentials(tenant).is_retryable());
        assert!(!OrchestratorError::SessionLimit(900).is_retryable());
        assert!(!OrchestratorError::ShuttingDown.is_retryable());
    }

    #[test]
    fn messages_name_the_subject() {
        let tenant = TenantId::from_raw("15551234567");
        let msg = OrchestratorError::NoCredentials(tenant).to_string();
        assert!(msg.contains("15551234567"));

        let sid = SessionId::from_raw("session_x");
        let msg = OrchestratorError::NotFound(sid).to_string();
        assert!(msg.contains("session_x"));
    }
}
