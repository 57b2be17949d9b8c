//! Transport error taxonomy.
//!
//! Every failure the protocol client can surface is classified here so the
//! orchestrator can make one uniform decision: retry with backoff, or stop
//! and mark the session failed.

use std::time::Duration;

/// Errors surfaced by the remote messaging transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Dial or handshake failed before the session was established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The peer rejected our credentials. The local material is unusable and
    /// the tenant has to go through pairing again.
    #[error("credentials rejected: {0}")]
    AuthRejected(String),

    /// Another device claimed this tenant's session.
    #[error("session conflict: claimed by another device")]
    Conflict,

    /// The operation did not complete in time.
    #[error("transport timeout")]
    Timeout,

    /// An established connection dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer asked us to slow down.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The peer sent something we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether reconnecting with backoff has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailed(_)
            | Self::Timeout
            | Self::ConnectionLost(_)
            | Self::RateLimited { .. } => true,
            Self::AuthRejected(_) | Self::Conflict | Self::Protocol(_) => false,
        }
    }

    /// Whether the session is unrecoverable without operator or tenant
    /// intervention (re-pairing, takeover resolution).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::Conflict)
    }

    /// Delay hint before the next attempt, when the error carries one.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::AuthRejected(_) => "auth_rejected",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::RateLimited { .. } => "rate_limited",
            Self::Protocol(_) => "protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(TransportError::ConnectFailed("dns".into()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::ConnectionLost("reset".into()).is_retryable());
        assert!(TransportError::RateLimited { retry_after: None }.is_retryable());
    }

    #[test]
    fn fatal_errors_do_not_retry() {
        let auth = TransportError::AuthRejected("401".into());
        assert!(!auth.is_retryable());
        assert!(auth.is_fatal());

        assert!(TransportError::Conflict.is_fatal());
        assert!(!TransportError::Conflict.is_retryable());
    }

    #[test]
    fn protocol_errors_stop_without_being_fatal() {
        let err = TransportError::Protocol("bad frame".into());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn rate_limit_carries_delay_hint() {
        let err = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(30)));
        assert_eq!(TransportError::Timeout.suggested_delay(), None);
    }

    #[test]
    fn kinds_are_stable_labels() {
        assert_eq!(TransportError::Conflict.kind(), "conflict");
        assert_eq!(TransportError::Timeout.kind(), "timeout");
    }
}
