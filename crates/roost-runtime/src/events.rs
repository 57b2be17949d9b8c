//! Bridges transport callbacks into the orchestrator.
//!
//! The transport holds this adapter for the lifetime of the connection,
//! which can outlive an orchestrator mid-shutdown, so it carries only a
//! weak reference; a late callback against a dropped orchestrator is a
//! no-op rather than a leak cycle.

use std::sync::Weak;

use async_trait::async_trait;

use roost_core::{CredentialEvent, SessionEvents, SessionId, TransportError};

use crate::orchestrator::SessionOrchestrator;

pub(crate) struct OrchestratorEvents {
    session_id: SessionId,
    orchestrator: Weak<SessionOrchestrator>,
}

impl OrchestratorEvents {
    pub(crate) fn new(session_id: SessionId, orchestrator: Weak<SessionOrchestrator>) -> Self {
        Self {
            session_id,
            orchestrator,
        }
    }
}

#[async_trait]
impl SessionEvents for OrchestratorEvents {
    async fn on_connected(&self, peer_identity: String) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator
                .handle_connected(&self.session_id, peer_identity)
                .await;
        }
    }

    async fn on_error(&self, error: TransportError) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator
                .handle_transport_error(&self.session_id, error)
                .await;
        }
    }

    async fn on_credential_event(&self, event: CredentialEvent) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.handle_credential_event(&self.session_id, event);
        }
    }
}
