//! Capability traits at the transport seam.
//!
//! The orchestrator never talks to a concrete transport. It hands the client
//! a fixed event interface and gets back an opaque connection handle; the
//! real protocol implementation lives in a separate crate behind
//! [`ProtocolClient`], and tests substitute a scripted one.

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::{CredentialEvent, CredentialRecord};
use crate::errors::TransportError;
use crate::ids::{HandleId, TenantId};

/// Callbacks one session exposes to its transport.
///
/// This is the whole surface: connection established, error, credential
/// mutation. Transports must not assume anything else about the host.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    /// The connection is established and authenticated. `peer_identity` is
    /// the identity string the remote endpoint bound the session to.
    async fn on_connected(&self, peer_identity: String);

    /// A transport-level failure. Fatal errors end the session; retryable
    /// ones trigger reconnect scheduling.
    async fn on_error(&self, error: TransportError);

    /// The protocol layer mutated credential material that must be
    /// persisted before it can be considered durable.
    async fn on_credential_event(&self, event: CredentialEvent);
}

/// A live connection for one tenant.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn id(&self) -> &HandleId;

    fn tenant(&self) -> &TenantId;

    /// Whether the transport still considers the connection open.
    fn is_open(&self) -> bool;

    /// Application-level liveness check. Must complete quickly or fail; the
    /// health monitor wraps it in its own timeout.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// Factory for tenant connections.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Opens a connection for `tenant`, wiring `events` into the transport.
    /// `credentials` carries the stored primary record when one exists; `None`
    /// means the transport should run its pairing flow and report the material
    /// it builds through `on_credential_event`.
    ///
    /// Credential events may fire before this returns; callers must be ready
    /// to persist material for a session they have not finished registering.
    /// Failures during establishment surface through the returned `Result`;
    /// `on_error` is reserved for failures of an established connection.
    async fn connect(
        &self,
        tenant: &TenantId,
        credentials: Option<CredentialRecord>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn ConnectionHandle>, TransportError>;
}
