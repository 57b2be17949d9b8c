//! Core domain types for the roost session layer.
//!
//! This crate defines the vocabulary the rest of the workspace speaks:
//! typed ids, session lifecycle states, the credential record model, the
//! transport error taxonomy, and the capability traits that decouple the
//! orchestrator from any concrete protocol implementation. It has no I/O of
//! its own.

pub mod client;
pub mod credentials;
pub mod directory;
pub mod errors;
pub mod ids;
pub mod security;
pub mod session;

pub use client::{ConnectionHandle, ProtocolClient, SessionEvents};
pub use credentials::{CredentialEvent, CredentialRecord, RecordKey, PRIMARY_CATEGORY};
pub use directory::{DirectoryEntry, DirectoryError, StatusUpdate, TenantDirectory};
pub use errors::TransportError;
pub use ids::{HandleId, SessionId, TenantId};
pub use security::VaultToken;
pub use session::{SessionMeta, SessionSource, SessionStatus};
