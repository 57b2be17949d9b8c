//! Credential persistence for roost sessions.
//!
//! Layout mirrors the write path: [`database`] owns the SQLite handle,
//! [`local`] is the authoritative row store, [`remote`] abstracts the
//! backup vault, [`sync`] feeds it in the background, and [`store`] ties
//! them together behind [`CredentialStore`].

pub mod database;
pub mod error;
pub mod health;
pub mod local;
pub mod remote;
mod row_helpers;
pub mod schema;
pub mod seal;
pub mod store;
pub mod sync;

pub use database::Database;
pub use error::{RemoteVaultError, VaultError};
pub use health::RemoteHealth;
pub use local::LocalVault;
pub use remote::{HttpVault, MemoryVault, RemoteVault};
pub use store::{CredentialStore, StoreConfig};
pub use sync::{SyncAgent, SyncConfig, SyncCounters, SyncJob};
