use crate::seal::SealError;

/// Errors from the local credential vault. Local failures are fatal to the
/// calling operation; they are never absorbed the way remote mirror
/// failures are.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("incomplete credential record: {0}")]
    Incomplete(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("seal error: {0}")]
    Seal(#[from] SealError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    /// Remote vault failure on a foreground verify path. Background mirror
    /// failures are absorbed by the sync agent and never take this form.
    #[error("remote vault unavailable: {0}")]
    Remote(#[from] RemoteVaultError),
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

/// Errors from the remote backup vault. On the mirror path the sync agent
/// logs, counts, and absorbs these; only foreground verify reads surface
/// them to callers (as `VaultError::Remote`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteVaultError {
    #[error("remote vault request failed: {0}")]
    Http(String),

    #[error("remote vault returned status {status}")]
    Status { status: u16 },

    #[error("remote vault timed out")]
    Timeout,

    #[error("remote vault payload error: {0}")]
    Payload(String),
}

impl From<reqwest::Error> for RemoteVaultError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteVaultError::Timeout
        } else if let Some(status) = e.status() {
            RemoteVaultError::Status {
                status: status.as_u16(),
            }
        } else {
            RemoteVaultError::Http(e.to_string())
        }
    }
}
