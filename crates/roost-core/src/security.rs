//! Secret-bearing wrapper types.

use secrecy::{ExposeSecret, SecretString};

/// Bearer token for the remote backup vault. Redacted in Debug output so it
/// never leaks through logs or error chains.
#[derive(Clone)]
pub struct VaultToken(SecretString);

impl VaultToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Exposes the raw token. Call sites should keep the borrow short.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for VaultToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VaultToken([REDACTED])")
    }
}
