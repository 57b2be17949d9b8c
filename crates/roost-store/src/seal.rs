//! At-rest sealing for credential payloads.
//!
//! Every payload is sealed with ChaCha20-Poly1305 before it touches SQLite,
//! and the same sealed form is what gets mirrored to the remote vault, so
//! the backup service never sees plaintext credential material. The sealing
//! key lives next to the database; deployments that want remote restore to
//! work across hosts provision the same key file on each host.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

const NONCE_LEN: usize = 12;

/// Seal a plaintext payload using ChaCha20-Poly1305 AEAD.
/// Returns base64-encoded nonce + ciphertext.
pub fn seal(plaintext: &str, key: &[u8; 32]) -> Result<String, SealError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| SealError::SealFailed)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &combined,
    ))
}

/// Unseal a base64-encoded nonce + ciphertext.
pub fn unseal(encoded: &str, key: &[u8; 32]) -> Result<String, SealError> {
    let combined =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|_| SealError::InvalidEncoding)?;

    if combined.len() < NONCE_LEN {
        return Err(SealError::InvalidEncoding);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(key.into());

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SealError::UnsealFailed)?;

    String::from_utf8(plaintext).map_err(|_| SealError::InvalidUtf8)
}

/// Generate a random 256-bit sealing key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Load or create the sealing key file.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], SealError> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .map_err(|e| SealError::IoError(e.to_string()))?;
        let bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            encoded.trim(),
        )
        .map_err(|_| SealError::InvalidEncoding)?;
        if bytes.len() != 32 {
            return Err(SealError::InvalidKeyLength);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SealError::IoError(e.to_string()))?;
        }
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
        std::fs::write(path, &encoded).map_err(|e| SealError::IoError(e.to_string()))?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SealError::IoError(e.to_string()))?;
        }

        Ok(key)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SealError {
    #[error("sealing failed")]
    SealFailed,
    #[error("unsealing failed")]
    UnsealFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    IoError(String),
}
