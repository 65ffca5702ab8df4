//! AES-256-GCM sealing for capability secrets.
//!
//! Ciphertexts are `nonce (12 bytes) || ciphertext+tag`, base64-encoded.
//! The key comes from `TOOLSMITH_SECRET_KEY` (SHA-256 of the passphrase) or
//! a random 32-byte `.key` file created on first use with mode `0o600`.

use anyhow::Context;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::Path;

pub const KEY_ENV: &str = "TOOLSMITH_SECRET_KEY";

const NONCE_LEN: usize = 12;

/// Derive a key from a passphrase.
pub fn key_from_passphrase(passphrase: &str) -> [u8; 32] {
    use ring::digest;
    let hash = digest::digest(&digest::SHA256, passphrase.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(hash.as_ref());
    key
}

/// Load the encryption key, preferring the env passphrase over `<dir>/.key`.
pub fn load_or_create_key(dir: &Path) -> anyhow::Result<[u8; 32]> {
    if let Ok(passphrase) = std::env::var(KEY_ENV) {
        if !passphrase.is_empty() {
            return Ok(key_from_passphrase(&passphrase));
        }
    }

    let key_path = dir.join(".key");
    if key_path.exists() {
        let data = std::fs::read(&key_path)
            .with_context(|| format!("read encryption key {}", key_path.display()))?;
        let key: [u8; 32] = data.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "encryption key file {} has wrong length ({} bytes, expected 32)",
                key_path.display(),
                data.len()
            )
        })?;
        return Ok(key);
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("create secrets dir {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
    }

    let mut key = [0u8; 32];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| anyhow::anyhow!("failed to generate random key"))?;
    std::fs::write(&key_path, key)
        .with_context(|| format!("write encryption key {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).ok();
    }
    tracing::info!(path = %key_path.display(), "generated new secrets key");

    Ok(key)
}

pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<String> {
    let sealing_key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| anyhow::anyhow!("invalid AES key"))?,
    );

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| anyhow::anyhow!("failed to generate nonce"))?;

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;

    let mut combined = nonce_bytes.to_vec();
    combined.extend_from_slice(&in_out);
    Ok(base64::engine::general_purpose::STANDARD.encode(combined))
}

pub fn decrypt(key: &[u8; 32], encoded: &str) -> anyhow::Result<Vec<u8>> {
    let combined = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("base64 decode failed")?;
    if combined.len() <= NONCE_LEN {
        anyhow::bail!("encrypted data too short");
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce_arr: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("malformed nonce"))?;

    let opening_key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| anyhow::anyhow!("invalid AES key"))?,
    );
    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Nonce::assume_unique_for_key(nonce_arr), Aad::empty(), &mut in_out)
        .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or corrupted data"))?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [42u8; 32];
        let sealed = encrypt(&key, b"sk-live-123").unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"sk-live-123");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt(&[1u8; 32], b"value").unwrap();
        assert!(decrypt(&[2u8; 32], &sealed).is_err());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let key = [7u8; 32];
        assert_ne!(encrypt(&key, b"x").unwrap(), encrypt(&key, b"x").unwrap());
    }

    #[test]
    fn key_file_is_reused() {
        // Only meaningful when the env passphrase is not set.
        if std::env::var(KEY_ENV).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let a = load_or_create_key(dir.path()).unwrap();
        let b = load_or_create_key(dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(std::fs::read(dir.path().join(".key")).unwrap().len(), 32);
    }
}
