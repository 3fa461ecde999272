use anyhow::{Context, Result};
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    Argon2, Params,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

// Argon2 Recommended Parameters (OWASP)
// m=memory (KiB), t=iterations, p=parallelism
const ARGON2_M_COST: u32 = 65536; // 64 MiB
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

/// Only version 1 payloads exist. Anything else is rejected up front
/// instead of being fed to the AEAD.
pub const PAYLOAD_VERSION: u32 = 1;

const NONCE_LEN: usize = 12;

pub type Key = Zeroizing<[u8; 32]>;

/// Codec failure taxonomy. `DecryptFailed` is the only signal that can
/// distinguish a wrong password from corrupted server data, so callers treat
/// it as "assume wrong password, prompt re-auth". `InvalidPayload` means the
/// stored envelope itself is malformed and re-auth will not help.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no encryption key available")]
    MissingKey,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
}

/// Wire envelope for every encrypted blob. `salt` rides along only on the
/// state payload so a fresh device can re-derive the key before it has seen
/// the profile document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub version: u32,
    pub iv: String,
    pub ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// Derive the symmetric key from a passphrase and the user's salt.
/// Deterministic: identical inputs always produce the same key, so the
/// server never needs to see the passphrase after sign-up.
pub fn derive_key(passphrase: &str, salt_b64: &str) -> Result<Key> {
    let salt_bytes = BASE64
        .decode(salt_b64)
        .context("Failed to decode salt from Base64")?;

    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(32))
        .map_err(|e| anyhow::anyhow!("Invalid Argon2 params: {}", e))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt_bytes, &mut key)
        .map_err(|e| anyhow::anyhow!("Failed to hash passphrase: {}", e))?;

    Ok(Zeroizing::new(key))
}

/// Async wrapper so Argon2 does not stall the runtime.
pub async fn derive_key_async(passphrase: String, salt_b64: String) -> Result<Key> {
    tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt_b64))
        .await
        .context("Crypto task panicked")?
}

/// Encrypt a blob under a fresh random nonce. Fails loudly with
/// `MissingKey` when no key is set rather than returning garbage.
pub fn encrypt(key: Option<&Key>, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let key = key.ok_or(CryptoError::MissingKey)?;
    let cipher = ChaCha20Poly1305::new((&**key).into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng); // 96-bit, unique per message

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::InvalidPayload("encryption rejected plaintext"))?;

    Ok(EncryptedPayload {
        version: PAYLOAD_VERSION,
        iv: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
        salt: None,
    })
}

/// Authenticated decryption. A failed tag check maps to `DecryptFailed`;
/// structural problems with the envelope map to `InvalidPayload`.
pub fn decrypt(key: Option<&Key>, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
    let key = key.ok_or(CryptoError::MissingKey)?;

    if payload.version != PAYLOAD_VERSION {
        return Err(CryptoError::InvalidPayload("unrecognized payload version"));
    }

    let nonce_bytes = BASE64
        .decode(&payload.iv)
        .map_err(|_| CryptoError::InvalidPayload("iv is not valid Base64"))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::InvalidPayload("iv must be 12 bytes"));
    }

    let ciphertext = BASE64
        .decode(&payload.ciphertext)
        .map_err(|_| CryptoError::InvalidPayload("ciphertext is not valid Base64"))?;

    let nonce = Nonce::from_slice(&nonce_bytes);
    let cipher = ChaCha20Poly1305::new((&**key).into());

    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Note bodies are single strings; wrap the byte codec with UTF-8 checks.
pub fn encrypt_text(key: Option<&Key>, text: &str) -> Result<EncryptedPayload, CryptoError> {
    encrypt(key, text.as_bytes())
}

pub fn decrypt_text(key: Option<&Key>, payload: &EncryptedPayload) -> Result<String, CryptoError> {
    let bytes = decrypt(key, payload)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::InvalidPayload("plaintext is not UTF-8"))
}

/// Generate a random 16-byte salt, Base64 encoded. Generated once per user,
/// then pinned server-side (first writer wins).
pub fn generate_salt() -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    BASE64.encode(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        derive_key("correct horse", &generate_salt()).unwrap()
    }

    #[test]
    fn roundtrip() {
        let key = test_key();
        let payload = encrypt(Some(&key), b"hello fasting").unwrap();
        assert_eq!(payload.version, PAYLOAD_VERSION);
        let plain = decrypt(Some(&key), &payload).unwrap();
        assert_eq!(plain, b"hello fasting");
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = test_key();
        let a = encrypt(Some(&key), b"same plaintext").unwrap();
        let b = encrypt(Some(&key), b"same plaintext").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = generate_salt();
        let k1 = derive_key("passphrase", &salt).unwrap();
        let k2 = derive_key("passphrase", &salt).unwrap();
        let payload = encrypt(Some(&k1), b"cross-check").unwrap();
        assert_eq!(decrypt(Some(&k2), &payload).unwrap(), b"cross-check");
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let salt = generate_salt();
        let k1 = derive_key("right", &salt).unwrap();
        let k2 = derive_key("wrong", &salt).unwrap();
        let payload = encrypt(Some(&k1), b"secret").unwrap();
        assert_eq!(decrypt(Some(&k2), &payload), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn missing_key_is_distinct() {
        assert_eq!(encrypt(None, b"x"), Err(CryptoError::MissingKey));
        let key = test_key();
        let payload = encrypt(Some(&key), b"x").unwrap();
        assert_eq!(decrypt(None, &payload), Err(CryptoError::MissingKey));
    }

    #[test]
    fn malformed_envelope_is_invalid_payload() {
        let key = test_key();
        let mut payload = encrypt(Some(&key), b"x").unwrap();
        payload.iv = "not base64!!".to_string();
        assert!(matches!(
            decrypt(Some(&key), &payload),
            Err(CryptoError::InvalidPayload(_))
        ));
    }

    #[test]
    fn unknown_version_is_invalid_payload() {
        let key = test_key();
        let mut payload = encrypt(Some(&key), b"x").unwrap();
        payload.version = 2;
        assert!(matches!(
            decrypt(Some(&key), &payload),
            Err(CryptoError::InvalidPayload(_))
        ));
    }

    #[test]
    fn corrupted_ciphertext_is_decrypt_failed() {
        let key = test_key();
        let mut payload = encrypt(Some(&key), b"x").unwrap();
        payload.ciphertext = BASE64.encode(b"garbage bytes that are long enough");
        assert_eq!(decrypt(Some(&key), &payload), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn text_roundtrip() {
        let key = test_key();
        let payload = encrypt_text(Some(&key), "felt great at hour 14").unwrap();
        assert_eq!(
            decrypt_text(Some(&key), &payload).unwrap(),
            "felt great at hour 14"
        );
    }
}
