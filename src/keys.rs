//! Device custody of the derived key. A random wrapping key lives in a
//! 0o600 file and never leaves the machine; when the user opts in to
//! "remember this device", the session key is encrypted under it and parked
//! in the local cache so the next launch can skip the passphrase prompt.
//!
//! Everything here degrades to "no key available" rather than failing: the
//! caller turns that into a passphrase prompt, never into data loss.

use crate::crypto::{self, EncryptedPayload, Key, PAYLOAD_VERSION};
use crate::db::Cache;
use crate::logger::log;
use anyhow::{Context, Result};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Wrapped session key as stored in the local KV store, one record per uid.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyRecord {
    pub version: u32,
    pub iv: String,
    pub wrapped_key: String,
}

/// Load the device wrapping key, creating and persisting one on first use.
pub fn get_or_create_device_key(path: &Path) -> Result<Key> {
    if let Ok(bytes) = fs::read(path) {
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(Zeroizing::new(key));
        }
        log("device key file has unexpected length, regenerating");
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).context("Failed to create device key file")?;
    file.write_all(&key).context("Failed to write device key")?;

    Ok(Zeroizing::new(key))
}

/// Encrypt the session key under the device key and persist it for `uid`.
/// Called only when the user opted in to remembering this device.
pub async fn wrap_key_for_device(
    cache: &Cache,
    uid: &str,
    key: &Key,
    device_key: &Key,
) -> Result<()> {
    let payload = crypto::encrypt(Some(device_key), key.as_slice())
        .map_err(|e| anyhow::anyhow!("Failed to wrap key: {}", e))?;

    let record = WrappedKeyRecord {
        version: payload.version,
        iv: payload.iv,
        wrapped_key: payload.ciphertext,
    };
    let json = serde_json::to_string(&record)?;
    cache.set_wrapped_key(uid, &json).await
}

/// Recover a previously wrapped key. `None` on any failure — a missing
/// record, a corrupt record, or a wrapping key that no longer matches all
/// mean the same thing to the caller: ask for the passphrase.
pub async fn unwrap_key_for_device(cache: &Cache, uid: &str, device_key: &Key) -> Option<Key> {
    let json = match cache.get_wrapped_key(uid).await {
        Ok(Some(json)) => json,
        Ok(None) => return None,
        Err(e) => {
            log(&format!("unwrap_key_for_device: cache read failed: {}", e));
            return None;
        }
    };

    let record: WrappedKeyRecord = match serde_json::from_str(&json) {
        Ok(r) => r,
        Err(e) => {
            log(&format!("unwrap_key_for_device: bad record: {}", e));
            return None;
        }
    };

    if record.version != PAYLOAD_VERSION {
        log("unwrap_key_for_device: unrecognized record version");
        return None;
    }

    let payload = EncryptedPayload {
        version: record.version,
        iv: record.iv,
        ciphertext: record.wrapped_key,
        salt: None,
    };

    let bytes = match crypto::decrypt(Some(device_key), &payload) {
        Ok(b) => b,
        Err(e) => {
            log(&format!("unwrap_key_for_device: unwrap failed: {}", e));
            return None;
        }
    };

    if bytes.len() != 32 {
        log("unwrap_key_for_device: unwrapped key has wrong length");
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Some(Zeroizing::new(key))
}

/// Destroy the wrapped record for `uid`. Used when the user opts out of
/// "remember this device".
pub async fn forget_device(cache: &Cache, uid: &str) -> Result<()> {
    cache.delete_wrapped_key(uid).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> Key {
        let mut k = [0u8; 32];
        OsRng.fill_bytes(&mut k);
        Zeroizing::new(k)
    }

    #[tokio::test]
    async fn wrap_unwrap_roundtrip() {
        let cache = Cache::in_memory().unwrap();
        let device_key = random_key();
        let session_key = random_key();

        wrap_key_for_device(&cache, "u1", &session_key, &device_key)
            .await
            .unwrap();

        let recovered = unwrap_key_for_device(&cache, "u1", &device_key)
            .await
            .unwrap();
        assert_eq!(*recovered, *session_key);
    }

    #[tokio::test]
    async fn missing_record_yields_none() {
        let cache = Cache::in_memory().unwrap();
        let device_key = random_key();
        assert!(unwrap_key_for_device(&cache, "nobody", &device_key)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn wrong_device_key_yields_none() {
        let cache = Cache::in_memory().unwrap();
        let session_key = random_key();

        wrap_key_for_device(&cache, "u1", &session_key, &random_key())
            .await
            .unwrap();
        assert!(unwrap_key_for_device(&cache, "u1", &random_key())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn forget_device_destroys_record() {
        let cache = Cache::in_memory().unwrap();
        let device_key = random_key();
        let session_key = random_key();

        wrap_key_for_device(&cache, "u1", &session_key, &device_key)
            .await
            .unwrap();
        forget_device(&cache, "u1").await.unwrap();
        assert!(unwrap_key_for_device(&cache, "u1", &device_key)
            .await
            .is_none());
    }

    #[test]
    fn device_key_persists_across_loads() {
        let mut path = std::env::temp_dir();
        path.push(format!("fastrack-test-{}.key", uuid::Uuid::new_v4()));

        let k1 = get_or_create_device_key(&path).unwrap();
        let k2 = get_or_create_device_key(&path).unwrap();
        assert_eq!(*k1, *k2);

        let _ = fs::remove_file(&path);
    }
}
