//! State synchronizer. Owns the one authoritative in-memory `AppState`,
//! keeps it aligned with the user's single remote state document, and falls
//! back to the local cache when the store is unreachable. All payloads move
//! through the codec; the remote store only ever sees ciphertext.
//!
//! Ordering: mutations apply to memory synchronously before the async
//! encrypt-and-write starts, and every remote write carries the revision it
//! was based on, so a stale in-flight save can never clobber a newer remote
//! value unnoticed.

use crate::crypto::{self, CryptoError, EncryptedPayload, Key};
use crate::db::Cache;
use crate::keys;
use crate::logger::log;
use crate::session::{Session, SyncEvent};
use crate::state::{self, AppState};
use crate::store::{Document, DocumentStore, SetOptions, StoreError, StoreEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn state_doc_path(uid: &str) -> String {
    format!("users/{}/state", uid)
}

pub fn profile_path(uid: &str) -> String {
    format!("users/{}/profile", uid)
}

pub fn notes_path(uid: &str) -> String {
    format!("users/{}/notes", uid)
}

/// Last-known-good copy in the local cache: the encrypted payload plus the
/// remote revision it corresponds to.
#[derive(Serialize, Deserialize)]
struct CachedStateDoc {
    payload: EncryptedPayload,
    rev: u64,
}

#[derive(Clone)]
pub struct StateSync {
    store: Arc<dyn DocumentStore>,
    cache: Cache,
    session: Session,
    events: mpsc::UnboundedSender<SyncEvent>,
    state: Arc<Mutex<AppState>>,
    last_rev: Arc<AtomicU64>,
    device_key_path: PathBuf,
}

impl StateSync {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Cache,
        session: Session,
        events: mpsc::UnboundedSender<SyncEvent>,
        device_key_path: PathBuf,
    ) -> Self {
        Self {
            store,
            cache,
            session,
            events,
            state: Arc::new(Mutex::new(AppState::default())),
            last_rev: Arc::new(AtomicU64::new(0)),
            device_key_path,
        }
    }

    /// Snapshot of the current in-memory state.
    pub fn state(&self) -> AppState {
        self.state.lock().unwrap().clone()
    }

    pub fn last_rev(&self) -> u64 {
        self.last_rev.load(Ordering::SeqCst)
    }

    /// Apply a mutation to memory synchronously, then persist. The UI read
    /// path sees the change immediately even if the remote write is still in
    /// flight or fails.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut AppState) -> R,
    ) -> Result<R, SyncError> {
        let out = {
            let mut guard = self.state.lock().unwrap();
            f(&mut guard)
        };
        self.save().await?;
        Ok(out)
    }

    /// Fetch the encrypted state payload: remote first, local cache on any
    /// failure or absence. Remote reads are written through to the cache.
    async fn resolve_payload(&self, uid: &str) -> Result<Option<(EncryptedPayload, u64)>, SyncError> {
        match self.store.get_document(&state_doc_path(uid)).await {
            Ok(Some(doc)) => {
                let payload = parse_payload(&doc.value)?;
                let cached = CachedStateDoc {
                    payload: payload.clone(),
                    rev: doc.rev,
                };
                if let Ok(json) = serde_json::to_string(&cached) {
                    if let Err(e) = self.cache.set_state_doc(uid, &json).await {
                        log(&format!("resolve_payload: cache write failed: {}", e));
                    }
                }
                return Ok(Some((payload, doc.rev)));
            }
            Ok(None) => {}
            Err(e) => {
                log(&format!(
                    "resolve_payload: remote read failed ({}), trying cache",
                    e
                ));
            }
        }

        match self.cache.get_state_doc(uid).await {
            Ok(Some(json)) => match serde_json::from_str::<CachedStateDoc>(&json) {
                Ok(cached) => Ok(Some((cached.payload, cached.rev))),
                Err(e) => {
                    log(&format!("resolve_payload: cached doc unreadable: {}", e));
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(e) => {
                log(&format!("resolve_payload: cache read failed: {}", e));
                Ok(None)
            }
        }
    }

    /// Resolve the user's salt: remote profile, then local cache, then the
    /// copy attached to the state payload, else generate. A generated salt
    /// is published first-writer-wins; if another device got there first,
    /// theirs is adopted.
    async fn resolve_salt(
        &self,
        uid: &str,
        payload_salt: Option<String>,
    ) -> Result<String, SyncError> {
        let (remote_ok, profile_rev, remote_salt) =
            match self.store.get_document(&profile_path(uid)).await {
                Ok(Some(doc)) => {
                    let salt = doc
                        .value
                        .pointer("/crypto/salt")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    (true, doc.rev, salt)
                }
                Ok(None) => (true, 0, None),
                Err(e) => {
                    log(&format!("resolve_salt: remote read failed: {}", e));
                    (false, 0, None)
                }
            };

        if let Some(salt) = remote_salt {
            if let Err(e) = self.cache.set_salt(uid, &salt).await {
                log(&format!("resolve_salt: cache write failed: {}", e));
            }
            return Ok(salt);
        }

        let local = match self.cache.get_salt(uid).await {
            Ok(s) => s,
            Err(e) => {
                log(&format!("resolve_salt: cache read failed: {}", e));
                None
            }
        };

        let salt = match local.or(payload_salt) {
            Some(s) => s,
            None => crypto::generate_salt(),
        };
        if let Err(e) = self.cache.set_salt(uid, &salt).await {
            log(&format!("resolve_salt: cache write failed: {}", e));
        }

        if remote_ok {
            return Ok(self.publish_salt(uid, salt, profile_rev).await);
        }
        Ok(salt)
    }

    /// First writer wins: the write is pinned to the profile revision we
    /// read. Losing the race means another device already published a salt,
    /// and that one is authoritative.
    async fn publish_salt(&self, uid: &str, salt: String, base_rev: u64) -> String {
        let value = serde_json::json!({ "crypto": { "salt": salt } });
        let opts = SetOptions {
            merge: true,
            expected_rev: Some(base_rev),
        };
        match self.store.set_document(&profile_path(uid), value, opts).await {
            Ok(_) => salt,
            Err(StoreError::Conflict { .. }) => {
                match self.store.get_document(&profile_path(uid)).await {
                    Ok(Some(doc)) => {
                        if let Some(theirs) = doc
                            .value
                            .pointer("/crypto/salt")
                            .and_then(Value::as_str)
                        {
                            log("publish_salt: lost the race, adopting remote salt");
                            let theirs = theirs.to_string();
                            if let Err(e) = self.cache.set_salt(uid, &theirs).await {
                                log(&format!("publish_salt: cache write failed: {}", e));
                            }
                            return theirs;
                        }
                        salt
                    }
                    _ => salt,
                }
            }
            Err(e) => {
                log(&format!("publish_salt: write failed: {}", e));
                salt
            }
        }
    }

    /// Obtain the session key: an explicit passphrase derives (and wraps for
    /// this device when `remember`), otherwise a previously wrapped key is
    /// recovered. `MissingKey` here means "prompt for the passphrase".
    async fn obtain_key(
        &self,
        uid: &str,
        password: Option<&str>,
        salt: &str,
        remember: bool,
    ) -> Result<Key, SyncError> {
        if let Some(password) = password {
            let key = crypto::derive_key_async(password.to_string(), salt.to_string()).await?;
            if remember {
                match keys::get_or_create_device_key(&self.device_key_path) {
                    Ok(device_key) => {
                        if let Err(e) =
                            keys::wrap_key_for_device(&self.cache, uid, &key, &device_key).await
                        {
                            log(&format!("obtain_key: wrap failed: {}", e));
                        }
                    }
                    Err(e) => log(&format!("obtain_key: no device key: {}", e)),
                }
            }
            return Ok(key);
        }

        let device_key = keys::get_or_create_device_key(&self.device_key_path)
            .map_err(|e| {
                log(&format!("obtain_key: no device key: {}", e));
                CryptoError::MissingKey
            })?;
        keys::unwrap_key_for_device(&self.cache, uid, &device_key)
            .await
            .ok_or_else(|| CryptoError::MissingKey.into())
    }

    /// Full load: payload → salt → key → decrypt → merge. On first run
    /// (no payload anywhere) the defaults stand, but a key is still
    /// established so the next save can encrypt immediately.
    pub async fn load(
        &self,
        uid: &str,
        password: Option<&str>,
        remember: bool,
    ) -> Result<(), SyncError> {
        let resolved = self.resolve_payload(uid).await?;
        let payload_salt = resolved.as_ref().and_then(|(p, _)| p.salt.clone());
        let salt = self.resolve_salt(uid, payload_salt).await?;
        let key = self.obtain_key(uid, password, &salt, remember).await?;
        self.session.establish_key(key.clone(), salt);

        match resolved {
            Some((payload, rev)) => {
                let plaintext = match crypto::decrypt(Some(&key), &payload) {
                    Ok(p) => p,
                    Err(e) => {
                        self.session.lock_pending_reauth(&e);
                        return Err(e.into());
                    }
                };
                let raw: Value = serde_json::from_slice(&plaintext)
                    .map_err(|_| CryptoError::InvalidPayload("state payload is not JSON"))?;
                *self.state.lock().unwrap() = state::merge_with_defaults(&raw);
                self.last_rev.store(rev, Ordering::SeqCst);
            }
            None => {
                *self.state.lock().unwrap() = AppState::default();
                self.last_rev.store(0, Ordering::SeqCst);
            }
        }

        self.session.unlock();
        Ok(())
    }

    /// Encrypt the current state and push it out. Skipped (but logged) when
    /// no key or salt is established yet — pre-auth mutations are never
    /// queued. The cache is written before the remote so it is never behind
    /// memory; a failed remote write is surfaced, not swallowed.
    pub async fn save(&self) -> Result<(), SyncError> {
        let (uid, key, salt) = {
            let uid = self.session.uid();
            let key = self.session.key();
            let salt = self.session.salt();
            match (uid, key, salt) {
                (Some(u), Some(k), Some(s)) => (u, k, s),
                _ => {
                    log("save: skipped, no key/salt established yet");
                    return Ok(());
                }
            }
        };

        // Snapshot synchronously so a subscription update arriving during the
        // async write cannot bleed into this payload.
        let plaintext = {
            let guard = self.state.lock().unwrap();
            serde_json::to_vec(&*guard).map_err(anyhow::Error::from)?
        };

        let mut payload = crypto::encrypt(Some(&key), &plaintext)?;
        payload.salt = Some(salt);
        let base_rev = self.last_rev.load(Ordering::SeqCst);

        let cached = CachedStateDoc {
            payload: payload.clone(),
            rev: base_rev,
        };
        if let Ok(json) = serde_json::to_string(&cached) {
            if let Err(e) = self.cache.set_state_doc(&uid, &json).await {
                log(&format!("save: cache write failed: {}", e));
            }
        }

        let path = state_doc_path(&uid);
        let value = serde_json::json!({ "payload": payload });
        let opts = SetOptions {
            merge: false,
            expected_rev: Some(base_rev),
        };

        let result = match self.store.set_document(&path, value.clone(), opts).await {
            Ok(new_rev) => Ok(new_rev),
            Err(StoreError::Conflict { current_rev, .. }) => {
                // Lost the race: retry once on top of the newer revision.
                // Whole-document last-write-wins, by design of this store.
                log(&format!(
                    "save: write race at rev {}, retrying on rev {}",
                    base_rev, current_rev
                ));
                self.store
                    .set_document(
                        &path,
                        value,
                        SetOptions {
                            merge: false,
                            expected_rev: Some(current_rev),
                        },
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(new_rev) => {
                self.last_rev.store(new_rev, Ordering::SeqCst);
                let cached = CachedStateDoc {
                    payload,
                    rev: new_rev,
                };
                if let Ok(json) = serde_json::to_string(&cached) {
                    let _ = self.cache.set_state_doc(&uid, &json).await;
                }
                Ok(())
            }
            Err(e) => {
                log(&format!("save: remote write failed: {}", e));
                let _ = self.events.send(SyncEvent::RemoteWriteFailed { path });
                Ok(())
            }
        }
    }

    /// Start the live feed for the current user. Every event re-checks the
    /// session identity before touching shared state, so a feed left running
    /// across a sign-out can never leak into another account.
    pub fn spawn_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        let uid = self.session.uid()?;
        let epoch = self.session.epoch();
        let mut sub = self.store.subscribe_document(&state_doc_path(&uid));
        let this = self.clone();

        Some(tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                if !this.session.is_current(&uid, epoch) {
                    log("state listener: session changed, stopping");
                    break;
                }
                match event {
                    StoreEvent::Document { doc: Some(doc), .. } => {
                        this.apply_remote(&uid, doc).await;
                    }
                    StoreEvent::Document { doc: None, .. } => {
                        log("state listener: remote document deleted, keeping local state");
                    }
                    StoreEvent::Error(e) => {
                        log(&format!("state listener: {}", e));
                    }
                    StoreEvent::Collection { .. } => {}
                }
            }
        }))
    }

    /// Apply a pushed remote document. Stale revisions (our own echo, or an
    /// out-of-order notification) are ignored; a decrypt failure locks the
    /// session and asks for re-auth, same as the load path.
    async fn apply_remote(&self, uid: &str, doc: Document) {
        let rev = doc.rev;
        if rev <= self.last_rev.load(Ordering::SeqCst) {
            return;
        }

        let payload = match parse_payload(&doc.value) {
            Ok(p) => p,
            Err(_) => {
                log("apply_remote: malformed payload");
                let _ = self.events.send(SyncEvent::PayloadInvalid {
                    path: state_doc_path(uid),
                });
                return;
            }
        };

        let key = self.session.key();
        let plaintext = match crypto::decrypt(key.as_ref(), &payload) {
            Ok(p) => p,
            Err(e @ (CryptoError::MissingKey | CryptoError::DecryptFailed)) => {
                self.session.lock_pending_reauth(&e);
                let _ = self.events.send(SyncEvent::ReauthRequired(e));
                return;
            }
            Err(e) => {
                log(&format!("apply_remote: {}", e));
                let _ = self.events.send(SyncEvent::PayloadInvalid {
                    path: state_doc_path(uid),
                });
                return;
            }
        };

        let raw: Value = match serde_json::from_slice(&plaintext) {
            Ok(v) => v,
            Err(e) => {
                log(&format!("apply_remote: payload is not JSON: {}", e));
                return;
            }
        };

        *self.state.lock().unwrap() = state::merge_with_defaults(&raw);
        self.last_rev.store(rev, Ordering::SeqCst);

        let cached = CachedStateDoc { payload, rev };
        if let Ok(json) = serde_json::to_string(&cached) {
            let _ = self.cache.set_state_doc(uid, &json).await;
        }
        let _ = self.events.send(SyncEvent::StateUpdated);
    }
}

fn parse_payload(doc_value: &Value) -> Result<EncryptedPayload, CryptoError> {
    let payload = doc_value
        .get("payload")
        .ok_or(CryptoError::InvalidPayload("document has no payload field"))?;
    serde_json::from_value::<EncryptedPayload>(payload.clone())
        .map_err(|_| CryptoError::InvalidPayload("payload envelope is malformed"))
}
