//! Notes synchronizer. Same cryptographic discipline as the state document,
//! but per-note: only the text is encrypted, while dates and fast context
//! stay plaintext metadata (a deliberate scope limit — metadata leakage is
//! accepted, content is protected).
//!
//! Note documents have accumulated three shapes over the product's life:
//! pre-encryption plaintext `text`, the current encrypted `payload`, and two
//! vintages of fast context. `normalize` folds all of them into one
//! canonical shape.

use crate::crypto::{self, CryptoError, EncryptedPayload, Key};
use crate::db::Cache;
use crate::logger::log;
use crate::session::{Session, SyncEvent};
use crate::state::{self, AppState};
use crate::store::{DocumentStore, SetOptions, StoreEvent};
use crate::sync::{notes_path, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Snapshot of the fasting session at note-creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FastContext {
    pub was_active: bool,
    pub fast_type_id: Option<String>,
    pub elapsed_ms_at_note: Option<i64>,
}

impl FastContext {
    /// Capture the context for a note taken right now.
    pub fn capture(app_state: &AppState, now_ms: i64) -> Self {
        match &app_state.active_fast {
            Some(af) => Self {
                was_active: true,
                fast_type_id: Some(af.type_id.clone()),
                elapsed_ms_at_note: Some(af.elapsed_ms(now_ms)),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: String,
    pub text: String,
    pub created_at: String,
    pub updated_at: String,
    pub date_key: String,
    pub fast_context: FastContext,
}

/// Fold a raw note document of any known vintage into the canonical shape.
/// Decrypt failures propagate typed so the listener can distinguish
/// missing-key from wrong-key.
pub fn normalize(id: &str, value: &Value, key: Option<&Key>) -> Result<Note, CryptoError> {
    let text = if let Some(payload) = value.get("payload") {
        let payload: EncryptedPayload = serde_json::from_value(payload.clone())
            .map_err(|_| CryptoError::InvalidPayload("note payload envelope is malformed"))?;
        crypto::decrypt_text(key, &payload)?
    } else if let Some(text) = value.get("text").and_then(Value::as_str) {
        // Pre-encryption documents stored the body in the clear
        text.to_string()
    } else {
        return Err(CryptoError::InvalidPayload(
            "note has neither payload nor text",
        ));
    };

    let fast_context = if let Some(fc) = value.get("fastContext") {
        match serde_json::from_value::<FastContext>(fc.clone()) {
            Ok(ctx) => ctx,
            Err(_) => FastContext::default(),
        }
    } else if let Some(active) = value.get("fastActive").and_then(Value::as_bool) {
        // Legacy flat fields lived at the document root
        FastContext {
            was_active: active,
            fast_type_id: value
                .get("fastTypeId")
                .and_then(Value::as_str)
                .map(str::to_string),
            elapsed_ms_at_note: value.get("fastElapsedMs").and_then(Value::as_i64),
        }
    } else {
        FastContext::default()
    };

    let str_field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(Note {
        id: id.to_string(),
        text,
        created_at: str_field("createdAt"),
        updated_at: str_field("updatedAt"),
        date_key: str_field("dateKey"),
        fast_context,
    })
}

/// `updated_at` descending; equal timestamps break on id so snapshots are
/// stable across devices.
fn sort_notes(notes: &mut [Note]) {
    notes.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[derive(Clone)]
pub struct NotesSync {
    store: Arc<dyn DocumentStore>,
    cache: Cache,
    session: Session,
    events: mpsc::UnboundedSender<SyncEvent>,
    notes: Arc<Mutex<Vec<Note>>>,
}

impl NotesSync {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Cache,
        session: Session,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            cache,
            session,
            events,
            notes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }

    fn require_auth(&self) -> Result<(String, Key), SyncError> {
        let uid = self
            .session
            .uid()
            .ok_or(CryptoError::MissingKey)?;
        let key = self.session.key().ok_or(CryptoError::MissingKey)?;
        Ok((uid, key))
    }

    /// Create a note. The text is encrypted; everything else rides as
    /// plaintext metadata. The fast context is snapshotted from the passed
    /// state at creation time.
    pub async fn create(
        &self,
        text: &str,
        app_state: &AppState,
        now_ms: i64,
    ) -> Result<Note, SyncError> {
        let (uid, key) = self.require_auth()?;
        let payload = crypto::encrypt_text(Some(&key), text)?;
        let now_iso = chrono::Utc::now().to_rfc3339();
        let fast_context = FastContext::capture(app_state, now_ms);

        let value = serde_json::json!({
            "payload": payload,
            "createdAt": now_iso,
            "updatedAt": now_iso,
            "dateKey": state::date_key(now_ms),
            "fastContext": fast_context,
        });

        let id = self
            .store
            .add_document(&notes_path(&uid), value.clone())
            .await?;

        if let Err(e) = self
            .cache
            .upsert_note_docs(&uid, vec![(id.clone(), value.to_string())])
            .await
        {
            log(&format!("notes create: cache write failed: {}", e));
        }

        let note = Note {
            id,
            text: text.to_string(),
            created_at: now_iso.clone(),
            updated_at: now_iso,
            date_key: state::date_key(now_ms),
            fast_context,
        };
        {
            let mut notes = self.notes.lock().unwrap();
            notes.push(note.clone());
            sort_notes(&mut notes);
        }
        Ok(note)
    }

    /// Re-encrypt and update the text of an existing note.
    pub async fn update(&self, id: &str, text: &str) -> Result<(), SyncError> {
        let (uid, key) = self.require_auth()?;
        let payload = crypto::encrypt_text(Some(&key), text)?;
        let now_iso = chrono::Utc::now().to_rfc3339();

        let patch = serde_json::json!({
            "payload": payload,
            "updatedAt": now_iso,
        });
        let path = format!("{}/{}", notes_path(&uid), id);
        self.store
            .set_document(
                &path,
                patch,
                SetOptions {
                    merge: true,
                    expected_rev: None,
                },
            )
            .await?;

        // The cache holds whole documents, so re-read the merged result
        match self.store.get_document(&path).await {
            Ok(Some(doc)) => {
                if let Err(e) = self
                    .cache
                    .upsert_note_docs(&uid, vec![(id.to_string(), doc.value.to_string())])
                    .await
                {
                    log(&format!("notes update: cache write failed: {}", e));
                }
            }
            Ok(None) => {}
            Err(e) => log(&format!("notes update: cache refresh failed: {}", e)),
        }

        let mut notes = self.notes.lock().unwrap();
        if let Some(note) = notes.iter_mut().find(|n| n.id == id) {
            note.text = text.to_string();
            note.updated_at = now_iso;
        }
        sort_notes(&mut notes);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let uid = self.session.uid().ok_or(CryptoError::MissingKey)?;
        let path = format!("{}/{}", notes_path(&uid), id);
        self.store.delete_document(&path).await?;
        if let Err(e) = self.cache.delete_note_doc(id).await {
            log(&format!("notes delete: cache delete failed: {}", e));
        }
        self.notes.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }

    /// One-shot fetch of the whole collection, cache fallback when the store
    /// is unreachable. A decrypt failure locks the session, same as the live
    /// feed.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let (uid, key) = self.require_auth()?;
        let docs = match self.store.list_collection(&notes_path(&uid)).await {
            Ok(docs) => docs,
            Err(e) => {
                log(&format!(
                    "notes refresh: remote list failed ({}), using cache",
                    e
                ));
                return self.load_cached().await;
            }
        };

        let mut notes = Vec::new();
        let mut cache_docs = Vec::new();
        for (id, doc) in docs {
            match normalize(&id, &doc.value, Some(&key)) {
                Ok(note) => {
                    cache_docs.push((id, doc.value.to_string()));
                    notes.push(note);
                }
                Err(e @ (CryptoError::MissingKey | CryptoError::DecryptFailed)) => {
                    self.session.lock_pending_reauth(&e);
                    return Err(e.into());
                }
                Err(e) => {
                    log(&format!("notes refresh: skipping note {}: {}", id, e));
                }
            }
        }
        sort_notes(&mut notes);
        *self.notes.lock().unwrap() = notes;
        if let Err(e) = self.cache.upsert_note_docs(&uid, cache_docs).await {
            log(&format!("notes refresh: cache write failed: {}", e));
        }
        Ok(())
    }

    /// Populate from the local cache; used when the store is unreachable at
    /// startup. Decrypt failures propagate the same way the live path does.
    pub async fn load_cached(&self) -> Result<(), SyncError> {
        let (uid, key) = self.require_auth()?;
        let docs = self.cache.get_note_docs(&uid).await?;

        let mut notes = Vec::new();
        for (id, json) in docs {
            let value: Value = serde_json::from_str(&json)
                .map_err(|_| CryptoError::InvalidPayload("cached note is not JSON"))?;
            notes.push(normalize(&id, &value, Some(&key))?);
        }
        sort_notes(&mut notes);
        *self.notes.lock().unwrap() = notes;
        Ok(())
    }

    /// Live feed over the notes collection. Identity-guarded like the state
    /// listener, and a decrypt failure on any note triggers the same re-auth
    /// path.
    pub fn spawn_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        let uid = self.session.uid()?;
        let epoch = self.session.epoch();
        let mut sub = self.store.subscribe_collection(&notes_path(&uid));
        let this = self.clone();

        Some(tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                if !this.session.is_current(&uid, epoch) {
                    log("notes listener: session changed, stopping");
                    break;
                }
                match event {
                    StoreEvent::Collection { docs, .. } => {
                        this.apply_snapshot(&uid, docs).await;
                    }
                    StoreEvent::Error(e) => {
                        log(&format!("notes listener: {}", e));
                    }
                    StoreEvent::Document { .. } => {}
                }
            }
        }))
    }

    async fn apply_snapshot(&self, uid: &str, docs: Vec<(String, crate::store::Document)>) {
        let key = self.session.key();
        let mut notes = Vec::new();
        let mut cache_docs = Vec::new();

        for (id, doc) in docs {
            match normalize(&id, &doc.value, key.as_ref()) {
                Ok(note) => {
                    cache_docs.push((id, doc.value.to_string()));
                    notes.push(note);
                }
                Err(e @ (CryptoError::MissingKey | CryptoError::DecryptFailed)) => {
                    self.session.lock_pending_reauth(&e);
                    let _ = self.events.send(SyncEvent::ReauthRequired(e));
                    return;
                }
                Err(e) => {
                    // Corrupted single note: skip it, keep the rest
                    log(&format!("notes listener: skipping note {}: {}", id, e));
                    let _ = self.events.send(SyncEvent::PayloadInvalid {
                        path: format!("{}/{}", notes_path(uid), id),
                    });
                }
            }
        }

        sort_notes(&mut notes);
        *self.notes.lock().unwrap() = notes;
        if let Err(e) = self.cache.upsert_note_docs(uid, cache_docs).await {
            log(&format!("notes listener: cache write failed: {}", e));
        }
        let _ = self.events.send(SyncEvent::NotesUpdated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthUser, MemoryStore};
    use serde_json::json;
    use zeroize::Zeroizing;

    fn test_key() -> Key {
        Zeroizing::new([3u8; 32])
    }

    fn other_key() -> Key {
        Zeroizing::new([4u8; 32])
    }

    fn encrypted_doc(key: &Key, text: &str, updated_at: &str) -> Value {
        json!({
            "payload": crypto::encrypt_text(Some(key), text).unwrap(),
            "createdAt": "2026-08-01T10:00:00Z",
            "updatedAt": updated_at,
            "dateKey": "2026-08-01",
            "fastContext": {
                "wasActive": true,
                "fastTypeId": "16_8",
                "elapsedMsAtNote": 3_600_000,
            },
        })
    }

    #[test]
    fn normalize_current_shape() {
        let key = test_key();
        let doc = encrypted_doc(&key, "hour one down", "2026-08-01T11:00:00Z");
        let note = normalize("n1", &doc, Some(&key)).unwrap();
        assert_eq!(note.text, "hour one down");
        assert!(note.fast_context.was_active);
        assert_eq!(note.fast_context.fast_type_id.as_deref(), Some("16_8"));
        assert_eq!(note.fast_context.elapsed_ms_at_note, Some(3_600_000));
    }

    #[test]
    fn normalize_legacy_plaintext_text() {
        let doc = json!({
            "text": "from before encryption",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
            "dateKey": "2024-01-01",
        });
        // No key needed for the legacy path
        let note = normalize("n1", &doc, None).unwrap();
        assert_eq!(note.text, "from before encryption");
        assert!(!note.fast_context.was_active);
        assert_eq!(note.fast_context.elapsed_ms_at_note, None);
    }

    #[test]
    fn normalize_legacy_flat_fast_context() {
        let doc = json!({
            "text": "flat shape",
            "fastActive": true,
            "fastTypeId": "24",
            "fastElapsedMs": 1000,
        });
        let note = normalize("n1", &doc, None).unwrap();
        assert!(note.fast_context.was_active);
        assert_eq!(note.fast_context.fast_type_id.as_deref(), Some("24"));
        assert_eq!(note.fast_context.elapsed_ms_at_note, Some(1000));
    }

    #[test]
    fn normalize_distinguishes_missing_key_from_wrong_key() {
        let key = test_key();
        let doc = encrypted_doc(&key, "secret", "2026-08-01T11:00:00Z");
        assert_eq!(
            normalize("n1", &doc, None).unwrap_err(),
            CryptoError::MissingKey
        );
        assert_eq!(
            normalize("n1", &doc, Some(&other_key())).unwrap_err(),
            CryptoError::DecryptFailed
        );
    }

    #[test]
    fn normalize_rejects_empty_document() {
        let doc = json!({ "createdAt": "2026-01-01T00:00:00Z" });
        assert!(matches!(
            normalize("n1", &doc, None).unwrap_err(),
            CryptoError::InvalidPayload(_)
        ));
    }

    #[test]
    fn sort_is_updated_at_desc_with_id_tiebreak() {
        let mk = |id: &str, updated: &str| Note {
            id: id.to_string(),
            text: String::new(),
            created_at: String::new(),
            updated_at: updated.to_string(),
            date_key: String::new(),
            fast_context: FastContext::default(),
        };
        let mut notes = vec![
            mk("a", "2026-08-01T10:00:00Z"),
            mk("b", "2026-08-02T10:00:00Z"),
            mk("c", "2026-08-01T10:00:00Z"),
        ];
        sort_notes(&mut notes);
        let ids: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    fn fixture(uid: &str) -> (MemoryStore, NotesSync, Session, mpsc::UnboundedReceiver<SyncEvent>) {
        let store = MemoryStore::new();
        let session = Session::new();
        session.begin_credentials(AuthUser {
            id: uid.to_string(),
            email: format!("{}@example.com", uid),
            email_verified: true,
        });
        session.establish_key(test_key(), "salt".to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let sync = NotesSync::new(
            Arc::new(store.clone()),
            Cache::in_memory().unwrap(),
            session.clone(),
            tx,
        );
        (store, sync, session, rx)
    }

    #[tokio::test]
    async fn create_during_fast_captures_context() {
        let (_store, sync, _session, _rx) = fixture("u1");
        let mut app_state = AppState::default();
        let start = 1_700_000_000_000;
        app_state.start_fast("16_8", start).unwrap();

        let note = sync
            .create("feeling fine", &app_state, start + 7_200_000)
            .await
            .unwrap();
        assert!(note.fast_context.was_active);
        assert_eq!(note.fast_context.fast_type_id.as_deref(), Some("16_8"));
        assert_eq!(note.fast_context.elapsed_ms_at_note, Some(7_200_000));
    }

    #[tokio::test]
    async fn create_without_fast_has_null_context() {
        let (_store, sync, _session, _rx) = fixture("u1");
        let note = sync
            .create("idle note", &AppState::default(), 1_700_000_000_000)
            .await
            .unwrap();
        assert!(!note.fast_context.was_active);
        assert_eq!(note.fast_context.fast_type_id, None);
        assert_eq!(note.fast_context.elapsed_ms_at_note, None);
    }

    #[tokio::test]
    async fn created_note_roundtrips_through_store() {
        let (store, sync, _session, _rx) = fixture("u1");
        let note = sync
            .create("roundtrip", &AppState::default(), 1_700_000_000_000)
            .await
            .unwrap();

        let docs = store.list_collection(&notes_path("u1")).await.unwrap();
        assert_eq!(docs.len(), 1);
        // Stored body is ciphertext, not the text
        assert!(docs[0].1.value.get("text").is_none());
        let recovered = normalize(&note.id, &docs[0].1.value, Some(&test_key())).unwrap();
        assert_eq!(recovered.text, "roundtrip");
    }

    #[tokio::test]
    async fn listener_decrypt_failure_triggers_reauth() {
        let (store, writer, _ws, _wrx) = fixture("u1");

        // Second device with the wrong key
        let session = Session::new();
        session.begin_credentials(AuthUser {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            email_verified: true,
        });
        session.establish_key(other_key(), "salt".to_string());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = NotesSync::new(
            Arc::new(store),
            Cache::in_memory().unwrap(),
            session.clone(),
            tx,
        );
        let _listener = reader.spawn_listener().unwrap();

        writer
            .create("private", &AppState::default(), 1_700_000_000_000)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            SyncEvent::ReauthRequired(CryptoError::DecryptFailed) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            session.phase(),
            crate::session::AuthPhase::LockedPendingReauth
        );
    }

    #[tokio::test]
    async fn edited_note_survives_offline_reload() {
        let (store, sync, session, _rx) = fixture("u1");
        let note = sync
            .create("first draft", &AppState::default(), 1_700_000_000_000)
            .await
            .unwrap();
        sync.update(&note.id, "second draft").await.unwrap();

        store.set_offline(true);
        let reloaded = NotesSync::new(
            Arc::new(store),
            sync.cache.clone(),
            session,
            mpsc::unbounded_channel().0,
        );
        reloaded.load_cached().await.unwrap();
        assert_eq!(reloaded.notes()[0].text, "second draft");
        // Metadata from creation is still on the cached document
        assert_eq!(reloaded.notes()[0].created_at, note.created_at);
    }

    #[tokio::test]
    async fn cached_notes_load_offline() {
        let (store, sync, session, _rx) = fixture("u1");
        sync.create("kept locally", &AppState::default(), 1_700_000_000_000)
            .await
            .unwrap();

        store.set_offline(true);
        let reloaded = NotesSync::new(
            Arc::new(store),
            sync.cache.clone(),
            session,
            mpsc::unbounded_channel().0,
        );
        reloaded.load_cached().await.unwrap();
        assert_eq!(reloaded.notes().len(), 1);
        assert_eq!(reloaded.notes()[0].text, "kept locally");
    }
}
