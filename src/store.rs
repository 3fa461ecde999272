//! Remote storage and auth abstractions. The sync layer talks to a generic
//! keyed document store so the actual backend stays swappable; the shipped
//! implementation is a JSON HTTP API with bearer auth. Subscriptions are
//! delivered as change events over a channel, backed by polling.

use crate::config;
use crate::logger::log;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision conflict at {path} (current rev {current_rev})")]
    Conflict { path: String, current_rev: u64 },
    #[error("unauthorized")]
    Unauthorized,
    #[error("storage error: {0}")]
    Io(String),
}

/// A stored document plus the store's monotonic revision for its path.
/// Revisions start at 1 and bump on every write; they are what the state
/// synchronizer uses to reject stale writes and stale notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub value: Value,
    pub rev: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Merge object fields into the existing document instead of replacing.
    pub merge: bool,
    /// Precondition: the write only lands if the current revision matches.
    /// `Some(0)` means "document must not exist yet".
    pub expected_rev: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Document changed (or was deleted, `None`).
    Document { path: String, doc: Option<Document> },
    /// Full collection snapshot after a change.
    Collection {
        path: String,
        docs: Vec<(String, Document)>,
    },
    Error(String),
}

/// Live subscription: events arrive on `rx`; dropping the handle tears the
/// feed down. Subscribers must re-check the session identity on every event
/// before touching shared state.
pub struct Subscription {
    pub rx: mpsc::UnboundedReceiver<StoreEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError>;
    /// Returns the new revision.
    async fn set_document(
        &self,
        path: &str,
        value: Value,
        opts: SetOptions,
    ) -> Result<u64, StoreError>;
    async fn delete_document(&self, path: &str) -> Result<(), StoreError>;
    /// Add to a collection under a generated id; returns the id.
    async fn add_document(&self, collection: &str, value: Value) -> Result<String, StoreError>;
    async fn list_collection(&self, path: &str) -> Result<Vec<(String, Document)>, StoreError>;
    fn subscribe_document(&self, path: &str) -> Subscription;
    fn subscribe_collection(&self, path: &str) -> Subscription;
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub email_verified: bool,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, StoreError>;
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, StoreError>;
    async fn sign_out(&self) -> Result<(), StoreError>;
    fn current_user(&self) -> Option<AuthUser>;
}

fn merge_values(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: config::get_api_base_url(),
        }
    }

    async fn authenticated_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, StoreError> {
        let mut attempts = 0;
        let max_attempts = 3;

        loop {
            attempts += 1;
            let url = format!("{}{}", self.base_url, path);
            let mut builder = self.client.request(method.clone(), &url);

            let token = config::get_token();
            if !token.is_empty() {
                builder = builder.bearer_auth(token);
            }

            if let Some(b) = body {
                builder = builder.json(b);
            }

            let res = builder.send().await;

            match res {
                Ok(resp) => {
                    if resp.status() == StatusCode::UNAUTHORIZED
                        && attempts == 1
                        && self.refresh_token().await.is_ok()
                    {
                        continue;
                    }

                    if resp.status().is_server_error() && attempts < max_attempts {
                        time::sleep(Duration::from_millis(500 * attempts)).await;
                        continue;
                    }

                    return Ok(resp);
                }
                Err(_) if attempts < max_attempts => {
                    time::sleep(Duration::from_millis(500 * attempts)).await;
                    continue;
                }
                Err(e) => return Err(StoreError::Io(e.to_string())),
            }
        }
    }

    async fn refresh_token(&self) -> Result<(), StoreError> {
        let data = config::get_token_data();
        if data.refresh_token.is_empty() {
            return Err(StoreError::Unauthorized);
        }

        let resp = self
            .client
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&serde_json::json!({ "refresh_token": data.refresh_token }))
            .send()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        if resp.status() != StatusCode::OK {
            return Err(StoreError::Unauthorized);
        }

        #[derive(Deserialize)]
        struct RefreshRes {
            id_token: String,
            refresh_token: String,
        }
        let res: RefreshRes = resp
            .json()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        config::save_token_data(&res.id_token, &res.refresh_token)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct DocRes {
    value: Value,
    rev: u64,
}

#[derive(Deserialize)]
struct RevRes {
    rev: u64,
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let resp = self
            .authenticated_request(Method::GET, &format!("/docs/{}", path), None)
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let res: DocRes = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                Ok(Some(Document {
                    value: res.value,
                    rev: res.rev,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Unauthorized),
            s => Err(StoreError::Io(format!("get {} failed: {}", path, s))),
        }
    }

    async fn set_document(
        &self,
        path: &str,
        value: Value,
        opts: SetOptions,
    ) -> Result<u64, StoreError> {
        let body = serde_json::json!({
            "value": value,
            "merge": opts.merge,
            "expected_rev": opts.expected_rev,
        });
        let resp = self
            .authenticated_request(Method::PUT, &format!("/docs/{}", path), Some(&body))
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let res: RevRes = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                Ok(res.rev)
            }
            StatusCode::CONFLICT => {
                let res: RevRes = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                Err(StoreError::Conflict {
                    path: path.to_string(),
                    current_rev: res.rev,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Unauthorized),
            s => Err(StoreError::Io(format!("set {} failed: {}", path, s))),
        }
    }

    async fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        let resp = self
            .authenticated_request(Method::DELETE, &format!("/docs/{}", path), None)
            .await?;
        if resp.status() == StatusCode::OK || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StoreError::Io(format!(
                "delete {} failed: {}",
                path,
                resp.status()
            )))
        }
    }

    async fn add_document(&self, collection: &str, value: Value) -> Result<String, StoreError> {
        let body = serde_json::json!({ "value": value });
        let resp = self
            .authenticated_request(
                Method::POST,
                &format!("/collections/{}", collection),
                Some(&body),
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(StoreError::Io(format!(
                "add to {} failed: {}",
                collection,
                resp.status()
            )));
        }
        #[derive(Deserialize)]
        struct AddRes {
            id: String,
        }
        let res: AddRes = resp
            .json()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(res.id)
    }

    async fn list_collection(&self, path: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let resp = self
            .authenticated_request(Method::GET, &format!("/collections/{}", path), None)
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(StoreError::Io(format!(
                "list {} failed: {}",
                path,
                resp.status()
            )));
        }
        #[derive(Deserialize)]
        struct Row {
            id: String,
            value: Value,
            rev: u64,
        }
        #[derive(Deserialize)]
        struct ListRes {
            docs: Vec<Row>,
        }
        let res: ListRes = resp
            .json()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(res
            .docs
            .into_iter()
            .map(|r| {
                (
                    r.id,
                    Document {
                        value: r.value,
                        rev: r.rev,
                    },
                )
            })
            .collect())
    }

    fn subscribe_document(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let path = path.to_string();
        let task = tokio::spawn(async move {
            let mut last_rev: Option<u64> = None;
            let mut interval = time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                match store.get_document(&path).await {
                    Ok(doc) => {
                        let rev = doc.as_ref().map(|d| d.rev);
                        if rev != last_rev {
                            last_rev = rev;
                            if tx
                                .send(StoreEvent::Document {
                                    path: path.clone(),
                                    doc,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        // Transient; the next tick retries
                        let _ = tx.send(StoreEvent::Error(e.to_string()));
                    }
                }
            }
        });
        Subscription {
            rx,
            task: Some(task),
        }
    }

    fn subscribe_collection(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let path = path.to_string();
        let task = tokio::spawn(async move {
            let mut last_revs: Option<Vec<(String, u64)>> = None;
            let mut interval = time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                match store.list_collection(&path).await {
                    Ok(docs) => {
                        let revs: Vec<(String, u64)> =
                            docs.iter().map(|(id, d)| (id.clone(), d.rev)).collect();
                        if Some(&revs) != last_revs.as_ref() {
                            last_revs = Some(revs);
                            if tx
                                .send(StoreEvent::Collection {
                                    path: path.clone(),
                                    docs,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(StoreEvent::Error(e.to_string()));
                    }
                }
            }
        });
        Subscription {
            rx,
            task: Some(task),
        }
    }
}

pub struct HttpAuth {
    client: Client,
    base_url: String,
}

impl HttpAuth {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: config::get_api_base_url(),
        }
    }

    async fn credential_request(
        &self,
        endpoint: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthUser, StoreError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(StoreError::Unauthorized)
            }
            s => return Err(StoreError::Io(format!("{} failed: {}", endpoint, s))),
        }

        #[derive(Deserialize)]
        struct TokenRes {
            id_token: String,
            refresh_token: String,
        }
        let res: TokenRes = resp
            .json()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        config::save_token_data(&res.id_token, &res.refresh_token)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        self.current_user()
            .ok_or_else(|| StoreError::Io("token missing identity claims".to_string()))
    }
}

#[async_trait]
impl AuthProvider for HttpAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, StoreError> {
        self.credential_request("/auth/signin", email, password).await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, StoreError> {
        self.credential_request("/auth/signup", email, password).await
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        config::delete_token_data().map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn current_user(&self) -> Option<AuthUser> {
        let token = config::get_token();
        if token.is_empty() {
            return None;
        }
        let id = config::get_user_id_from_token(&token).ok()?;
        let email = config::get_user_email_from_token(&token).ok()?;
        let email_verified = config::get_email_verified_from_token(&token).unwrap_or(false);
        Some(AuthUser {
            id,
            email,
            email_verified,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (test suite backend)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    docs: HashMap<String, Document>,
    offline: bool,
    doc_subs: Vec<(String, mpsc::UnboundedSender<StoreEvent>)>,
    coll_subs: Vec<(String, mpsc::UnboundedSender<StoreEvent>)>,
}

/// In-memory `DocumentStore` with the same revision and subscription
/// semantics as the HTTP backend. Backs the test suite; `set_offline` makes
/// every call fail so cache-fallback paths can be exercised.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    fn check_online(inner: &MemoryInner) -> Result<(), StoreError> {
        if inner.offline {
            Err(StoreError::Io("store unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn collection_of(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(coll, _)| coll)
    }

    fn notify(inner: &mut MemoryInner, path: &str) {
        let doc = inner.docs.get(path).cloned();
        inner.doc_subs.retain(|(p, tx)| {
            if p != path {
                return true;
            }
            tx.send(StoreEvent::Document {
                path: path.to_string(),
                doc: doc.clone(),
            })
            .is_ok()
        });

        if let Some(coll) = Self::collection_of(path) {
            let snapshot: Vec<(String, Document)> = inner
                .docs
                .iter()
                .filter_map(|(p, d)| {
                    let (c, id) = p.rsplit_once('/')?;
                    (c == coll).then(|| (id.to_string(), d.clone()))
                })
                .collect();
            let coll = coll.to_string();
            inner.coll_subs.retain(|(p, tx)| {
                if *p != coll {
                    return true;
                }
                tx.send(StoreEvent::Collection {
                    path: coll.clone(),
                    docs: snapshot.clone(),
                })
                .is_ok()
            });
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;
        Ok(inner.docs.get(path).cloned())
    }

    async fn set_document(
        &self,
        path: &str,
        value: Value,
        opts: SetOptions,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;

        let current_rev = inner.docs.get(path).map(|d| d.rev).unwrap_or(0);
        if let Some(expected) = opts.expected_rev {
            if expected != current_rev {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    current_rev,
                });
            }
        }

        let new_rev = current_rev + 1;
        let new_value = if opts.merge {
            let mut base = inner
                .docs
                .get(path)
                .map(|d| d.value.clone())
                .unwrap_or_else(|| Value::Object(Default::default()));
            merge_values(&mut base, value);
            base
        } else {
            value
        };

        inner.docs.insert(
            path.to_string(),
            Document {
                value: new_value,
                rev: new_rev,
            },
        );
        Self::notify(&mut inner, path);
        Ok(new_rev)
    }

    async fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;
        inner.docs.remove(path);
        Self::notify(&mut inner, path);
        Ok(())
    }

    async fn add_document(&self, collection: &str, value: Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = format!("{}/{}", collection, id);
        self.set_document(&path, value, SetOptions::default())
            .await?;
        Ok(id)
    }

    async fn list_collection(&self, path: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;
        Ok(inner
            .docs
            .iter()
            .filter_map(|(p, d)| {
                let (coll, id) = p.rsplit_once('/')?;
                (coll == path).then(|| (id.to_string(), d.clone()))
            })
            .collect())
    }

    fn subscribe_document(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .doc_subs
            .push((path.to_string(), tx));
        Subscription { rx, task: None }
    }

    fn subscribe_collection(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .coll_subs
            .push((path.to_string(), tx));
        Subscription { rx, task: None }
    }
}

/// Scripted auth provider for tests.
#[cfg(test)]
pub struct MemoryAuth {
    pub user: AuthUser,
    signed_in: Mutex<bool>,
}

#[cfg(test)]
impl MemoryAuth {
    pub fn new(uid: &str, email: &str) -> Self {
        Self {
            user: AuthUser {
                id: uid.to_string(),
                email: email.to_string(),
                email_verified: true,
            },
            signed_in: Mutex::new(false),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn sign_in(&self, _email: &str, _password: &str) -> Result<AuthUser, StoreError> {
        *self.signed_in.lock().unwrap() = true;
        Ok(self.user.clone())
    }

    async fn sign_up(&self, _email: &str, _password: &str) -> Result<AuthUser, StoreError> {
        *self.signed_in.lock().unwrap() = true;
        Ok(self.user.clone())
    }

    async fn sign_out(&self) -> Result<(), StoreError> {
        *self.signed_in.lock().unwrap() = false;
        Ok(())
    }

    fn current_user(&self) -> Option<AuthUser> {
        self.signed_in
            .lock()
            .unwrap()
            .then(|| self.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn revisions_bump_and_guard_writes() {
        let store = MemoryStore::new();
        let rev1 = store
            .set_document("users/u1/state", json!({"a": 1}), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(rev1, 1);

        // Precondition mismatch is rejected
        let err = store
            .set_document(
                "users/u1/state",
                json!({"a": 2}),
                SetOptions {
                    merge: false,
                    expected_rev: Some(0),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { current_rev: 1, .. }));

        let rev2 = store
            .set_document(
                "users/u1/state",
                json!({"a": 2}),
                SetOptions {
                    merge: false,
                    expected_rev: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(rev2, 2);
    }

    #[tokio::test]
    async fn merge_preserves_sibling_fields() {
        let store = MemoryStore::new();
        store
            .set_document(
                "users/u1/profile",
                json!({"verification": {"sentAt": "x"}}),
                SetOptions::default(),
            )
            .await
            .unwrap();
        store
            .set_document(
                "users/u1/profile",
                json!({"crypto": {"salt": "abc"}}),
                SetOptions {
                    merge: true,
                    expected_rev: None,
                },
            )
            .await
            .unwrap();

        let doc = store.get_document("users/u1/profile").await.unwrap().unwrap();
        assert_eq!(doc.value["crypto"]["salt"], "abc");
        assert_eq!(doc.value["verification"]["sentAt"], "x");
    }

    #[tokio::test]
    async fn document_subscription_fires_on_change() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe_document("users/u1/state");
        store
            .set_document("users/u1/state", json!({"a": 1}), SetOptions::default())
            .await
            .unwrap();

        match sub.rx.recv().await.unwrap() {
            StoreEvent::Document { doc: Some(doc), .. } => {
                assert_eq!(doc.rev, 1);
                assert_eq!(doc.value["a"], 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn collection_subscription_snapshots() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe_collection("users/u1/notes");
        let id = store
            .add_document("users/u1/notes", json!({"text": "hi"}))
            .await
            .unwrap();

        match sub.rx.recv().await.unwrap() {
            StoreEvent::Collection { docs, .. } => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0].0, id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn offline_store_errors() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(store.get_document("x/y").await.is_err());
    }

    #[tokio::test]
    async fn auth_has_no_user_until_sign_in() {
        let auth = MemoryAuth::new("u1", "a@b.c");
        assert!(auth.current_user().is_none());

        let user = auth.sign_in("a@b.c", "pw").await.unwrap();
        assert_eq!(user.id, "u1");
        assert!(auth.current_user().is_some());

        auth.sign_out().await.unwrap();
        assert!(auth.current_user().is_none());
    }
}
