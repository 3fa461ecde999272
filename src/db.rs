//! Local fallback cache. Holds the last-known-good encrypted state payload,
//! the salt, wrapped key records, and a mirror of the notes collection so a
//! device that goes offline after a successful sync can still come up.
//!
//! SQLite lives on a dedicated actor thread; the async side talks to it over
//! an unbounded channel with oneshot replies.

use crate::config;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};

pub enum CacheRequest {
    GetKv {
        key: String,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    SetKv {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteKv {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    UpsertNoteDocs {
        uid: String,
        docs: Vec<(String, String)>,
        reply: oneshot::Sender<Result<()>>,
    },
    GetNoteDocs {
        uid: String,
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    DeleteNoteDoc {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearUser {
        uid: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct Cache {
    tx: mpsc::UnboundedSender<CacheRequest>,
}

impl Cache {
    pub fn new() -> Result<Self> {
        let config_dir = config::get_config_dir();
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        let mut db_path = config_dir;
        db_path.push("local.db");

        let conn = Connection::open(db_path).context("Failed to open cache database")?;
        Self::spawn(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cache")?;
        Self::spawn(conn)
    }

    fn spawn(conn: Connection) -> Result<Self> {
        // Initialize synchronously so we fail early if the schema is broken.
        let mut actor = CacheInternal::new(conn).context("Failed to initialize cache actor")?;
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            actor.run(rx);
        });
        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> CacheRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| anyhow::anyhow!("Cache actor shutdown"))?;
        rx.await.context("Cache actor dropped reply")?
    }

    pub async fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.request(|reply| CacheRequest::GetKv { key, reply }).await
    }

    pub async fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.request(|reply| CacheRequest::SetKv { key, value, reply })
            .await
    }

    pub async fn delete_kv(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.request(|reply| CacheRequest::DeleteKv { key, reply })
            .await
    }

    // --- Namespaced helpers (all keyed per user id) ---

    pub async fn get_state_doc(&self, uid: &str) -> Result<Option<String>> {
        self.get_kv(&format!("state_doc:{}", uid)).await
    }

    pub async fn set_state_doc(&self, uid: &str, doc_json: &str) -> Result<()> {
        self.set_kv(&format!("state_doc:{}", uid), doc_json).await
    }

    pub async fn get_salt(&self, uid: &str) -> Result<Option<String>> {
        self.get_kv(&format!("salt:{}", uid)).await
    }

    pub async fn set_salt(&self, uid: &str, salt: &str) -> Result<()> {
        self.set_kv(&format!("salt:{}", uid), salt).await
    }

    pub async fn get_wrapped_key(&self, uid: &str) -> Result<Option<String>> {
        self.get_kv(&format!("wrapped_key:{}", uid)).await
    }

    pub async fn set_wrapped_key(&self, uid: &str, record_json: &str) -> Result<()> {
        self.set_kv(&format!("wrapped_key:{}", uid), record_json)
            .await
    }

    pub async fn delete_wrapped_key(&self, uid: &str) -> Result<()> {
        self.delete_kv(&format!("wrapped_key:{}", uid)).await
    }

    pub async fn upsert_note_docs(&self, uid: &str, docs: Vec<(String, String)>) -> Result<()> {
        let uid = uid.to_string();
        self.request(|reply| CacheRequest::UpsertNoteDocs { uid, docs, reply })
            .await
    }

    pub async fn get_note_docs(&self, uid: &str) -> Result<Vec<(String, String)>> {
        let uid = uid.to_string();
        self.request(|reply| CacheRequest::GetNoteDocs { uid, reply })
            .await
    }

    pub async fn delete_note_doc(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| CacheRequest::DeleteNoteDoc { id, reply })
            .await
    }

    /// Drop everything cached for one user. Used on explicit sign-out when
    /// the user opts out of keeping local data.
    pub async fn clear_user(&self, uid: &str) -> Result<()> {
        let uid = uid.to_string();
        self.request(|reply| CacheRequest::ClearUser { uid, reply })
            .await
    }
}

struct CacheInternal {
    conn: Connection,
}

impl CacheInternal {
    fn new(conn: Connection) -> Result<Self> {
        let internal = Self { conn };
        internal.create_tables().context("Failed to create tables")?;
        Ok(internal)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT
            );",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS note_docs (
                id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                doc TEXT NOT NULL
            );",
            [],
        )?;

        Ok(())
    }

    fn run(&mut self, mut rx: mpsc::UnboundedReceiver<CacheRequest>) {
        while let Some(req) = rx.blocking_recv() {
            match req {
                CacheRequest::GetKv { key, reply } => {
                    let _ = reply.send(self.get_kv(&key));
                }
                CacheRequest::SetKv { key, value, reply } => {
                    let _ = reply.send(self.set_kv(&key, &value));
                }
                CacheRequest::DeleteKv { key, reply } => {
                    let _ = reply.send(self.delete_kv(&key));
                }
                CacheRequest::UpsertNoteDocs { uid, docs, reply } => {
                    let _ = reply.send(self.upsert_note_docs(&uid, docs));
                }
                CacheRequest::GetNoteDocs { uid, reply } => {
                    let _ = reply.send(self.get_note_docs(&uid));
                }
                CacheRequest::DeleteNoteDoc { id, reply } => {
                    let _ = reply.send(self.delete_note_doc(&id));
                }
                CacheRequest::ClearUser { uid, reply } => {
                    let _ = reply.send(self.clear_user(&uid));
                }
            }
        }
    }

    fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let res: Result<String, rusqlite::Error> = self.conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );

        match res {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_kv(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn upsert_note_docs(&mut self, uid: &str, docs: Vec<(String, String)>) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (id, doc) in docs {
            tx.execute(
                "INSERT INTO note_docs (id, uid, doc) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
                params![id, uid, doc],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_note_docs(&self, uid: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, doc FROM note_docs WHERE uid = ?1")?;
        let iter = stmt.query_map(params![uid], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut docs = Vec::new();
        for doc in iter {
            docs.push(doc?);
        }
        Ok(docs)
    }

    fn delete_note_doc(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM note_docs WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn clear_user(&self, uid: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM note_docs WHERE uid = ?1", params![uid])?;
        self.conn.execute(
            "DELETE FROM kv_store WHERE key LIKE '%:' || ?1",
            params![uid],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_roundtrip_and_delete() {
        let cache = Cache::in_memory().unwrap();
        assert_eq!(cache.get_kv("missing").await.unwrap(), None);

        cache.set_salt("u1", "c2FsdA==").await.unwrap();
        assert_eq!(
            cache.get_salt("u1").await.unwrap(),
            Some("c2FsdA==".to_string())
        );

        cache.delete_kv("salt:u1").await.unwrap();
        assert_eq!(cache.get_salt("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn note_docs_are_scoped_by_user() {
        let cache = Cache::in_memory().unwrap();
        cache
            .upsert_note_docs("u1", vec![("n1".into(), "{}".into())])
            .await
            .unwrap();
        cache
            .upsert_note_docs("u2", vec![("n2".into(), "{}".into())])
            .await
            .unwrap();

        let u1_docs = cache.get_note_docs("u1").await.unwrap();
        assert_eq!(u1_docs.len(), 1);
        assert_eq!(u1_docs[0].0, "n1");
    }

    #[tokio::test]
    async fn cloned_handle_talks_to_the_same_database() {
        let cache = Cache::in_memory().unwrap();
        let clone = cache.clone();

        clone.set_kv("shared", "value").await.unwrap();
        assert_eq!(
            cache.get_kv("shared").await.unwrap(),
            Some("value".to_string())
        );
    }

    #[tokio::test]
    async fn clear_user_removes_all_namespaced_rows() {
        let cache = Cache::in_memory().unwrap();
        cache.set_salt("u1", "s").await.unwrap();
        cache.set_state_doc("u1", "{}").await.unwrap();
        cache
            .upsert_note_docs("u1", vec![("n1".into(), "{}".into())])
            .await
            .unwrap();

        cache.clear_user("u1").await.unwrap();
        assert_eq!(cache.get_salt("u1").await.unwrap(), None);
        assert_eq!(cache.get_state_doc("u1").await.unwrap(), None);
        assert!(cache.get_note_docs("u1").await.unwrap().is_empty());
    }
}
