//! Durable save/restore of sessions.
//!
//! The engine only talks to [`CheckpointGateway`]. Two reference stores are
//! provided: [`InMemoryCheckpointStore`] for tests and embedding, and
//! [`FileCheckpointStore`] which keeps one pretty-printed JSON document per
//! session.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = FileCheckpointStore::new("/var/lib/weave/sessions");
//! store.save(&session.session_id, &session).await?;
//! let restored = store.load(&session.session_id).await?;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{CheckpointError, CheckpointResult};
use crate::session::Session;

/// Durable storage for sessions, keyed by session id.
#[async_trait]
pub trait CheckpointGateway: Send + Sync {
    /// Save (or overwrite) a session.
    async fn save(&self, session_id: &str, session: &Session) -> CheckpointResult<()>;

    /// Load a session, `None` if it was never saved or was deleted.
    async fn load(&self, session_id: &str) -> CheckpointResult<Option<Session>>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn delete(&self, session_id: &str) -> CheckpointResult<()>;

    /// Ids of all stored sessions.
    async fn list(&self) -> CheckpointResult<Vec<String>>;

    /// Delete finished sessions last updated before `cutoff`.
    ///
    /// Returns the number of sessions removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> CheckpointResult<usize> {
        let mut removed = 0;
        for id in self.list().await? {
            if let Some(session) = self.load(&id).await? {
                if session.is_terminal() && session.updated_at < cutoff {
                    self.delete(&id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// On-disk document wrapping a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Version of the document format.
    pub format_version: u32,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
    /// The session itself.
    pub session: Session,
}

impl Checkpoint {
    /// Current document format version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Wrap a session.
    pub fn new(session: Session) -> Self {
        Self {
            format_version: Self::CURRENT_VERSION,
            saved_at: Utc::now(),
            session,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> CheckpointResult<String> {
        serde_json::to_string_pretty(self).map_err(CheckpointError::from)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> CheckpointResult<Self> {
        serde_json::from_str(json).map_err(CheckpointError::from)
    }
}

/// Store keeping sessions in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemoryCheckpointStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointGateway for InMemoryCheckpointStore {
    async fn save(&self, session_id: &str, session: &Session) -> CheckpointResult<()> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> CheckpointResult<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> CheckpointResult<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> CheckpointResult<Vec<String>> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Store writing one `<id>.session.json` file per session.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
}

impl FileCheckpointStore {
    const SUFFIX: &'static str = ".session.json";

    /// Create a store rooted at `base_path`. The directory is created on
    /// first save.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Path of the file backing a session.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join(format!("{}{}", session_id, Self::SUFFIX))
    }
}

#[async_trait]
impl CheckpointGateway for FileCheckpointStore {
    async fn save(&self, session_id: &str, session: &Session) -> CheckpointResult<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;

        let json = Checkpoint::new(session.clone()).to_json()?;
        let path = self.session_path(session_id);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;

        #[cfg(unix)]
        {
            if let Ok(dir) = tokio::fs::File::open(&self.base_path).await {
                let _ = dir.sync_all().await;
            }
        }

        tracing::debug!(session_id = session_id, path = ?path, "Saved checkpoint");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> CheckpointResult<Option<Session>> {
        let path = self.session_path(session_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = Checkpoint::from_json(&json)?;

        tracing::debug!(session_id = session_id, path = ?path, "Loaded checkpoint");
        Ok(Some(checkpoint.session))
    }

    async fn delete(&self, session_id: &str) -> CheckpointResult<()> {
        let path = self.session_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(session_id = session_id, "Deleted checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> CheckpointResult<Vec<String>> {
        let mut ids = Vec::new();
        if !self.base_path.exists() {
            return Ok(ids);
        }

        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(id) = name.strip_suffix(Self::SUFFIX) {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::session::SessionStatus;
    use crate::task::Task;
    use chrono::Duration;

    fn session(id: &str) -> Session {
        let plan = Plan::new(vec![
            Task::new("a", "echo"),
            Task::new("b", "echo").depends_on("a"),
        ])
        .unwrap();
        Session::new(id, plan, Utc::now())
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        let s = session("s-1");

        store.save("s-1", &s).await.unwrap();
        assert_eq!(store.load("s-1").await.unwrap(), Some(s));
        assert_eq!(store.list().await.unwrap(), vec!["s-1"]);

        store.delete("s-1").await.unwrap();
        assert!(store.load("s-1").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("sessions"));
        let s = session("s-2");

        assert!(store.list().await.unwrap().is_empty());
        store.save("s-2", &s).await.unwrap();
        assert!(store.session_path("s-2").exists());

        let loaded = store.load("s-2").await.unwrap().unwrap();
        assert_eq!(loaded, s);
        assert_eq!(store.list().await.unwrap(), vec!["s-2"]);

        store.delete("s-2").await.unwrap();
        store.delete("s-2").await.unwrap();
        assert!(store.load("s-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        std::fs::write(store.session_path("bad"), "{not json").unwrap();

        assert!(matches!(
            store.load("bad").await,
            Err(CheckpointError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_finished_sessions() {
        let store = InMemoryCheckpointStore::new();
        let now = Utc::now();

        let mut old_done = session("old-done");
        old_done.status = SessionStatus::Completed;
        old_done.updated_at = now - Duration::hours(48);

        let mut old_running = session("old-running");
        old_running.updated_at = now - Duration::hours(48);

        let mut fresh_done = session("fresh-done");
        fresh_done.status = SessionStatus::Cancelled;

        for s in [&old_done, &old_running, &fresh_done] {
            store.save(&s.session_id, s).await.unwrap();
        }

        let removed = store.purge_older_than(now - Duration::hours(24)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.list().await.unwrap(),
            vec!["fresh-done".to_string(), "old-running".to_string()]
        );
    }
}
