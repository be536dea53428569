//! # Storage - direct-message persistence
//!
//! Conversations survive restarts through a [`MessageRepository`]. The shipped
//! implementation, [`JsonMessageStore`], keeps one JSON document per session:
//!
//! ```text
//! data/
//! └── conversations/
//!     └── <percent-encoded session>.json
//! ```
//!
//! A session is the device address, so switching radios switches history.
//! Writes are atomic (temp file + rename) under an exclusive `fs2` lock.
//!
//! The stores never wait on disk. They hand records to a [`PersistenceHandle`],
//! a queue drained by a background task. Saves are capped: past the cap a save
//! is dropped with a warning. Deletes and clears are always queued, in order.

use std::collections::HashMap;
use std::fs::{self as sfs, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::conversation_store::Message;
use crate::protocol::node_id::format_node_id;
use crate::validation::{safe_filename, secure_json_parse, SecurityError};

/// Upper bound for a single session file.
pub const MAX_SESSION_FILE_BYTES: usize = 16 * 1024 * 1024;
const FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize conversations: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt session file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: SecurityError,
    },
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Durable home for direct messages, keyed by session.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// All messages of a session, oldest first. A missing session is empty, not an error.
    async fn load(&self, session: &str) -> Result<Vec<Message>, StorageError>;
    /// Insert or replace, matching on [`Message::key`].
    async fn save(&self, session: &str, message: &Message) -> Result<(), StorageError>;
    async fn delete_peer(&self, session: &str, peer: u32) -> Result<(), StorageError>;
    async fn clear(&self, session: &str) -> Result<(), StorageError>;
    /// Where the session lives on disk, if anywhere.
    fn path_for(&self, session: &str) -> Option<PathBuf>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    version: u32,
    session: String,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

fn upsert(messages: &mut Vec<Message>, message: &Message) {
    let key = message.key();
    match messages.iter_mut().find(|m| m.key() == key) {
        Some(existing) => *existing = message.clone(),
        None => messages.push(message.clone()),
    }
}

/// JSON file per session under a base directory.
pub struct JsonMessageStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles within this process; the fs2 sidecar lock covers other processes.
    write_guard: tokio::sync::Mutex<()>,
}

impl JsonMessageStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self {
            dir,
            write_guard: tokio::sync::Mutex::new(()),
        })
    }

    fn file_for(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_filename(session)))
    }

    async fn read_session(&self, session: &str) -> Result<Vec<Message>, StorageError> {
        let path = self.file_for(session);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        if content.trim_matches('\0').trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: SessionFile = secure_json_parse(&content, MAX_SESSION_FILE_BYTES)
            .map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?;
        Ok(file.messages)
    }

    async fn write_session(&self, session: &str, messages: Vec<Message>) -> Result<(), StorageError> {
        let path = self.file_for(session);
        let doc = SessionFile {
            version: FILE_VERSION,
            session: session.to_string(),
            updated_at: Utc::now(),
            messages,
        };
        let content = serde_json::to_string_pretty(&doc)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_file_atomic(&target, &content))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
            .map_err(|source| StorageError::Io { path, source })
    }

    /// Take the exclusive lock on the session's `.lock` sidecar. Released on drop.
    async fn lock_session(&self, session: &str) -> Result<File, StorageError> {
        let path = lock_path_for(&self.file_for(session));
        let target = path.clone();
        tokio::task::spawn_blocking(move || lock_sidecar(&target))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
            .map_err(|source| StorageError::Io { path, source })
    }

    /// Apply `f` to the session's messages and write the result back.
    async fn modify<F>(&self, session: &str, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Vec<Message>) + Send,
    {
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock_session(session).await?;
        let mut messages = self.read_session(session).await?;
        f(&mut messages);
        self.write_session(session, messages).await
    }
}

#[async_trait]
impl MessageRepository for JsonMessageStore {
    async fn load(&self, session: &str) -> Result<Vec<Message>, StorageError> {
        self.read_session(session).await
    }

    async fn save(&self, session: &str, message: &Message) -> Result<(), StorageError> {
        self.modify(session, |messages| upsert(messages, message)).await
    }

    async fn delete_peer(&self, session: &str, peer: u32) -> Result<(), StorageError> {
        self.modify(session, |messages| messages.retain(|m| m.peer() != peer))
            .await
    }

    async fn clear(&self, session: &str) -> Result<(), StorageError> {
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock_session(session).await?;
        let path = self.file_for(session);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn path_for(&self, session: &str) -> Option<PathBuf> {
        Some(self.file_for(session))
    }
}

/// `<dir>/.<file>.lock`. The sidecar is never renamed over, so every process
/// contends on the same inode.
fn lock_path_for(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("session.json");
    dir.join(format!(".{}.lock", base))
}

fn lock_sidecar(lock_path: &Path) -> std::io::Result<File> {
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    lock_file.lock_exclusive()?;
    Ok(lock_file)
}

/// Atomic replace: write a unique temp file, fsync, rename over the
/// destination, then fsync the directory (best-effort). Callers hold the
/// sidecar lock.
fn write_file_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("session.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    sfs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

/// Repository for runs without persistence, and for tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sessions<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<Message>>) -> R) -> R {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageStore {
    async fn load(&self, session: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self.with_sessions(|s| s.get(session).cloned().unwrap_or_default()))
    }

    async fn save(&self, session: &str, message: &Message) -> Result<(), StorageError> {
        self.with_sessions(|s| upsert(s.entry(session.to_string()).or_default(), message));
        Ok(())
    }

    async fn delete_peer(&self, session: &str, peer: u32) -> Result<(), StorageError> {
        self.with_sessions(|s| {
            if let Some(messages) = s.get_mut(session) {
                messages.retain(|m| m.peer() != peer);
            }
        });
        Ok(())
    }

    async fn clear(&self, session: &str) -> Result<(), StorageError> {
        self.with_sessions(|s| s.remove(session));
        Ok(())
    }

    fn path_for(&self, _session: &str) -> Option<PathBuf> {
        None
    }
}

enum PersistCmd {
    Save(Box<Message>),
    DeletePeer(u32),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front of the background writer. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistCmd>,
    session: Arc<str>,
    queued_saves: Arc<AtomicUsize>,
    max_saves: usize,
}

impl PersistenceHandle {
    /// Start the writer task for `session`. The task ends when every handle is dropped.
    pub fn spawn(
        repo: Arc<dyn MessageRepository>,
        session: impl Into<String>,
        queue: usize,
    ) -> (Self, JoinHandle<()>) {
        let session: Arc<str> = Arc::from(session.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCmd>();
        let queued_saves = Arc::new(AtomicUsize::new(0));
        let task_session = Arc::clone(&session);
        let task_saves = Arc::clone(&queued_saves);
        let task = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let result = match cmd {
                    PersistCmd::Save(msg) => {
                        task_saves.fetch_sub(1, Ordering::AcqRel);
                        repo.save(&task_session, &msg).await
                    }
                    PersistCmd::DeletePeer(peer) => {
                        debug!("deleting stored conversation with {}", format_node_id(peer));
                        repo.delete_peer(&task_session, peer).await
                    }
                    PersistCmd::Clear => repo.clear(&task_session).await,
                    PersistCmd::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("persistence write failed: {}", e);
                }
            }
            debug!("persistence writer for '{}' stopped", task_session);
        });
        let handle = Self {
            tx,
            session,
            queued_saves,
            max_saves: queue.max(1),
        };
        (handle, task)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Queue an upsert. Dropped with a warning when the save backlog is full.
    pub fn save(&self, message: &Message) {
        let reserved = self
            .queued_saves
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_saves).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            warn!(
                "persistence queue full, dropping write for {}",
                format_node_id(message.peer())
            );
            return;
        }
        if !self.enqueue(PersistCmd::Save(Box::new(message.clone()))) {
            self.queued_saves.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Queue removal of a peer's stored messages. Never dropped while the writer runs.
    pub fn delete_peer(&self, peer: u32) {
        self.enqueue(PersistCmd::DeletePeer(peer));
    }

    pub fn clear(&self) {
        self.enqueue(PersistCmd::Clear);
    }

    /// Wait until everything queued before this call has been written.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.enqueue(PersistCmd::Flush(done_tx)) {
            return false;
        }
        done_rx.await.is_ok()
    }

    fn enqueue(&self, cmd: PersistCmd) -> bool {
        if self.tx.send(cmd).is_err() {
            debug!("persistence writer gone, dropping write");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::conversation_store::{Direction, MessageStatus};

    fn msg(local_id: u64, packet_id: u32, peer: u32, status: MessageStatus) -> Message {
        Message {
            local_id,
            packet_id,
            direction: Direction::Own,
            from: 1,
            to: peer,
            text: format!("m{}", local_id),
            timestamp: DateTime::from_timestamp(1_700_000_000 + local_id as i64, 0).unwrap(),
            status,
            error_reason: None,
        }
    }

    #[tokio::test]
    async fn json_store_upserts_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMessageStore::new(dir.path()).await.unwrap();
        store.save("radio", &msg(1, 10, 2, MessageStatus::Pending)).await.unwrap();
        store.save("radio", &msg(2, 11, 2, MessageStatus::Pending)).await.unwrap();
        store.save("radio", &msg(1, 10, 2, MessageStatus::Acked)).await.unwrap();
        let loaded = store.load("radio").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].status, MessageStatus::Acked);
        assert!(store.load("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_store_delete_peer_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMessageStore::new(dir.path()).await.unwrap();
        store.save("s", &msg(1, 10, 2, MessageStatus::Acked)).await.unwrap();
        store.save("s", &msg(2, 11, 3, MessageStatus::Acked)).await.unwrap();
        store.delete_peer("s", 2).await.unwrap();
        let left = store.load("s").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].to, 3);
        store.clear("s").await.unwrap();
        assert!(store.load("s").await.unwrap().is_empty());
        assert!(!store.path_for("s").unwrap().exists());
    }

    #[tokio::test]
    async fn session_names_are_filesystem_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMessageStore::new(dir.path()).await.unwrap();
        let path = store.path_for("http://10.0.0.1:80/").unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMessageStore::new(dir.path()).await.unwrap();
        std::fs::write(store.path_for("bad").unwrap(), "{not json").unwrap();
        assert!(matches!(store.load("bad").await, Err(StorageError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn handle_writes_in_background() {
        let repo = Arc::new(MemoryMessageStore::new());
        let (handle, _task) = PersistenceHandle::spawn(repo.clone(), "s", 8);
        handle.save(&msg(1, 10, 2, MessageStatus::Pending));
        handle.save(&msg(1, 10, 2, MessageStatus::Error));
        handle.save(&msg(2, 11, 5, MessageStatus::Acked));
        handle.delete_peer(5);
        assert!(handle.flush().await);
        let stored = repo.load("s").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, MessageStatus::Error);
    }

    #[tokio::test]
    async fn full_queue_still_applies_deletes() {
        let repo = Arc::new(MemoryMessageStore::new());
        let (handle, _task) = PersistenceHandle::spawn(repo.clone(), "s", 1);
        handle.save(&msg(1, 10, 2, MessageStatus::Acked));
        handle.save(&msg(2, 11, 3, MessageStatus::Acked));
        handle.delete_peer(2);
        assert!(handle.flush().await);
        assert!(repo.load("s").await.unwrap().is_empty());

        handle.save(&msg(3, 12, 4, MessageStatus::Acked));
        handle.clear();
        assert!(handle.flush().await);
        assert!(repo.load("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_cap_frees_up_after_drain() {
        let repo = Arc::new(MemoryMessageStore::new());
        let (handle, _task) = PersistenceHandle::spawn(repo.clone(), "s", 1);
        handle.save(&msg(1, 10, 2, MessageStatus::Acked));
        assert!(handle.flush().await);
        handle.save(&msg(2, 11, 2, MessageStatus::Acked));
        assert!(handle.flush().await);
        assert_eq!(repo.load("s").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sidecar_lock_serialises_independent_stores() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(JsonMessageStore::new(dir.path()).await.unwrap());
        let b = Arc::new(JsonMessageStore::new(dir.path()).await.unwrap());
        let mut tasks = Vec::new();
        for i in 0..10u64 {
            let store = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            tasks.push(tokio::spawn(async move {
                store
                    .save("shared", &msg(i + 1, 100 + i as u32, 2, MessageStatus::Acked))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(a.load("shared").await.unwrap().len(), 10);
        let data = a.path_for("shared").unwrap();
        assert!(lock_path_for(&data).exists());
        assert_eq!(lock_path_for(&data).parent(), data.parent());
    }
}
