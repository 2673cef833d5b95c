//! # Async Storage Handle
//!
//! [`ForumDb`] wires the schema, the batch writer and the reader pool together
//! and exposes them to async code.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` type uses `RefCell` internally, making it `!Sync`.
//! We can't share a connection across tasks, even with `Arc`.
//!
//! Our solution: **dedicated threads with async channels**
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Async Tasks                                   │
//! └────────────────────────────────┬────────────────────────────────────────┘
//!                    ┌─────────────┴─────────────┐
//!                    │ mpsc                      │ mpsc (shared)
//!                    ▼                           ▼
//!            ┌───────────────┐         ┌─────────────────────┐
//!            │  BatchWriter  │         │     Reader Pool     │
//!            │  (1 thread)   │         │   (N threads)       │
//!            │               │         │                     │
//!            │  read-write   │         │  ┌───┐ ┌───┐ ┌───┐ │
//!            │  connection   │         │  │ R │ │ R │ │ R │ │
//!            │               │         │  └───┘ └───┘ └───┘ │
//!            │               │         │  read-only conns    │
//!            └───────┬───────┘         └──────────┬──────────┘
//!                    │                            │
//!                    └─────────────┬──────────────┘
//!                                  ▼
//!                          ┌─────────────┐
//!                          │   SQLite    │
//!                          │   (WAL)     │
//!                          └─────────────┘
//! ```
//!
//! Each request carries a `oneshot` sender for its reply. With a configured
//! request timeout, a caller that gives up drops its receiver, and the worker
//! skips the request if it hasn't started it yet.
//!
//! ## Rust Concepts
//!
//! - **tokio::sync::mpsc**: Async channel (can await send/recv)
//! - **tokio::sync::oneshot**: Single-use channel for request/response
//! - **!Sync types**: Types that can't be shared between threads via &T

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;

use crate::config::ForumConfig;
use crate::error::{Error, Result};
use crate::reader::{self, ReadRequest};
use crate::schema::{Database, BUSY_TIMEOUT};
use crate::types::{
    Forum, Post, PostListParams, ServiceStatus, Thread, ThreadListParams, ThreadRef, User,
    UserListParams,
};
use crate::writer::{await_response, spawn_batch_writer, BatchWriterHandle};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

// =============================================================================
// ForumDb
// =============================================================================

/// The async handle to a ForumDB database.
///
/// # Thread Safety
///
/// `ForumDb` is `Clone`, `Send`, and `Sync`. All clones share the same writer
/// thread and reader pool.
///
/// # Example
///
/// ```rust,no_run
/// use forumdb::{ForumConfig, ForumDb, ThreadRef};
///
/// # async fn run() -> forumdb::Result<()> {
/// let db = ForumDb::open(ForumConfig::new("forum.db")).await?;
/// let thread = db.find_thread(ThreadRef::parse("42")).await?;
/// println!("{thread:?}");
/// db.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ForumDb {
    /// Batch writer handle for every mutation.
    writer: BatchWriterHandle,

    /// Channel to send read requests.
    read_tx: mpsc::Sender<ReadRequest>,

    /// Handles to the reader threads (for shutdown).
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,

    /// Handle to the writer thread (for shutdown).
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,

    /// Number of reader threads in the pool.
    reader_count: usize,

    request_timeout: Option<Duration>,
}

impl ForumDb {
    /// Opens a database file with default settings.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(ForumConfig::new(path.as_ref())).await
    }

    /// Opens or creates the database and starts the worker threads.
    pub async fn open(config: ForumConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        let (writer, writer_handle) = spawn_batch_writer(db.into_connection(), config.writer.clone())?;
        let writer = writer.with_request_timeout(config.request_timeout);

        let reader_count = config
            .reader_threads
            .unwrap_or_else(|| {
                available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(MIN_READ_THREADS)
            })
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        // Threads compete to receive from the shared channel.
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let read_rx = Arc::new(std::sync::Mutex::new(read_rx));

        let mut reader_handles = Vec::with_capacity(reader_count);
        for i in 0..reader_count {
            let conn = Connection::open_with_flags(
                &config.db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            let rx = Arc::clone(&read_rx);

            let handle = thread::Builder::new()
                .name(format!("forumdb-reader-{i}"))
                .spawn(move || reader::run_reader_pooled(conn, rx))
                .map_err(|e| Error::Worker(format!("failed to spawn reader thread: {e}")))?;
            reader_handles.push(handle);
        }

        info!(
            path = %config.db_path.display(),
            readers = reader_count,
            batch_timeout_ms = config.writer.batch_timeout.as_millis() as u64,
            "opened forum database"
        );

        Ok(Self {
            writer,
            read_tx,
            reader_handles: Arc::new(Mutex::new(reader_handles)),
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
            reader_count,
            request_timeout: config.request_timeout,
        })
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    /// The group-commit writer. Every mutation goes through it.
    pub fn writer(&self) -> &BatchWriterHandle {
        &self.writer
    }

    async fn read<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.read_tx
            .send(request(response_tx))
            .await
            .map_err(|_| Error::Shutdown("reader pool"))?;

        await_response(response_rx, self.request_timeout, "reader pool").await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn find_user(&self, nickname: impl Into<String>) -> Result<Option<User>> {
        let nickname = nickname.into();
        self.read(|response| ReadRequest::FindUser { nickname, response })
            .await
    }

    pub async fn find_user_by_email(&self, email: impl Into<String>) -> Result<Option<User>> {
        let email = email.into();
        self.read(|response| ReadRequest::FindUserByEmail { email, response })
            .await
    }

    pub async fn find_forum(&self, slug: impl Into<String>) -> Result<Option<Forum>> {
        let slug = slug.into();
        self.read(|response| ReadRequest::FindForum { slug, response })
            .await
    }

    /// Resolves a thread reference (id first, then slug).
    pub async fn find_thread(&self, reference: ThreadRef) -> Result<Option<Thread>> {
        self.read(|response| ReadRequest::FindThread {
            reference,
            response,
        })
        .await
    }

    pub async fn find_post(&self, id: i64) -> Result<Option<Post>> {
        self.read(|response| ReadRequest::FindPost { id, response })
            .await
    }

    /// Threads of a forum; `ForumNotFound` if the forum is unknown.
    pub async fn list_threads(
        &self,
        forum: impl Into<String>,
        params: ThreadListParams,
    ) -> Result<Vec<Thread>> {
        let forum = forum.into();
        self.read(|response| ReadRequest::ListThreads {
            forum,
            params,
            response,
        })
        .await
    }

    /// Participants of a forum; `ForumNotFound` if the forum is unknown.
    pub async fn list_forum_users(
        &self,
        forum: impl Into<String>,
        params: UserListParams,
    ) -> Result<Vec<User>> {
        let forum = forum.into();
        self.read(|response| ReadRequest::ListUsers {
            forum,
            params,
            response,
        })
        .await
    }

    /// Posts of a thread; `ThreadNotFound` if the reference doesn't resolve.
    pub async fn list_posts(&self, thread: ThreadRef, params: PostListParams) -> Result<Vec<Post>> {
        self.read(|response| ReadRequest::ListPosts {
            thread,
            params,
            response,
        })
        .await
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        self.read(|response| ReadRequest::Status { response }).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Shuts down the worker threads.
    ///
    /// 1. Sends a shutdown signal to every reader thread and joins them
    /// 2. Asks the writer to flush its pending batch, then joins it
    ///
    /// After shutdown, operations on any clone fail with `Error::Shutdown`.
    pub async fn shutdown(self) {
        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }

        let handles = std::mem::take(&mut *self.reader_handles.lock().await);
        for handle in handles {
            let _ = handle.join();
        }

        self.writer.shutdown().await;
        if let Some(handle) = self.writer_handle.lock().await.take() {
            let _ = handle.join();
        }

        info!("forum database shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewForum, NewThread};

    async fn test_db() -> (ForumDb, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ForumConfig::new(temp_dir.path().join("test.db")).reader_threads(2);
        let db = ForumDb::open(config).await.unwrap();
        (db, temp_dir)
    }

    fn user(nickname: &str) -> User {
        User {
            nickname: nickname.to_string(),
            fullname: String::new(),
            about: String::new(),
            email: format!("{nickname}@example.com"),
        }
    }

    #[tokio::test]
    async fn test_open_and_shutdown() {
        let (db, _temp_dir) = test_db().await;
        assert_eq!(db.reader_count(), 2);
        assert_eq!(db.status().await.unwrap(), ServiceStatus::default());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_path_uses_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("defaults.db");
        let db = ForumDb::open_path(&path).await.unwrap();

        assert!((1..=16).contains(&db.reader_count()));
        db.writer().create_user(user("alice")).await.unwrap();
        assert_eq!(db.status().await.unwrap().user, 1);
        db.shutdown().await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_reader_sees_committed_writes() {
        let (db, _temp_dir) = test_db().await;

        db.writer().create_user(user("alice")).await.unwrap();
        db.writer()
            .create_forum(NewForum {
                slug: "sailing".to_string(),
                title: "Sailing".to_string(),
                user: "alice".to_string(),
            })
            .await
            .unwrap();
        let thread = db
            .writer()
            .create_thread(
                "sailing".to_string(),
                NewThread {
                    slug: Some("knots".to_string()),
                    title: "Knots".to_string(),
                    author: "alice".to_string(),
                    message: "?".to_string(),
                    created: None,
                },
            )
            .await
            .unwrap();

        let found = db.find_thread(ThreadRef::parse("knots")).await.unwrap().unwrap();
        assert_eq!(found, thread);

        let forum = db.find_forum("SAILING").await.unwrap().unwrap();
        assert_eq!(forum.threads, 1);

        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_clone_and_share() {
        let (db, _temp_dir) = test_db().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.writer().create_user(user(&format!("user{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(db.status().await.unwrap().user, 8);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (db, _temp_dir) = test_db().await;
        let clone = db.clone();
        db.shutdown().await;

        assert!(matches!(
            clone.status().await,
            Err(Error::Shutdown("reader pool"))
        ));
    }
}
