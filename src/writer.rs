//! # Batch Writer with Group Commit
//!
//! Every mutation in ForumDB goes through one writer thread that owns the only
//! read-write connection. Write requests are collected over a short time window
//! and executed in a single SQLite transaction, with a SAVEPOINT around each
//! request.
//!
//! ## Why Group Commit?
//!
//! SQLite's write throughput is bounded by commits: each one waits for the WAL
//! to reach disk. Batching amortizes that cost:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ vote  → BEGIN → COMMIT   │     │ BEGIN IMMEDIATE          │
//! │ posts → BEGIN → COMMIT   │     │   SAVEPOINT cmd_0 (vote) │
//! │ vote  → BEGIN → COMMIT   │     │   SAVEPOINT cmd_1 (posts)│
//! │ ...                      │     │   SAVEPOINT cmd_2 (vote) │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## SAVEPOINT Semantics
//!
//! - If a request succeeds: its SAVEPOINT is released (changes kept)
//! - If a request fails: its SAVEPOINT is rolled back (changes discarded)
//! - Other requests in the batch are unaffected
//!
//! A post batch with an unknown author in its last element therefore leaves
//! no posts, no allocated path segments and no counter change behind, while a
//! vote that shared its group commit still lands.
//!
//! ## Shared Counters
//!
//! The path counter and the vote tallies are only changed here, under
//! `BEGIN IMMEDIATE`. That takes SQLite's write lock before the first read, so
//! the read-modify-write in a vote can't interleave with another writer, even
//! one in a different process.
//!
//! ## Abandoned Requests
//!
//! A caller that times out or is dropped closes its response channel. The
//! writer checks for that before starting a request and skips it.
//!
//! ## Invariants
//!
//! - Responses are sent only after COMMIT returns
//! - Requests are executed in arrival order within a batch
//! - A failed COMMIT fails every request of the batch

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage;
use crate::types::{
    Forum, NewForum, NewPost, NewThread, Post, Thread, ThreadRef, ThreadUpdate, User, Voice,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Requests are collected for up to this duration before being executed.
/// Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 2;

/// Maximum requests per batch.
///
/// If this many requests accumulate before the timeout, execute immediately.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 256;

/// Size of the request channel.
const COMMAND_CHANNEL_SIZE: usize = 4096;

/// Configuration for the batch writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Maximum time to wait for more requests before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum requests per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// One mutation, without its response channel.
#[derive(Debug, Clone)]
pub enum WriteCommand {
    CreateUser(User),
    CreateForum(NewForum),
    CreateThread {
        forum: String,
        thread: NewThread,
    },
    UpdateThread {
        thread: ThreadRef,
        update: ThreadUpdate,
    },
    CreatePosts {
        thread: ThreadRef,
        posts: Vec<NewPost>,
    },
    UpdatePost {
        id: i64,
        message: String,
    },
    CastVote {
        thread: ThreadRef,
        nickname: String,
        voice: Voice,
    },
}

/// What a successful [`WriteCommand`] produced.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    User(User),
    Forum(Forum),
    Thread(Thread),
    Posts(Vec<Post>),
    Post(Post),
}

/// A write request sent to the batch writer.
pub enum WriteRequest {
    Write {
        command: WriteCommand,
        response: oneshot::Sender<Result<WriteOutcome>>,
    },

    /// Flush the pending batch and stop.
    Shutdown,
}

/// Internal representation of a queued request.
struct PendingWrite {
    command: WriteCommand,
    response: oneshot::Sender<Result<WriteOutcome>>,
}

/// Runs one command against the open transaction.
fn apply(conn: &Connection, command: &WriteCommand) -> Result<WriteOutcome> {
    match command {
        WriteCommand::CreateUser(user) => storage::insert_user(conn, user).map(WriteOutcome::User),
        WriteCommand::CreateForum(forum) => {
            storage::insert_forum(conn, forum).map(WriteOutcome::Forum)
        }
        WriteCommand::CreateThread { forum, thread } => {
            storage::insert_thread(conn, forum, thread).map(WriteOutcome::Thread)
        }
        WriteCommand::UpdateThread { thread, update } => {
            storage::update_thread(conn, thread, update).map(WriteOutcome::Thread)
        }
        WriteCommand::CreatePosts { thread, posts } => {
            storage::insert_posts(conn, thread, posts).map(WriteOutcome::Posts)
        }
        WriteCommand::UpdatePost { id, message } => {
            storage::update_post(conn, *id, message).map(WriteOutcome::Post)
        }
        WriteCommand::CastVote {
            thread,
            nickname,
            voice,
        } => storage::cast_vote(conn, thread, nickname, *voice).map(WriteOutcome::Thread),
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The batch writer that handles group commit.
///
/// This runs on a dedicated thread. Use [`BatchWriterHandle`] to interact with
/// it from async code.
pub struct BatchWriter {
    /// SQLite connection (owned, single writer).
    conn: Connection,
}

impl BatchWriter {
    /// Wraps a connection whose schema is already initialized.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Executes a batch of requests.
    ///
    /// 1. Drop requests whose caller has gone away
    /// 2. Begin the outer transaction
    /// 3. Run each request in its own SAVEPOINT
    /// 4. Commit
    /// 5. Send responses
    fn execute_batch(&mut self, items: Vec<PendingWrite>) {
        let (commands, responses): (Vec<_>, Vec<_>) = items
            .into_iter()
            .filter(|item| {
                if item.response.is_closed() {
                    debug!(command = ?item.command, "skipping write: caller went away");
                    false
                } else {
                    true
                }
            })
            .map(|item| (item.command, item.response))
            .unzip();

        if commands.is_empty() {
            return;
        }

        let started = Instant::now();
        match self.execute_batch_inner(&commands) {
            Ok(results) => {
                debug!(
                    size = commands.len(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "committed write batch"
                );
                for (sender, result) in responses.into_iter().zip(results) {
                    let _ = sender.send(result);
                }
            }
            Err(e) => {
                warn!(size = commands.len(), error = %e, "write batch failed");
                let err_msg = format!("batch commit failed: {e}");
                for sender in responses {
                    let _ = sender.send(Err(Error::Worker(err_msg.clone())));
                }
            }
        }
    }

    /// Runs the whole batch inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The outer `Result` is the transaction itself; the inner ones are the
    /// per-request outcomes.
    fn execute_batch_inner(&mut self, commands: &[WriteCommand]) -> Result<Vec<Result<WriteOutcome>>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut results = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            match self.execute_command_in_savepoint(command, index) {
                Ok(result) => results.push(result),
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        }

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    /// Executes a single request within a SAVEPOINT.
    fn execute_command_in_savepoint(
        &mut self,
        command: &WriteCommand,
        index: usize,
    ) -> Result<Result<WriteOutcome>> {
        let sp_name = format!("cmd_{index}");
        self.conn.execute_batch(&format!("SAVEPOINT {sp_name}"))?;

        match apply(&self.conn, command) {
            Ok(outcome) => {
                self.conn.execute_batch(&format!("RELEASE {sp_name}"))?;
                Ok(Ok(outcome))
            }
            Err(e) => {
                debug!(error = %e, "write rolled back");
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {sp_name}; RELEASE {sp_name}"))?;
                Ok(Err(e))
            }
        }
    }
}

// =============================================================================
// Batch Writer Handle (Async Interface)
// =============================================================================

/// Waits for a worker's reply, giving up after `deadline`.
///
/// Giving up drops the receiver, which is how the worker learns it can skip
/// the request.
pub(crate) async fn await_response<T>(
    response_rx: oneshot::Receiver<Result<T>>,
    deadline: Option<Duration>,
    component: &'static str,
) -> Result<T> {
    let received = match deadline {
        Some(limit) => timeout(limit, response_rx)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => response_rx.await,
    };
    received.map_err(|_| Error::Shutdown(component))?
}

fn unexpected(outcome: WriteOutcome) -> Error {
    Error::Worker(format!("writer answered with the wrong outcome: {outcome:?}"))
}

/// Async handle to the batch writer.
///
/// Cheap to clone; every clone feeds the same writer thread.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
    request_timeout: Option<Duration>,
}

impl BatchWriterHandle {
    /// Applies a per-request deadline to every call made through this handle.
    pub fn with_request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Queues a command and waits for its outcome.
    pub async fn submit(&self, command: WriteCommand) -> Result<WriteOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(WriteRequest::Write {
                command,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Shutdown("writer"))?;

        await_response(response_rx, self.request_timeout, "writer").await
    }

    pub async fn create_user(&self, user: User) -> Result<User> {
        match self.submit(WriteCommand::CreateUser(user)).await? {
            WriteOutcome::User(user) => Ok(user),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_forum(&self, forum: NewForum) -> Result<Forum> {
        match self.submit(WriteCommand::CreateForum(forum)).await? {
            WriteOutcome::Forum(forum) => Ok(forum),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_thread(&self, forum: String, thread: NewThread) -> Result<Thread> {
        match self
            .submit(WriteCommand::CreateThread { forum, thread })
            .await?
        {
            WriteOutcome::Thread(thread) => Ok(thread),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_thread(&self, thread: ThreadRef, update: ThreadUpdate) -> Result<Thread> {
        match self
            .submit(WriteCommand::UpdateThread { thread, update })
            .await?
        {
            WriteOutcome::Thread(thread) => Ok(thread),
            other => Err(unexpected(other)),
        }
    }

    /// Inserts a post batch. All posts commit together or not at all.
    pub async fn create_posts(&self, thread: ThreadRef, posts: Vec<NewPost>) -> Result<Vec<Post>> {
        match self
            .submit(WriteCommand::CreatePosts { thread, posts })
            .await?
        {
            WriteOutcome::Posts(posts) => Ok(posts),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_post(&self, id: i64, message: String) -> Result<Post> {
        match self.submit(WriteCommand::UpdatePost { id, message }).await? {
            WriteOutcome::Post(post) => Ok(post),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cast_vote(&self, thread: ThreadRef, nickname: String, voice: Voice) -> Result<Thread> {
        match self
            .submit(WriteCommand::CastVote {
                thread,
                nickname,
                voice,
            })
            .await?
        {
            WriteOutcome::Thread(thread) => Ok(thread),
            other => Err(unexpected(other)),
        }
    }

    /// Asks the writer to flush its pending batch and exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the batch writer loop.
///
/// This function runs on a dedicated thread, collecting requests and
/// executing them in batches.
pub async fn run_batch_writer(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    let mut batch: Vec<PendingWrite> = Vec::new();
    let mut batch_start = Instant::now();

    loop {
        let wait_timeout = if batch.is_empty() {
            // Nothing pending: wait for the next request.
            Duration::from_secs(3600)
        } else {
            config.batch_timeout.saturating_sub(batch_start.elapsed())
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriteRequest::Write { command, response })) => {
                if batch.is_empty() {
                    batch_start = Instant::now();
                }

                batch.push(PendingWrite { command, response });

                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
            }
            Ok(Some(WriteRequest::Shutdown)) | Ok(None) => {
                if !batch.is_empty() {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
                break;
            }
            Err(_) => {
                if !batch.is_empty() {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
            }
        }
    }

    info!("batch writer stopped");
}

/// Spawns the batch writer on a dedicated thread.
///
/// Returns a handle for submitting requests and the thread's join handle.
pub fn spawn_batch_writer(
    conn: Connection,
    config: WriterConfig,
) -> Result<(BatchWriterHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| Error::Worker(format!("failed to create writer runtime: {e}")))?;
    let writer = BatchWriter::new(conn);

    let join = std::thread::Builder::new()
        .name("forumdb-batch-writer".to_string())
        .spawn(move || rt.block_on(run_batch_writer(writer, rx, config)))
        .map_err(|e| Error::Worker(format!("failed to spawn writer thread: {e}")))?;

    Ok((
        BatchWriterHandle {
            tx,
            request_timeout: None,
        },
        join,
    ))
}

// =============================================================================
// Tests
// =============================================================================
