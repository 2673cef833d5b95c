//! # Reader Pool
//!
//! This module provides the read operations for ForumDB: entity lookups,
//! forum listings, and the entry point into the post [query planner](crate::query).
//! Every function takes a plain `&Connection`, so the same code serves the
//! reader pool (read-only connections) and the writer (which resolves threads
//! inside its own transaction).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       │            │            │            │                   │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                          │                                       │
//! │              shared bounded request queue                        │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │
//!                            ▼
//!                    ┌─────────────┐
//!                    │   SQLite    │
//!                    │   (WAL)     │
//!                    └─────────────┘
//! ```
//!
//! The pool size is the connection bound: when all readers are busy, further
//! requests wait in the queue.
//!
//! ## Thread Resolution
//!
//! [`resolve_thread`] is the one place that turns a [`ThreadRef`] into a row.
//! A numeric reference is tried as an id first and only then as a slug.

use std::sync::{Arc, Mutex};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::PostPath;
use crate::query;
use crate::types::{
    from_storage_micros, sql_limit, to_storage_micros, Forum, Post, PostListParams,
    ServiceStatus, Thread, ThreadListParams, ThreadRef, User, UserListParams,
};

// =============================================================================
// Row Mapping
// =============================================================================

pub(crate) const USER_COLUMNS: &str = "nickname, fullname, about, email";
pub(crate) const FORUM_COLUMNS: &str = "slug, title, owner, posts, threads";
pub(crate) const THREAD_COLUMNS: &str =
    "id, slug, forum, author, title, message, created_us, votes";
pub(crate) const POST_COLUMNS: &str =
    "id, parent, thread, forum, author, message, created_us, is_edited, path";

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        nickname: row.get(0)?,
        fullname: row.get(1)?,
        about: row.get(2)?,
        email: row.get(3)?,
    })
}

pub(crate) fn forum_from_row(row: &Row<'_>) -> rusqlite::Result<Forum> {
    Ok(Forum {
        slug: row.get(0)?,
        title: row.get(1)?,
        user: row.get(2)?,
        posts: row.get(3)?,
        threads: row.get(4)?,
    })
}

pub(crate) fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        slug: row.get(1)?,
        forum: row.get(2)?,
        author: row.get(3)?,
        title: row.get(4)?,
        message: row.get(5)?,
        created: from_storage_micros(row.get(6)?),
        votes: row.get(7)?,
    })
}

pub(crate) fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    let encoded: String = row.get(8)?;
    let path = PostPath::parse(encoded)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(Post {
        id: row.get(0)?,
        parent: row.get(1)?,
        thread: row.get(2)?,
        forum: row.get(3)?,
        author: row.get(4)?,
        message: row.get(5)?,
        created: from_storage_micros(row.get(6)?),
        is_edited: row.get(7)?,
        path,
    })
}

// =============================================================================
// Request Types
// =============================================================================

/// Request type for read operations.
pub enum ReadRequest {
    FindUser {
        nickname: String,
        response: oneshot::Sender<Result<Option<User>>>,
    },
    FindUserByEmail {
        email: String,
        response: oneshot::Sender<Result<Option<User>>>,
    },
    FindForum {
        slug: String,
        response: oneshot::Sender<Result<Option<Forum>>>,
    },
    FindThread {
        reference: ThreadRef,
        response: oneshot::Sender<Result<Option<Thread>>>,
    },
    FindPost {
        id: i64,
        response: oneshot::Sender<Result<Option<Post>>>,
    },
    ListThreads {
        forum: String,
        params: ThreadListParams,
        response: oneshot::Sender<Result<Vec<Thread>>>,
    },
    ListUsers {
        forum: String,
        params: UserListParams,
        response: oneshot::Sender<Result<Vec<User>>>,
    },
    ListPosts {
        thread: ThreadRef,
        params: PostListParams,
        response: oneshot::Sender<Result<Vec<Post>>>,
    },
    Status {
        response: oneshot::Sender<Result<ServiceStatus>>,
    },
    /// Stop the reader thread that receives it.
    Shutdown,
}

// =============================================================================
// Lookups
// =============================================================================

/// Finds a user by nickname, case-insensitively.
pub fn find_user(conn: &Connection, nickname: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE nickname = ?1");
    Ok(conn.query_row(&sql, [nickname], user_from_row).optional()?)
}

pub fn find_user_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
    Ok(conn.query_row(&sql, [email], user_from_row).optional()?)
}

/// Finds a forum by slug, case-insensitively.
pub fn find_forum(conn: &Connection, slug: &str) -> Result<Option<Forum>> {
    let sql = format!("SELECT {FORUM_COLUMNS} FROM forums WHERE slug = ?1");
    Ok(conn.query_row(&sql, [slug], forum_from_row).optional()?)
}

pub fn find_thread_by_id(conn: &Connection, id: i64) -> Result<Option<Thread>> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], thread_from_row).optional()?)
}

pub fn find_thread_by_slug(conn: &Connection, slug: &str) -> Result<Option<Thread>> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE slug = ?1");
    Ok(conn.query_row(&sql, [slug], thread_from_row).optional()?)
}

/// Resolves a thread reference.
///
/// A numeric reference is looked up by id and falls back to a slug lookup
/// only if no thread has that id.
pub fn resolve_thread(conn: &Connection, reference: &ThreadRef) -> Result<Option<Thread>> {
    match reference {
        ThreadRef::Id(id) => match find_thread_by_id(conn, *id)? {
            Some(thread) => Ok(Some(thread)),
            None => find_thread_by_slug(conn, &id.to_string()),
        },
        ThreadRef::Slug(slug) => find_thread_by_slug(conn, slug),
    }
}

/// Like [`resolve_thread`], but a missing thread is an error.
pub fn require_thread(conn: &Connection, reference: &ThreadRef) -> Result<Thread> {
    resolve_thread(conn, reference)?.ok_or_else(|| Error::ThreadNotFound {
        reference: reference.to_string(),
    })
}

pub fn find_post(conn: &Connection, id: i64) -> Result<Option<Post>> {
    let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], post_from_row).optional()?)
}

// =============================================================================
// Listings
// =============================================================================

/// Lists a forum's threads by creation time.
///
/// The `since` timestamp is inclusive: creation times are not unique, and an
/// exclusive bound could skip threads that share the boundary instant.
pub fn list_threads(
    conn: &Connection,
    forum_slug: &str,
    params: &ThreadListParams,
) -> Result<Vec<Thread>> {
    let forum = find_forum(conn, forum_slug)?.ok_or_else(|| Error::ForumNotFound {
        slug: forum_slug.to_string(),
    })?;

    let (cmp, dir) = if params.desc { ("<=", "DESC") } else { (">=", "ASC") };
    let since = params.since.as_ref().map(to_storage_micros);
    let sql = format!(
        "SELECT {THREAD_COLUMNS} FROM threads
         WHERE forum = ?1 AND (?2 IS NULL OR created_us {cmp} ?2)
         ORDER BY created_us {dir}, id {dir}
         LIMIT ?3"
    );

    let mut stmt = conn.prepare(&sql)?;
    let threads = stmt
        .query_map(
            params![forum.slug, since, sql_limit(params.limit)],
            thread_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(threads)
}

/// Lists users who wrote a thread or post in a forum, ordered by nickname
/// (case-insensitive). The `since` nickname is exclusive.
pub fn list_forum_users(
    conn: &Connection,
    forum_slug: &str,
    params: &UserListParams,
) -> Result<Vec<User>> {
    let forum = find_forum(conn, forum_slug)?.ok_or_else(|| Error::ForumNotFound {
        slug: forum_slug.to_string(),
    })?;

    let (cmp, dir) = if params.desc { ("<", "DESC") } else { (">", "ASC") };
    let sql = format!(
        "SELECT u.nickname, u.fullname, u.about, u.email
         FROM forum_users fu
         JOIN users u ON u.nickname = fu.nickname
         WHERE fu.forum = ?1 AND (?2 IS NULL OR fu.nickname {cmp} ?2)
         ORDER BY fu.nickname {dir}
         LIMIT ?3"
    );

    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map(
            params![forum.slug, params.since, sql_limit(params.limit)],
            user_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

/// Resolves the thread and hands the listing to the query planner.
pub fn list_posts(
    conn: &Connection,
    reference: &ThreadRef,
    params: &PostListParams,
) -> Result<Vec<Post>> {
    let thread = require_thread(conn, reference)?;
    query::read_posts(conn, thread.id, params)
}

/// Row counts across the store.
pub fn status(conn: &Connection) -> Result<ServiceStatus> {
    let status = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM users),
            (SELECT COUNT(*) FROM forums),
            (SELECT COUNT(*) FROM threads),
            (SELECT COUNT(*) FROM posts)",
        [],
        |row| {
            Ok(ServiceStatus {
                user: row.get(0)?,
                forum: row.get(1)?,
                thread: row.get(2)?,
                post: row.get(3)?,
            })
        },
    )?;
    Ok(status)
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Runs `f` and sends its result, unless the caller already gave up.
fn reply<T>(response: oneshot::Sender<Result<T>>, f: impl FnOnce() -> Result<T>) {
    if response.is_closed() {
        debug!("skipping read: caller went away");
        return;
    }
    let _ = response.send(f());
}

/// Pooled reader loop.
///
/// Multiple threads share the channel via `Arc<Mutex>`. Each thread has its own
/// read-only SQLite connection, so they can execute queries in parallel.
///
/// # Load Balancing
///
/// Threads compete to acquire the lock and receive the next request. Whichever
/// thread is free picks up the next request.
pub fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.blocking_recv()
        };

        match request {
            Some(ReadRequest::FindUser { nickname, response }) => {
                reply(response, || find_user(&conn, &nickname));
            }
            Some(ReadRequest::FindUserByEmail { email, response }) => {
                reply(response, || find_user_by_email(&conn, &email));
            }
            Some(ReadRequest::FindForum { slug, response }) => {
                reply(response, || find_forum(&conn, &slug));
            }
            Some(ReadRequest::FindThread {
                reference,
                response,
            }) => {
                reply(response, || resolve_thread(&conn, &reference));
            }
            Some(ReadRequest::FindPost { id, response }) => {
                reply(response, || find_post(&conn, id));
            }
            Some(ReadRequest::ListThreads {
                forum,
                params,
                response,
            }) => {
                reply(response, || list_threads(&conn, &forum, &params));
            }
            Some(ReadRequest::ListUsers {
                forum,
                params,
                response,
            }) => {
                reply(response, || list_forum_users(&conn, &forum, &params));
            }
            Some(ReadRequest::ListPosts {
                thread,
                params,
                response,
            }) => {
                reply(response, || list_posts(&conn, &thread, &params));
            }
            Some(ReadRequest::Status { response }) => {
                reply(response, || status(&conn));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
