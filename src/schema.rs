//! # SQLite Schema for ForumDB
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  users            forums              threads           votes           │
//! │  ┌──────────┐     ┌──────────────┐    ┌────────────┐    ┌────────────┐  │
//! │  │ nickname │◄────│ owner        │    │ id (PK)    │◄───│ thread     │  │
//! │  │ email    │     │ slug (UQ)    │◄───│ forum      │    │ nickname   │  │
//! │  └──────────┘     │ posts        │    │ slug (UQ)  │    │ voice ±1   │  │
//! │                   │ threads      │    │ votes      │    └────────────┘  │
//! │                   └──────────────┘    └────────────┘                    │
//! │                                             ▲                           │
//! │  posts                                      │        path_counter       │
//! │  ┌─────────────────────────────────────┐    │        ┌────────────┐     │
//! │  │ id (PK) parent thread ──────────────┼────┘        │ value      │     │
//! │  │ path  root  created_us  is_edited   │             └────────────┘     │
//! │  └─────────────────────────────────────┘                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why store `root` next to `path`?
//!
//! Parent-tree listings page over root posts and then pull each root's whole
//! subtree. `root` is the first path segment, and indexing `(thread, root, path)`
//! turns "every post under these roots, in path order" into a range scan.
//!
//! ### Why microsecond integers for timestamps?
//!
//! Integer columns sort numerically and compare exactly. Text timestamps only
//! sort correctly when every row uses the same fractional precision.
//!
//! ### Case-insensitive keys
//!
//! Nicknames, forum slugs and thread slugs are unique regardless of case
//! (`COLLATE NOCASE`). Stored values keep the casing they were created with.

use std::time::Duration;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// How long a connection waits on another process's write lock.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// Users known to this store. Only existence and display fields matter here.
const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    nickname TEXT NOT NULL UNIQUE COLLATE NOCASE,
    fullname TEXT NOT NULL DEFAULT '',
    about    TEXT NOT NULL DEFAULT '',
    email    TEXT NOT NULL UNIQUE COLLATE NOCASE
)
"#;

/// Forums with denormalized counters.
///
/// `posts` and `threads` are only changed inside the write transaction that
/// creates the posts or the thread, so readers never see a count that
/// disagrees with committed rows.
const CREATE_FORUMS: &str = r#"
CREATE TABLE IF NOT EXISTS forums (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    slug    TEXT NOT NULL UNIQUE COLLATE NOCASE,
    title   TEXT NOT NULL,
    owner   TEXT NOT NULL,
    posts   INTEGER NOT NULL DEFAULT 0,
    threads INTEGER NOT NULL DEFAULT 0
)
"#;

/// Threads. `slug` is optional; SQLite allows many NULLs under UNIQUE.
const CREATE_THREADS: &str = r#"
CREATE TABLE IF NOT EXISTS threads (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    slug       TEXT UNIQUE COLLATE NOCASE,
    forum      TEXT NOT NULL,
    author     TEXT NOT NULL,
    title      TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_us INTEGER NOT NULL,
    votes      INTEGER NOT NULL DEFAULT 0
)
"#;

/// `forum` holds the canonical slug, so lookups bind the stored casing.
const CREATE_THREADS_FORUM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS threads_forum_created
ON threads(forum, created_us, id)
"#;

/// Posts with their materialized path.
///
/// # Invariants
///
/// - `path` of a reply is its parent's `path` plus one segment
/// - `root` is the first segment of `path`
/// - `id` strictly increases (AUTOINCREMENT never reuses committed ids)
const CREATE_POSTS: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    parent     INTEGER NOT NULL DEFAULT 0,
    thread     INTEGER NOT NULL REFERENCES threads(id),
    forum      TEXT NOT NULL,
    author     TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_us INTEGER NOT NULL,
    is_edited  INTEGER NOT NULL DEFAULT 0,
    path       TEXT NOT NULL,
    root       TEXT NOT NULL
)
"#;

const CREATE_POSTS_THREAD_ID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS posts_thread_id
ON posts(thread, id)
"#;

const CREATE_POSTS_THREAD_CREATED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS posts_thread_created
ON posts(thread, created_us, id)
"#;

const CREATE_POSTS_THREAD_PATH_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS posts_thread_path
ON posts(thread, path)
"#;

const CREATE_POSTS_ROOTS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS posts_thread_root
ON posts(thread, root, path)
"#;

/// Root posts of a thread in path order, for parent-tree paging.
const CREATE_POSTS_PARENT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS posts_thread_parent
ON posts(thread, parent, root)
"#;

/// The vote ledger.
///
/// The primary key on `(nickname, thread)` is what keeps one row per voter;
/// the CHECK keeps bad voices out even if a caller skips validation.
const CREATE_VOTES: &str = r#"
CREATE TABLE IF NOT EXISTS votes (
    nickname TEXT NOT NULL COLLATE NOCASE,
    thread   INTEGER NOT NULL REFERENCES threads(id),
    voice    INTEGER NOT NULL CHECK (voice IN (-1, 1)),
    PRIMARY KEY (nickname, thread)
)
"#;

/// Users who wrote a thread or post in a forum.
const CREATE_FORUM_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS forum_users (
    forum    TEXT NOT NULL COLLATE NOCASE,
    nickname TEXT NOT NULL COLLATE NOCASE,
    PRIMARY KEY (forum, nickname)
)
"#;

/// Single-row counter backing the path allocator.
const CREATE_PATH_COUNTER: &str = r#"
CREATE TABLE IF NOT EXISTS path_counter (
    id    INTEGER PRIMARY KEY CHECK (id = 0),
    value INTEGER NOT NULL
)
"#;

const SEED_PATH_COUNTER: &str = "INSERT OR IGNORE INTO path_counter (id, value) VALUES (0, 0)";

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS forumdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the ForumDB schema applied.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use forumdb::Database;
    ///
    /// let db = Database::open("forum.db")?;
    /// # Ok::<(), forumdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database, for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers keep a consistent snapshot while the writer commits.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_USERS)?;
        self.conn.execute_batch(CREATE_FORUMS)?;
        self.conn.execute_batch(CREATE_THREADS)?;
        self.conn.execute_batch(CREATE_THREADS_FORUM_INDEX)?;
        self.conn.execute_batch(CREATE_POSTS)?;
        self.conn.execute_batch(CREATE_POSTS_THREAD_ID_INDEX)?;
        self.conn.execute_batch(CREATE_POSTS_THREAD_CREATED_INDEX)?;
        self.conn.execute_batch(CREATE_POSTS_THREAD_PATH_INDEX)?;
        self.conn.execute_batch(CREATE_POSTS_ROOTS_INDEX)?;
        self.conn.execute_batch(CREATE_POSTS_PARENT_INDEX)?;
        self.conn.execute_batch(CREATE_VOTES)?;
        self.conn.execute_batch(CREATE_FORUM_USERS)?;
        self.conn.execute_batch(CREATE_PATH_COUNTER)?;
        self.conn.execute_batch(SEED_PATH_COUNTER)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM forumdb_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO forumdb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this ForumDB version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and hands the initialized connection to a writer.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i32 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        // metadata, users, forums, threads, posts, votes, forum_users, path_counter
        assert_eq!(table_count(&db.conn), 8);
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().expect("should create db");

        let indexes: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'")
                .expect("should prepare");

            stmt.query_map([], |row| row.get(0))
                .expect("should query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("should collect")
        };

        for name in [
            "posts_thread_id",
            "posts_thread_path",
            "posts_thread_root",
            "threads_forum_created",
        ] {
            assert!(indexes.contains(&name.to_string()), "missing index {name}");
        }
    }

    #[test]
    fn test_path_counter_seeded_once() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute("UPDATE path_counter SET value = 17 WHERE id = 0", [])
                .unwrap();
        }

        // Reopening must not reset the counter.
        let db = Database::open(&path).expect("second open should work");
        let value: i64 = db
            .conn
            .query_row("SELECT value FROM path_counter", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, 17);
        assert_eq!(table_count(&db.conn), 8);
    }

    #[test]
    fn test_vote_voice_checked() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO threads (forum, author, title, message, created_us) VALUES ('f', 'a', 't', 'm', 0)",
                [],
            )
            .unwrap();

        let bad = db.conn.execute(
            "INSERT INTO votes (nickname, thread, voice) VALUES ('a', 1, 2)",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn
                .execute(
                    "UPDATE forumdb_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
