//! # Post Tree Store and Vote Ledger
//!
//! Synchronous write operations over a single connection. In production they
//! run on the writer thread, each inside its own `SAVEPOINT` of a
//! `BEGIN IMMEDIATE` transaction (see [`crate::writer`]); tests call them
//! directly on an in-memory database.
//!
//! ## All-or-Nothing Batches
//!
//! [`insert_posts`] validates and inserts post by post. Any failure returns an
//! error before the forum counter is touched, and the caller rolls back the
//! savepoint, so earlier posts of the same batch disappear with it:
//!
//! ```text
//! SAVEPOINT cmd_3
//!   allocate 41 → insert post (ok)
//!   allocate 42 → insert post (ok)
//!   author "ghost" unknown → Err(AuthorNotFound)
//! ROLLBACK TO cmd_3        ← posts and counter bumps are gone
//! ```
//!
//! ## Vote Upsert
//!
//! ```text
//! previous voice      new voice     tally delta
//! ──────────────      ─────────     ───────────
//! none                +1            +1
//! -1                  +1            +2
//! +1                  +1             0   (no-op)
//! ```
//!
//! The row write is one `INSERT ... ON CONFLICT (nickname, thread) DO UPDATE`,
//! and the delta is applied in the same transaction. The primary key is what
//! keeps a voter from being counted twice.
//!
//! ## Raw Errors
//!
//! Constraint violations surface as `Error::Sqlite`. Deciding that a duplicate
//! slug is a soft conflict is the orchestrator's job.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::path::{self, PostPath};
use crate::reader::{self, post_from_row, thread_from_row, POST_COLUMNS, THREAD_COLUMNS};
use crate::types::{
    now, to_storage_micros, Forum, NewForum, NewPost, NewThread, Post, Thread, ThreadRef,
    ThreadUpdate, User, Voice,
};

// =============================================================================
// Shared Helpers
// =============================================================================

/// Returns the stored casing of a nickname, if the user exists.
fn canonical_nickname(conn: &Connection, nickname: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT nickname FROM users WHERE nickname = ?1",
            [nickname],
            |row| row.get(0),
        )
        .optional()?)
}

/// Records that `nickname` wrote something in `forum`.
fn add_forum_user(conn: &Connection, forum: &str, nickname: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO forum_users (forum, nickname) VALUES (?1, ?2)",
        params![forum, nickname],
    )?;
    Ok(())
}

// =============================================================================
// Users and Forums
// =============================================================================

/// Inserts a user. A taken nickname or email is a raw unique violation.
pub fn insert_user(conn: &Connection, user: &User) -> Result<User> {
    conn.execute(
        "INSERT INTO users (nickname, fullname, about, email) VALUES (?1, ?2, ?3, ?4)",
        params![user.nickname, user.fullname, user.about, user.email],
    )?;
    Ok(user.clone())
}

/// Inserts a forum owned by an existing user.
///
/// # Errors
///
/// - `Error::UserNotFound` if the owner is unknown
/// - `Error::Sqlite` (unique violation) if the slug is taken
pub fn insert_forum(conn: &Connection, forum: &NewForum) -> Result<Forum> {
    let owner = canonical_nickname(conn, &forum.user)?.ok_or_else(|| Error::UserNotFound {
        nickname: forum.user.clone(),
    })?;

    conn.execute(
        "INSERT INTO forums (slug, title, owner) VALUES (?1, ?2, ?3)",
        params![forum.slug, forum.title, owner],
    )?;

    Ok(Forum {
        slug: forum.slug.clone(),
        title: forum.title.clone(),
        user: owner,
        posts: 0,
        threads: 0,
    })
}

// =============================================================================
// Threads
// =============================================================================

/// Inserts a thread and bumps the forum's thread counter.
///
/// The stored `forum` and `author` use the canonical casing of the forum slug
/// and the author's nickname.
pub fn insert_thread(conn: &Connection, forum_slug: &str, thread: &NewThread) -> Result<Thread> {
    let forum = reader::find_forum(conn, forum_slug)?.ok_or_else(|| Error::ForumNotFound {
        slug: forum_slug.to_string(),
    })?;
    let author = canonical_nickname(conn, &thread.author)?.ok_or_else(|| Error::UserNotFound {
        nickname: thread.author.clone(),
    })?;
    let created = thread.created.unwrap_or_else(now);

    let id: i64 = conn.query_row(
        "INSERT INTO threads (slug, forum, author, title, message, created_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING id",
        params![
            thread.slug.as_deref().filter(|slug| !slug.is_empty()),
            forum.slug,
            author,
            thread.title,
            thread.message,
            to_storage_micros(&created),
        ],
        |row| row.get(0),
    )?;

    conn.execute(
        "UPDATE forums SET threads = threads + 1 WHERE slug = ?1",
        [&forum.slug],
    )?;
    add_forum_user(conn, &forum.slug, &author)?;

    reader::find_thread_by_id(conn, id)?
        .ok_or_else(|| Error::Schema(format!("thread {id} vanished after insert")))
}

/// Applies a partial edit. Blank fields keep their stored value.
pub fn update_thread(
    conn: &Connection,
    reference: &ThreadRef,
    update: &ThreadUpdate,
) -> Result<Thread> {
    let thread = reader::require_thread(conn, reference)?;
    if update.is_empty() {
        return Ok(thread);
    }

    let sql = format!(
        "UPDATE threads SET
            title = CASE WHEN ?1 = '' THEN title ELSE ?1 END,
            message = CASE WHEN ?2 = '' THEN message ELSE ?2 END
         WHERE id = ?3
         RETURNING {THREAD_COLUMNS}"
    );
    Ok(conn.query_row(
        &sql,
        params![update.title, update.message, thread.id],
        thread_from_row,
    )?)
}

// =============================================================================
// Posts
// =============================================================================

/// Inserts a batch of posts into one thread.
///
/// Every post gets the same `created` timestamp and a freshly allocated path
/// segment, in list order. A post may reply to an earlier post of the same
/// batch.
///
/// # Errors
///
/// - `Error::ThreadNotFound` if the thread reference does not resolve
/// - `Error::AuthorNotFound` for an unknown author
/// - `Error::ParentConflict` if a parent is unknown or lives in another thread
/// - `Error::PathSpaceExhausted` if the counter outgrows the segment width
///
/// On error the caller must roll back: rows inserted before the failing post
/// are still in the open transaction.
pub fn insert_posts(conn: &Connection, reference: &ThreadRef, posts: &[NewPost]) -> Result<Vec<Post>> {
    let thread = reader::require_thread(conn, reference)?;
    let created = now();
    let created_us = to_storage_micros(&created);

    let mut authors: HashMap<&str, String> = HashMap::new();
    let mut inserted = Vec::with_capacity(posts.len());

    let insert_sql = format!(
        "INSERT INTO posts (parent, thread, forum, author, message, created_us, path, root)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         RETURNING {POST_COLUMNS}"
    );
    let mut insert = conn.prepare(&insert_sql)?;

    for post in posts {
        let author = match authors.get(post.author.as_str()) {
            Some(author) => author.clone(),
            None => {
                let author = canonical_nickname(conn, &post.author)?.ok_or_else(|| {
                    Error::AuthorNotFound {
                        nickname: post.author.clone(),
                    }
                })?;
                add_forum_user(conn, &thread.forum, &author)?;
                authors.insert(post.author.as_str(), author.clone());
                author
            }
        };

        let path = if post.parent == 0 {
            PostPath::root(path::allocate(conn)?)
        } else {
            let parent: Option<(i64, String)> = conn
                .query_row(
                    "SELECT thread, path FROM posts WHERE id = ?1",
                    [post.parent],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match parent {
                Some((parent_thread, parent_path)) if parent_thread == thread.id => {
                    PostPath::parse(parent_path)?.child(path::allocate(conn)?)
                }
                _ => return Err(Error::ParentConflict { parent: post.parent }),
            }
        };

        let row = insert.query_row(
            params![
                post.parent,
                thread.id,
                thread.forum,
                author,
                post.message,
                created_us,
                path.as_str(),
                path.root_key(),
            ],
            post_from_row,
        )?;
        inserted.push(row);
    }

    conn.execute(
        "UPDATE forums SET posts = posts + ?1 WHERE slug = ?2",
        params![inserted.len() as i64, thread.forum],
    )?;

    Ok(inserted)
}

/// Replaces a post's message.
///
/// An empty message, or one identical to the stored text, leaves the post
/// untouched. Otherwise `is_edited` becomes true and stays true.
pub fn update_post(conn: &Connection, id: i64, message: &str) -> Result<Post> {
    let post = reader::find_post(conn, id)?.ok_or(Error::PostNotFound { id })?;
    if message.is_empty() || message == post.message {
        return Ok(post);
    }

    let sql = format!(
        "UPDATE posts SET message = ?1, is_edited = 1 WHERE id = ?2 RETURNING {POST_COLUMNS}"
    );
    Ok(conn.query_row(&sql, params![message, id], post_from_row)?)
}

// =============================================================================
// Votes
// =============================================================================

/// Casts or overwrites one user's vote and returns the thread with its new tally.
pub fn cast_vote(
    conn: &Connection,
    reference: &ThreadRef,
    nickname: &str,
    voice: Voice,
) -> Result<Thread> {
    let thread = reader::require_thread(conn, reference)?;
    let voter = canonical_nickname(conn, nickname)?.ok_or_else(|| Error::UserNotFound {
        nickname: nickname.to_string(),
    })?;

    let previous: Option<i64> = conn
        .query_row(
            "SELECT voice FROM votes WHERE nickname = ?1 AND thread = ?2",
            params![voter, thread.id],
            |row| row.get(0),
        )
        .optional()?;

    let delta = voice.as_raw() - previous.unwrap_or(0);
    if delta == 0 {
        return Ok(thread);
    }

    conn.execute(
        "INSERT INTO votes (nickname, thread, voice) VALUES (?1, ?2, ?3)
         ON CONFLICT (nickname, thread) DO UPDATE SET voice = excluded.voice",
        params![voter, thread.id, voice.as_raw()],
    )?;

    let sql = format!(
        "UPDATE threads SET votes = votes + ?1 WHERE id = ?2 RETURNING {THREAD_COLUMNS}"
    );
    Ok(conn.query_row(&sql, params![delta, thread.id], thread_from_row)?)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn user(nickname: &str) -> User {
        User {
            nickname: nickname.to_string(),
            fullname: String::new(),
            about: String::new(),
            email: format!("{nickname}@example.com"),
        }
    }

    /// One user, one forum, one thread. Returns the thread id.
    fn seeded() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        insert_user(conn, &user("Alice")).unwrap();
        insert_user(conn, &user("bob")).unwrap();
        insert_forum(
            conn,
            &NewForum {
                slug: "sailing".to_string(),
                title: "Sailing".to_string(),
                user: "alice".to_string(),
            },
        )
        .unwrap();
        let thread = insert_thread(
            conn,
            "SAILING",
            &NewThread {
                slug: Some("knots".to_string()),
                title: "Knots".to_string(),
                author: "ALICE".to_string(),
                message: "Which knot?".to_string(),
                created: None,
            },
        )
        .unwrap();
        (db, thread.id)
    }

    fn post_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_insert_forum_unknown_owner() {
        let db = Database::open_in_memory().unwrap();
        let err = insert_forum(
            db.connection(),
            &NewForum {
                slug: "s".to_string(),
                title: "t".to_string(),
                user: "ghost".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::UserNotFound { .. }));
    }

    #[test]
    fn test_insert_forum_duplicate_is_unique_violation() {
        let (db, _) = seeded();
        let err = insert_forum(
            db.connection(),
            &NewForum {
                slug: "SAILING".to_string(),
                title: "again".to_string(),
                user: "bob".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_insert_thread_canonicalizes() {
        let (db, thread_id) = seeded();
        let conn = db.connection();

        let thread = reader::find_thread_by_id(conn, thread_id).unwrap().unwrap();
        assert_eq!(thread.forum, "sailing");
        assert_eq!(thread.author, "Alice");
        assert_eq!(thread.votes, 0);

        let forum = reader::find_forum(conn, "sailing").unwrap().unwrap();
        assert_eq!(forum.threads, 1);
    }

    #[test]
    fn test_blank_thread_slug_is_stored_as_null() {
        let (db, _) = seeded();
        let conn = db.connection();
        let blank = || NewThread {
            slug: Some(String::new()),
            title: "Untitled".to_string(),
            author: "bob".to_string(),
            message: "m".to_string(),
            created: None,
        };

        let first = insert_thread(conn, "sailing", &blank()).unwrap();
        let second = insert_thread(conn, "sailing", &blank()).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.slug, None);
        assert_eq!(second.slug, None);
    }

    #[test]
    fn test_update_thread_partial() {
        let (db, thread_id) = seeded();
        let conn = db.connection();
        let reference = ThreadRef::Id(thread_id);

        let updated = update_thread(
            conn,
            &reference,
            &ThreadUpdate {
                title: String::new(),
                message: "Bowline.".to_string(),
            },
        )
        .unwrap();
        assert_eq!(updated.title, "Knots");
        assert_eq!(updated.message, "Bowline.");

        let untouched = update_thread(conn, &reference, &ThreadUpdate::default()).unwrap();
        assert_eq!(untouched, updated);
    }

    #[test]
    fn test_insert_posts_paths_and_counter() {
        let (db, thread_id) = seeded();
        let conn = db.connection();
        let reference = ThreadRef::Slug("knots".to_string());

        let posts = insert_posts(
            conn,
            &reference,
            &[
                NewPost::root("alice", "root"),
                NewPost::reply(1, "bob", "reply"),
                NewPost::reply(2, "alice", "nested"),
            ],
        )
        .unwrap();

        assert_eq!(posts.len(), 3);
        assert!(posts.iter().all(|p| p.thread == thread_id));
        assert!(posts.iter().all(|p| p.created == posts[0].created));
        assert_eq!(posts[0].author, "Alice");
        assert_eq!(posts[1].path.segments(), vec![posts[0].path.leaf(), posts[1].path.leaf()]);
        assert!(posts[2].path.descends_from(&posts[1].path));
        assert!(posts[0].path.leaf() < posts[1].path.leaf());
        assert!(posts[1].path.leaf() < posts[2].path.leaf());

        let forum = reader::find_forum(conn, "sailing").unwrap().unwrap();
        assert_eq!(forum.posts, 3);
    }

    /// Storage functions leave rollback to the caller; inside a savepoint a
    /// late failure must erase the whole batch.
    #[test]
    fn test_insert_posts_failure_rolls_back_in_savepoint() {
        let (db, thread_id) = seeded();
        let conn = db.connection();

        conn.execute_batch("SAVEPOINT batch").unwrap();
        let err = insert_posts(
            conn,
            &ThreadRef::Id(thread_id),
            &[NewPost::root("alice", "ok"), NewPost::root("ghost", "nope")],
        )
        .unwrap_err();
        conn.execute_batch("ROLLBACK TO batch; RELEASE batch").unwrap();

        assert_eq!(err.to_string(), "Can't find post author by nickname: ghost");
        assert_eq!(post_count(conn), 0);
        assert_eq!(reader::find_forum(conn, "sailing").unwrap().unwrap().posts, 0);
        assert_eq!(path::current(conn).unwrap(), 0);
    }

    #[test]
    fn test_parent_in_other_thread_conflicts() {
        let (db, thread_id) = seeded();
        let conn = db.connection();
        let other = insert_thread(
            conn,
            "sailing",
            &NewThread {
                slug: None,
                title: "Other".to_string(),
                author: "bob".to_string(),
                message: "m".to_string(),
                created: None,
            },
        )
        .unwrap();

        let posts = insert_posts(conn, &ThreadRef::Id(other.id), &[NewPost::root("bob", "x")]).unwrap();
        let err = insert_posts(
            conn,
            &ThreadRef::Id(thread_id),
            &[NewPost::reply(posts[0].id, "bob", "cross")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ParentConflict { .. }));

        let err = insert_posts(conn, &ThreadRef::Id(thread_id), &[NewPost::reply(404, "bob", "x")])
            .unwrap_err();
        assert!(matches!(err, Error::ParentConflict { parent: 404 }));
    }

    #[test]
    fn test_update_post_edit_flag() {
        let (db, thread_id) = seeded();
        let conn = db.connection();
        let post = insert_posts(conn, &ThreadRef::Id(thread_id), &[NewPost::root("bob", "hi")])
            .unwrap()
            .remove(0);

        let same = update_post(conn, post.id, "hi").unwrap();
        assert!(!same.is_edited);
        let blank = update_post(conn, post.id, "").unwrap();
        assert!(!blank.is_edited);

        let edited = update_post(conn, post.id, "hello").unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.message, "hello");

        let still = update_post(conn, post.id, "hello").unwrap();
        assert!(still.is_edited);

        assert!(matches!(
            update_post(conn, 999, "x"),
            Err(Error::PostNotFound { id: 999 })
        ));
    }

    #[test]
    fn test_vote_transitions() {
        let (db, thread_id) = seeded();
        let conn = db.connection();
        let reference = ThreadRef::Id(thread_id);

        assert_eq!(cast_vote(conn, &reference, "alice", Voice::Up).unwrap().votes, 1);
        assert_eq!(cast_vote(conn, &reference, "ALICE", Voice::Up).unwrap().votes, 1);
        assert_eq!(cast_vote(conn, &reference, "alice", Voice::Down).unwrap().votes, -1);
        assert_eq!(cast_vote(conn, &reference, "bob", Voice::Down).unwrap().votes, -2);

        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM votes WHERE thread = ?1 AND nickname = 'alice'",
                [thread_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);

        let sum: i64 = conn
            .query_row("SELECT SUM(voice) FROM votes WHERE thread = ?1", [thread_id], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(sum, -2);
    }

    #[test]
    fn test_vote_unknown_user() {
        let (db, thread_id) = seeded();
        let err = cast_vote(db.connection(), &ThreadRef::Id(thread_id), "ghost", Voice::Up).unwrap_err();
        assert!(matches!(err, Error::UserNotFound { .. }));
    }
}
