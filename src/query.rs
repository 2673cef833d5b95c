//! # Post Query Planner
//!
//! Turns a [`PostListParams`] into one ordered, bounded SQL query over a
//! thread's posts. There is one plan per [`SortMode`]:
//!
//! ```text
//! posts (thread 7)           flat (id)     tree (path)     parent_tree, limit 1
//! ─────────────────────      ─────────     ───────────     ────────────────────
//! #1  000000001              #1            #1              #1
//! #2  000000001000000002     #2            #2              #2
//! #3  000000003              #3            #4              #4
//! #4  000000001000000002...  #4            #3
//! ```
//!
//! ## Cursors
//!
//! `since` is always exclusive: the cursor row itself is never returned, and
//! only rows strictly after it (ascending) or strictly before it (descending)
//! qualify. `desc` flips both the comparison and the order.
//!
//! | Mode | Cursor | Compared column |
//! |------|--------|-----------------|
//! | flat | post id | `id` |
//! | flat | timestamp | `created_us`, then `id` |
//! | tree | post id | that post's `path` |
//! | parent_tree | post id | that post's `root` |
//!
//! In the tree modes, a cursor post that does not belong to the thread yields
//! an empty page.
//!
//! ## Parent Tree
//!
//! `limit` counts root posts, not rows. The plan selects the page of roots in
//! a subquery and then returns every post under those roots:
//!
//! ```sql
//! SELECT ... FROM posts
//! WHERE thread = ?1 AND root IN (
//!     SELECT root FROM posts WHERE thread = ?1 AND parent = 0 ... LIMIT ?
//! )
//! ORDER BY root <dir>, path ASC
//! ```
//!
//! Groups follow `desc`, but posts inside a group always read top-down.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::path::PostPath;
use crate::reader::{post_from_row, POST_COLUMNS};
use crate::types::{sql_limit, to_storage_micros, Post, PostCursor, PostListParams, SortMode};

/// Comparison operator and sort direction for one listing direction.
fn direction(desc: bool) -> (&'static str, &'static str) {
    if desc {
        ("<", "DESC")
    } else {
        (">", "ASC")
    }
}

/// Lists a thread's posts in the requested order.
pub fn read_posts(conn: &Connection, thread_id: i64, params: &PostListParams) -> Result<Vec<Post>> {
    match params.sort {
        SortMode::Flat => read_flat(conn, thread_id, params),
        SortMode::Tree => read_tree(conn, thread_id, params),
        SortMode::ParentTree => read_parent_tree(conn, thread_id, params),
    }
}

fn collect(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Post>> {
    let mut stmt = conn.prepare(sql)?;
    let posts = stmt
        .query_map(params, post_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(posts)
}

// =============================================================================
// Flat
// =============================================================================

fn read_flat(conn: &Connection, thread_id: i64, params: &PostListParams) -> Result<Vec<Post>> {
    let (cmp, dir) = direction(params.desc);
    let limit = sql_limit(params.limit);

    match params.since {
        None => {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE thread = ?1
                 ORDER BY id {dir} LIMIT ?2"
            );
            collect(conn, &sql, params![thread_id, limit])
        }
        Some(PostCursor::Post(since)) => {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE thread = ?1 AND id {cmp} ?2
                 ORDER BY id {dir} LIMIT ?3"
            );
            collect(conn, &sql, params![thread_id, since, limit])
        }
        Some(PostCursor::Created(since)) => {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE thread = ?1 AND created_us {cmp} ?2
                 ORDER BY created_us {dir}, id {dir} LIMIT ?3"
            );
            collect(conn, &sql, params![thread_id, to_storage_micros(&since), limit])
        }
    }
}

// =============================================================================
// Tree
// =============================================================================

/// Path of the cursor post, if it belongs to this thread.
fn cursor_path(conn: &Connection, thread_id: i64, cursor: &PostCursor) -> Result<Option<PostPath>> {
    let id = match cursor {
        PostCursor::Post(id) => *id,
        PostCursor::Created(ts) => {
            return Err(Error::InvalidCursor(format!(
                "{} (tree modes take a post id)",
                crate::types::format_timestamp(ts)
            )))
        }
    };

    let encoded: Option<String> = conn
        .query_row(
            "SELECT path FROM posts WHERE id = ?1 AND thread = ?2",
            params![id, thread_id],
            |row| row.get(0),
        )
        .optional()?;

    encoded.map(PostPath::parse).transpose()
}

fn read_tree(conn: &Connection, thread_id: i64, params: &PostListParams) -> Result<Vec<Post>> {
    let (cmp, dir) = direction(params.desc);
    let limit = sql_limit(params.limit);

    match &params.since {
        None => {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE thread = ?1
                 ORDER BY path {dir} LIMIT ?2"
            );
            collect(conn, &sql, params![thread_id, limit])
        }
        Some(cursor) => {
            let Some(path) = cursor_path(conn, thread_id, cursor)? else {
                return Ok(Vec::new());
            };
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE thread = ?1 AND path {cmp} ?2
                 ORDER BY path {dir} LIMIT ?3"
            );
            collect(conn, &sql, params![thread_id, path.as_str(), limit])
        }
    }
}

// =============================================================================
// Parent Tree
// =============================================================================

fn read_parent_tree(
    conn: &Connection,
    thread_id: i64,
    params: &PostListParams,
) -> Result<Vec<Post>> {
    let (cmp, dir) = direction(params.desc);
    let limit = sql_limit(params.limit);

    let root_cursor = match &params.since {
        None => None,
        Some(cursor) => match cursor_path(conn, thread_id, cursor)? {
            Some(path) => Some(path.root_key().to_string()),
            None => return Ok(Vec::new()),
        },
    };

    let sql = format!(
        "SELECT {POST_COLUMNS} FROM posts
         WHERE thread = ?1 AND root IN (
             SELECT root FROM posts
             WHERE thread = ?1 AND parent = 0 AND (?2 IS NULL OR root {cmp} ?2)
             ORDER BY root {dir}
             LIMIT ?3
         )
         ORDER BY root {dir}, path ASC"
    );
    collect(conn, &sql, params![thread_id, root_cursor, limit])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::storage;
    use crate::types::{NewForum, NewPost, NewThread, ThreadRef, User};

    /// Thread with this shape (ids in creation order):
    ///
    /// ```text
    /// 1
    /// ├── 2
    /// │   └── 4
    /// └── 5
    /// 3
    /// 6
    /// ```
    fn seeded() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        storage::insert_user(
            conn,
            &User {
                nickname: "alice".to_string(),
                fullname: String::new(),
                about: String::new(),
                email: "alice@example.com".to_string(),
            },
        )
        .unwrap();
        storage::insert_forum(
            conn,
            &NewForum {
                slug: "sailing".to_string(),
                title: "Sailing".to_string(),
                user: "alice".to_string(),
            },
        )
        .unwrap();
        let thread = storage::insert_thread(
            conn,
            "sailing",
            &NewThread {
                slug: None,
                title: "t".to_string(),
                author: "alice".to_string(),
                message: "m".to_string(),
                created: None,
            },
        )
        .unwrap();
        let reference = ThreadRef::Id(thread.id);

        let first = storage::insert_posts(
            conn,
            &reference,
            &[
                NewPost::root("alice", "1"),
                NewPost::reply(1, "alice", "2"),
                NewPost::root("alice", "3"),
            ],
        )
        .unwrap();
        assert_eq!(first.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        storage::insert_posts(
            conn,
            &reference,
            &[
                NewPost::reply(2, "alice", "4"),
                NewPost::reply(1, "alice", "5"),
                NewPost::root("alice", "6"),
            ],
        )
        .unwrap();

        (db, thread.id)
    }

    fn ids(posts: &[Post]) -> Vec<i64> {
        posts.iter().map(|p| p.id).collect()
    }

    fn list(db: &Database, thread: i64, params: PostListParams) -> Vec<i64> {
        ids(&read_posts(db.connection(), thread, &params).unwrap())
    }

    #[test]
    fn test_flat_order_and_cursor() {
        let (db, thread) = seeded();

        assert_eq!(list(&db, thread, PostListParams::new(SortMode::Flat)), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::Flat).since(PostCursor::Post(2)).limit(2)),
            vec![3, 4]
        );
        assert_eq!(
            list(
                &db,
                thread,
                PostListParams::new(SortMode::Flat).since(PostCursor::Post(4)).desc(true)
            ),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn test_tree_order() {
        let (db, thread) = seeded();

        assert_eq!(list(&db, thread, PostListParams::new(SortMode::Tree)), vec![1, 2, 4, 5, 3, 6]);
        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::Tree).desc(true)),
            vec![6, 3, 5, 4, 2, 1]
        );
        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::Tree).since(PostCursor::Post(4)).limit(2)),
            vec![5, 3]
        );
        assert_eq!(
            list(
                &db,
                thread,
                PostListParams::new(SortMode::Tree).since(PostCursor::Post(5)).desc(true)
            ),
            vec![4, 2, 1]
        );
    }

    #[test]
    fn test_parent_tree_limit_counts_roots() {
        let (db, thread) = seeded();

        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::ParentTree).limit(1)),
            vec![1, 2, 4, 5]
        );
        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::ParentTree).limit(2).desc(true)),
            vec![6, 3]
        );
        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::ParentTree).desc(true)),
            vec![6, 3, 1, 2, 4, 5]
        );
    }

    /// A nested cursor post pages by its root group.
    #[test]
    fn test_parent_tree_cursor_uses_root() {
        let (db, thread) = seeded();

        assert_eq!(
            list(&db, thread, PostListParams::new(SortMode::ParentTree).since(PostCursor::Post(4))),
            vec![3, 6]
        );
        assert_eq!(
            list(
                &db,
                thread,
                PostListParams::new(SortMode::ParentTree).since(PostCursor::Post(6)).desc(true)
            ),
            vec![3, 1, 2, 4, 5]
        );
    }

    #[test]
    fn test_unknown_tree_cursor_is_empty_page() {
        let (db, thread) = seeded();

        for sort in [SortMode::Tree, SortMode::ParentTree] {
            let posts = read_posts(
                db.connection(),
                thread,
                &PostListParams::new(sort).since(PostCursor::Post(999)),
            )
            .unwrap();
            assert!(posts.is_empty());
        }
    }

    #[test]
    fn test_timestamp_cursor_rejected_in_tree_modes() {
        let (db, thread) = seeded();
        let cursor = PostCursor::Created(crate::types::from_storage_micros(0));

        let err = read_posts(db.connection(), thread, &PostListParams::new(SortMode::Tree).since(cursor))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCursor(_)));
    }

    #[test]
    fn test_empty_thread_every_mode() {
        let (db, _) = seeded();
        let conn = db.connection();
        let empty = storage::insert_thread(
            conn,
            "sailing",
            &NewThread {
                slug: Some("quiet".to_string()),
                title: "t".to_string(),
                author: "alice".to_string(),
                message: "m".to_string(),
                created: None,
            },
        )
        .unwrap();

        for sort in [SortMode::Flat, SortMode::Tree, SortMode::ParentTree] {
            let posts = read_posts(conn, empty.id, &PostListParams::new(sort)).unwrap();
            assert!(posts.is_empty(), "{sort} should be empty");
        }
    }
}
