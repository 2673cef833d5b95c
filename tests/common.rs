#![allow(dead_code)]

use std::path::{Path, PathBuf};

use forumdb::{
    ForumConfig, ForumService, NewForum, NewPost, NewThread, Post, Thread, ThreadRef, User,
};
use rusqlite::{Connection, OpenFlags};

pub const FORUM: &str = "sailing";

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Opens a service on a fresh database file. Keep the `TempDir` alive.
pub async fn open_service(name: &str) -> (tempfile::TempDir, ForumService) {
    let (dir, path) = create_temp_db_path(name);
    let svc = ForumService::open(ForumConfig::new(path).reader_threads(2))
        .await
        .expect("open service");
    (dir, svc)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn user(nickname: &str) -> User {
    User {
        nickname: nickname.to_string(),
        fullname: format!("{nickname} sailor"),
        about: String::new(),
        email: format!("{nickname}@example.com"),
    }
}

pub fn new_thread(slug: Option<&str>, author: &str) -> NewThread {
    NewThread {
        slug: slug.map(str::to_string),
        title: "How to tie a bowline".to_string(),
        author: author.to_string(),
        message: "Rabbit, hole, tree.".to_string(),
        created: None,
    }
}

/// Users `alice` and `bob`, forum `sailing` owned by alice.
pub async fn seed_forum(svc: &ForumService) {
    for nickname in ["alice", "bob"] {
        svc.create_user(user(nickname)).await.expect("create user");
    }
    svc.create_forum(NewForum {
        slug: FORUM.to_string(),
        title: "Sailing".to_string(),
        user: "alice".to_string(),
    })
    .await
    .expect("create forum");
}

/// Seeded forum plus one thread with the given slug.
pub async fn seed_thread(svc: &ForumService, slug: Option<&str>) -> Thread {
    seed_forum(svc).await;
    svc.create_thread(FORUM, new_thread(slug, "alice"))
        .await
        .expect("create thread")
        .into_inner()
}

/// Builds this tree in a thread, one batch per level (ids are returned in
/// creation order):
///
/// ```text
/// a
/// ├── a1
/// │   └── a1x
/// └── a2
/// b
/// c
/// ```
pub async fn seed_tree(svc: &ForumService, thread: &Thread) -> Vec<Post> {
    let reference = ThreadRef::Id(thread.id);
    let roots = svc
        .create_posts(
            &reference,
            vec![
                NewPost::root("alice", "a"),
                NewPost::root("bob", "b"),
                NewPost::root("alice", "c"),
            ],
        )
        .await
        .expect("roots");
    let replies = svc
        .create_posts(
            &reference,
            vec![
                NewPost::reply(roots[0].id, "bob", "a1"),
                NewPost::reply(roots[0].id, "alice", "a2"),
            ],
        )
        .await
        .expect("replies");
    let nested = svc
        .create_posts(&reference, vec![NewPost::reply(replies[0].id, "alice", "a1x")])
        .await
        .expect("nested");

    roots.into_iter().chain(replies).chain(nested).collect()
}

pub fn messages(posts: &[Post]) -> Vec<&str> {
    posts.iter().map(|p| p.message.as_str()).collect()
}
