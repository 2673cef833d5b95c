//! # Forum Service
//!
//! [`ForumService`] is the entry point a delivery layer (HTTP handlers, a CLI,
//! tests) talks to. It sits on top of [`ForumDb`] and owns the domain rules
//! that are not plain storage:
//!
//! - **Soft conflicts**: creating a user, forum or thread whose unique key is
//!   taken returns [`Created::Conflict`] with the stored entity instead of an
//!   error. The key is looked up first; a unique violation from a concurrent
//!   insert is caught and answered the same way.
//! - **Not-found classification**: lookups that come back empty become the
//!   matching `*NotFound` error, echoing the identifier that failed.
//! - **Validation**: vote voices outside `{-1, +1}` are rejected before any
//!   storage round-trip.
//!
//! ```text
//! caller ──► ForumService ──┬──► BatchWriterHandle ──► writer thread
//!                           └──► reader pool
//! ```

use tracing::{info, instrument};

use crate::api::ForumDb;
use crate::config::ForumConfig;
use crate::error::{Error, Result};
use crate::types::{
    Created, Forum, NewForum, NewPost, NewThread, Post, PostDetails, PostListParams, Related,
    ServiceStatus, Thread, ThreadListParams, ThreadRef, ThreadUpdate, User, UserListParams, Vote,
    Voice,
};

/// Domain-level operations over a [`ForumDb`].
#[derive(Clone)]
pub struct ForumService {
    db: ForumDb,
}

impl ForumService {
    pub fn new(db: ForumDb) -> Self {
        Self { db }
    }

    /// Opens the database and wraps it.
    pub async fn open(config: ForumConfig) -> Result<Self> {
        Ok(Self::new(ForumDb::open(config).await?))
    }

    pub fn db(&self) -> &ForumDb {
        &self.db
    }

    pub async fn shutdown(self) {
        self.db.shutdown().await;
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Registers a user; a taken nickname or email is a soft conflict.
    #[instrument(skip(self, user), fields(nickname = %user.nickname))]
    pub async fn create_user(&self, user: User) -> Result<Created<User>> {
        if let Some(existing) = self.db.find_user(user.nickname.as_str()).await? {
            return Ok(Created::Conflict(existing));
        }

        let nickname = user.nickname.clone();
        let email = user.email.clone();
        match self.db.writer().create_user(user).await {
            Ok(created) => {
                info!("user created");
                Ok(Created::New(created))
            }
            Err(e) if e.is_unique_violation() => {
                let existing = match self.db.find_user(nickname.as_str()).await? {
                    Some(existing) => Some(existing),
                    None => self.db.find_user_by_email(email).await?,
                };
                existing
                    .map(Created::Conflict)
                    .ok_or(Error::UserExists { nickname })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn find_user(&self, nickname: &str) -> Result<User> {
        self.db
            .find_user(nickname)
            .await?
            .ok_or_else(|| Error::UserNotFound {
                nickname: nickname.to_string(),
            })
    }

    // =========================================================================
    // Forums
    // =========================================================================

    /// Creates a forum; an existing slug is a soft conflict.
    #[instrument(skip(self, forum), fields(slug = %forum.slug))]
    pub async fn create_forum(&self, forum: NewForum) -> Result<Created<Forum>> {
        if let Some(existing) = self.db.find_forum(forum.slug.as_str()).await? {
            return Ok(Created::Conflict(existing));
        }

        let slug = forum.slug.clone();
        match self.db.writer().create_forum(forum).await {
            Ok(created) => {
                info!(owner = %created.user, "forum created");
                Ok(Created::New(created))
            }
            Err(e) if e.is_unique_violation() => self
                .db
                .find_forum(slug.as_str())
                .await?
                .map(Created::Conflict)
                .ok_or(Error::ForumExists { slug }),
            Err(e) => Err(e),
        }
    }

    pub async fn get_forum(&self, slug: &str) -> Result<Forum> {
        self.db
            .find_forum(slug)
            .await?
            .ok_or_else(|| Error::ForumNotFound {
                slug: slug.to_string(),
            })
    }

    /// Threads of a forum ordered by creation time. `[]` for an empty forum.
    #[instrument(skip(self, params))]
    pub async fn list_threads(&self, slug: &str, params: ThreadListParams) -> Result<Vec<Thread>> {
        self.db.list_threads(slug, params).await
    }

    /// Users who wrote in a forum, ordered by nickname.
    #[instrument(skip(self, params))]
    pub async fn list_users(&self, slug: &str, params: UserListParams) -> Result<Vec<User>> {
        self.db.list_forum_users(slug, params).await
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Creates a thread in a forum; an existing slug is a soft conflict.
    ///
    /// A blank slug is stored as no slug and never conflicts.
    #[instrument(skip(self, thread), fields(slug = ?thread.slug))]
    pub async fn create_thread(&self, forum: &str, mut thread: NewThread) -> Result<Created<Thread>> {
        thread.slug = thread.slug.filter(|slug| !slug.is_empty());
        let slug = thread.slug.clone();
        if let Some(slug) = &slug {
            if let Some(existing) = self.db.find_thread(ThreadRef::Slug(slug.clone())).await? {
                return Ok(Created::Conflict(existing));
            }
        }

        match self.db.writer().create_thread(forum.to_string(), thread).await {
            Ok(created) => {
                info!(thread = created.id, "thread created");
                Ok(Created::New(created))
            }
            Err(e) if e.is_unique_violation() => {
                let Some(slug) = slug else {
                    return Err(e);
                };
                self.db
                    .find_thread(ThreadRef::Slug(slug.clone()))
                    .await?
                    .map(Created::Conflict)
                    .ok_or(Error::ThreadExists { slug })
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves a thread reference: numeric references are tried as ids first.
    pub async fn resolve_thread(&self, reference: &ThreadRef) -> Result<Thread> {
        self.db
            .find_thread(reference.clone())
            .await?
            .ok_or_else(|| Error::ThreadNotFound {
                reference: reference.to_string(),
            })
    }

    pub async fn get_thread(&self, reference: &ThreadRef) -> Result<Thread> {
        self.resolve_thread(reference).await
    }

    /// Edits title and/or message; blank fields keep the stored value.
    #[instrument(skip(self, update), fields(thread = %reference))]
    pub async fn update_thread(&self, reference: &ThreadRef, update: ThreadUpdate) -> Result<Thread> {
        self.db
            .writer()
            .update_thread(reference.clone(), update)
            .await
    }

    /// Casts or changes a vote and returns the thread with its new tally.
    #[instrument(skip(self, vote), fields(thread = %reference, nickname = %vote.nickname))]
    pub async fn vote(&self, reference: &ThreadRef, vote: Vote) -> Result<Thread> {
        let voice = Voice::try_from(vote.voice)?;
        self.db
            .writer()
            .cast_vote(reference.clone(), vote.nickname, voice)
            .await
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Creates a batch of posts in one thread, all or nothing.
    ///
    /// An empty batch writes nothing but still requires the thread to exist.
    #[instrument(skip(self, posts), fields(thread = %reference, batch = posts.len()))]
    pub async fn create_posts(&self, reference: &ThreadRef, posts: Vec<NewPost>) -> Result<Vec<Post>> {
        if posts.is_empty() {
            self.resolve_thread(reference).await?;
            return Ok(Vec::new());
        }

        let created = self
            .db
            .writer()
            .create_posts(reference.clone(), posts)
            .await?;
        info!(count = created.len(), "posts created");
        Ok(created)
    }

    pub async fn get_post(&self, id: i64) -> Result<Post> {
        self.db
            .find_post(id)
            .await?
            .ok_or(Error::PostNotFound { id })
    }

    /// A post plus the entities named in `related`.
    pub async fn get_post_details(&self, id: i64, related: &[Related]) -> Result<PostDetails> {
        let post = self.get_post(id).await?;
        let mut details = PostDetails {
            post,
            author: None,
            thread: None,
            forum: None,
        };

        for kind in related {
            match kind {
                Related::User => {
                    details.author = Some(self.find_user(&details.post.author).await?);
                }
                Related::Thread => {
                    details.thread =
                        Some(self.resolve_thread(&ThreadRef::Id(details.post.thread)).await?);
                }
                Related::Forum => {
                    details.forum = Some(self.get_forum(&details.post.forum).await?);
                }
            }
        }

        Ok(details)
    }

    /// Replaces a post's message. Empty or unchanged text is a no-op.
    #[instrument(skip(self, message))]
    pub async fn update_post(&self, id: i64, message: &str) -> Result<Post> {
        self.db.writer().update_post(id, message.to_string()).await
    }

    /// Posts of a thread in the requested order. `[]` when nothing matches.
    #[instrument(skip(self, params), fields(thread = %reference, sort = %params.sort))]
    pub async fn list_posts(&self, reference: &ThreadRef, params: PostListParams) -> Result<Vec<Post>> {
        self.db.list_posts(reference.clone(), params).await
    }

    // =========================================================================
    // Service
    // =========================================================================

    pub async fn status(&self) -> Result<ServiceStatus> {
        self.db.status().await
    }
}
