//! # Domain Types for ForumDB
//!
//! This module defines the entities (users, forums, threads, posts, votes),
//! the request shapes used to create and edit them, and the small newtypes
//! that carry request parameters (thread references, voices, sort modes,
//! cursors).
//!
//! ## JSON Shape
//!
//! All entities derive serde with the field names of the REST surface
//! (`isEdited`, `user`, ...). Optional fields are skipped when unset rather than
//! serialized as `null`, and timestamps are RFC 3339 in UTC.
//!
//! ## Newtypes for Parameters
//!
//! Raw query-string values are parsed once, at the edge, into closed types:
//!
//! - [`ThreadRef`]: numeric id or slug (numeric wins, see [`ThreadRef::parse`])
//! - [`Voice`]: exactly `-1` or `+1`
//! - [`SortMode`]: `flat`, `tree` or `parent_tree`, anything else is rejected
//! - [`PostCursor`]: post id or timestamp

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::PostPath;

// =============================================================================
// Timestamps
// =============================================================================

/// Converts a timestamp to the microsecond integer stored in SQLite.
pub(crate) fn to_storage_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Converts a stored microsecond integer back to a timestamp.
pub(crate) fn from_storage_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Current time truncated to storage precision.
pub(crate) fn now() -> DateTime<Utc> {
    from_storage_micros(to_storage_micros(&Utc::now()))
}

/// Parses an RFC 3339 timestamp from a query parameter.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| Error::InvalidCursor(raw.to_string()))
}

/// Formats a timestamp the way it is rendered in responses.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

// =============================================================================
// Entities
// =============================================================================

/// A user profile. Owned by the user directory; this crate only checks existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub nickname: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub about: String,
    pub email: String,
}

/// A forum with its denormalized counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forum {
    pub slug: String,
    pub title: String,
    /// Owner nickname, in the casing stored by the user directory.
    pub user: String,
    #[serde(default)]
    pub posts: i64,
    #[serde(default)]
    pub threads: i64,
}

/// A discussion thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub forum: String,
    pub author: String,
    pub title: String,
    pub message: String,
    pub created: DateTime<Utc>,
    /// Sum of every vote's voice for this thread.
    pub votes: i64,
}

/// A post ("comment") in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    /// Parent post id, `0` for a root post.
    pub parent: i64,
    pub thread: i64,
    pub forum: String,
    pub author: String,
    pub message: String,
    pub created: DateTime<Utc>,
    #[serde(rename = "isEdited")]
    pub is_edited: bool,
    /// Materialized ancestry; internal, never part of the wire format.
    #[serde(skip)]
    pub path: PostPath,
}

impl Post {
    pub fn is_root(&self) -> bool {
        self.parent == 0
    }
}

/// One user's vote on one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub nickname: String,
    pub voice: i64,
}

/// A post together with the entities requested via `related`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostDetails {
    pub post: Post,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forum: Option<Forum>,
}

/// Row counts across the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub user: i64,
    pub forum: i64,
    pub thread: i64,
    pub post: i64,
}

// =============================================================================
// Creation Requests
// =============================================================================

/// Request body for creating a forum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewForum {
    pub slug: String,
    pub title: String,
    pub user: String,
}

/// Request body for creating a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewThread {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub title: String,
    pub author: String,
    pub message: String,
    /// Defaults to the time of creation when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// One element of a post batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    #[serde(default)]
    pub parent: i64,
    pub author: String,
    pub message: String,
}

impl NewPost {
    pub fn root(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parent: 0,
            author: author.into(),
            message: message.into(),
        }
    }

    pub fn reply(parent: i64, author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parent,
            author: author.into(),
            message: message.into(),
        }
    }
}

/// Partial thread edit: blank fields keep the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadUpdate {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

impl ThreadUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.message.is_empty()
    }
}

/// Outcome of a create operation that can hit an existing unique key.
///
/// A soft conflict is not an error: the caller gets the stored entity back and
/// decides whether an identical resubmission counts as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created<T> {
    /// The entity was inserted.
    New(T),
    /// An entity with the same unique key already existed; this is it.
    Conflict(T),
}

impl<T> Created<T> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Created::Conflict(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Created::New(v) | Created::Conflict(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Created::New(v) | Created::Conflict(v) => v,
        }
    }
}

// =============================================================================
// Thread Reference
// =============================================================================

/// A thread identified either by numeric id or by slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThreadRef {
    Id(i64),
    Slug(String),
}

impl ThreadRef {
    /// Parses a path parameter.
    ///
    /// Anything that parses as an integer is an id, so a thread whose slug is
    /// `"42"` can only be reached by that slug if no thread has id 42.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(id) => ThreadRef::Id(id),
            Err(_) => ThreadRef::Slug(raw.to_string()),
        }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRef::Id(id) => write!(f, "{id}"),
            ThreadRef::Slug(slug) => f.write_str(slug),
        }
    }
}

impl From<i64> for ThreadRef {
    fn from(id: i64) -> Self {
        ThreadRef::Id(id)
    }
}

impl From<&str> for ThreadRef {
    fn from(raw: &str) -> Self {
        ThreadRef::parse(raw)
    }
}

impl From<String> for ThreadRef {
    fn from(raw: String) -> Self {
        ThreadRef::parse(&raw)
    }
}

// =============================================================================
// Voice
// =============================================================================

/// The signed unit one vote contributes to a thread's tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Voice {
    Down,
    Up,
}

impl Voice {
    pub fn as_raw(&self) -> i64 {
        match self {
            Voice::Down => -1,
            Voice::Up => 1,
        }
    }
}

impl TryFrom<i64> for Voice {
    type Error = Error;

    fn try_from(voice: i64) -> Result<Self> {
        match voice {
            -1 => Ok(Voice::Down),
            1 => Ok(Voice::Up),
            other => Err(Error::InvalidVoice { voice: other }),
        }
    }
}

// =============================================================================
// Listing Parameters
// =============================================================================

/// Traversal order for a thread's posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortMode {
    /// By id (creation order).
    #[default]
    Flat,
    /// Depth-first, by full path.
    Tree,
    /// Depth-first, but `limit` counts root posts rather than rows.
    ParentTree,
}

impl FromStr for SortMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "flat" => Ok(SortMode::Flat),
            "tree" => Ok(SortMode::Tree),
            "parent_tree" => Ok(SortMode::ParentTree),
            other => Err(Error::InvalidSort(other.to_string())),
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortMode::Flat => "flat",
            SortMode::Tree => "tree",
            SortMode::ParentTree => "parent_tree",
        })
    }
}

/// Continuation point for a post listing. Always exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCursor {
    /// Last post id seen. In tree modes it resolves to that post's path.
    Post(i64),
    /// Creation time; only meaningful for [`SortMode::Flat`].
    Created(DateTime<Utc>),
}

impl FromStr for PostCursor {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        if let Ok(id) = raw.parse::<i64>() {
            return Ok(PostCursor::Post(id));
        }
        parse_timestamp(raw).map(PostCursor::Created)
    }
}

/// Parses a `limit` query parameter; missing means unbounded.
pub fn parse_limit(raw: Option<&str>) -> Result<i64> {
    match raw {
        None | Some("") => Ok(0),
        Some(s) => s.parse().map_err(|_| Error::InvalidParameter {
            name: "limit".to_string(),
            reason: format!("'{s}' is not an integer"),
        }),
    }
}

/// Parses a `desc` query parameter; missing means ascending.
pub fn parse_desc(raw: Option<&str>) -> Result<bool> {
    match raw {
        None | Some("") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(s) => Err(Error::InvalidParameter {
            name: "desc".to_string(),
            reason: format!("'{s}' is not a boolean"),
        }),
    }
}

/// Value for SQLite's `LIMIT`, where `-1` means no limit.
pub(crate) fn sql_limit(limit: i64) -> i64 {
    if limit <= 0 {
        -1
    } else {
        limit
    }
}

/// Parameters of `GET /thread/{slug_or_id}/posts`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostListParams {
    /// `<= 0` means unbounded. In parent-tree mode this counts root posts.
    pub limit: i64,
    pub since: Option<PostCursor>,
    pub desc: bool,
    pub sort: SortMode,
}

impl PostListParams {
    pub fn new(sort: SortMode) -> Self {
        Self {
            sort,
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn since(mut self, cursor: PostCursor) -> Self {
        self.since = Some(cursor);
        self
    }

    pub fn desc(mut self, desc: bool) -> Self {
        self.desc = desc;
        self
    }

    /// Builds parameters from raw query-string values.
    pub fn from_query(
        limit: Option<&str>,
        since: Option<&str>,
        desc: Option<&str>,
        sort: Option<&str>,
    ) -> Result<Self> {
        let sort = match sort {
            None | Some("") => SortMode::Flat,
            Some(s) => s.parse()?,
        };
        let since = match since {
            None | Some("") => None,
            Some(s) => Some(s.parse()?),
        };
        Ok(Self {
            limit: parse_limit(limit)?,
            since,
            desc: parse_desc(desc)?,
            sort,
        })
    }
}

/// Parameters of `GET /forum/{slug}/threads`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadListParams {
    pub limit: i64,
    /// Inclusive: threads created exactly at `since` are returned.
    pub since: Option<DateTime<Utc>>,
    pub desc: bool,
}

impl ThreadListParams {
    pub fn from_query(limit: Option<&str>, since: Option<&str>, desc: Option<&str>) -> Result<Self> {
        let since = match since {
            None | Some("") => None,
            Some(s) => Some(parse_timestamp(s)?),
        };
        Ok(Self {
            limit: parse_limit(limit)?,
            since,
            desc: parse_desc(desc)?,
        })
    }
}

/// Parameters of `GET /forum/{slug}/users`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserListParams {
    pub limit: i64,
    /// Exclusive, compared case-insensitively.
    pub since: Option<String>,
    pub desc: bool,
}

impl UserListParams {
    pub fn from_query(limit: Option<&str>, since: Option<&str>, desc: Option<&str>) -> Result<Self> {
        Ok(Self {
            limit: parse_limit(limit)?,
            since: since.filter(|s| !s.is_empty()).map(str::to_string),
            desc: parse_desc(desc)?,
        })
    }
}

/// Entities that can be attached to a post detail response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Related {
    User,
    Forum,
    Thread,
}

impl Related {
    /// Parses a comma-separated `related` parameter, ignoring unknown names.
    pub fn parse_list(raw: &str) -> Vec<Related> {
        raw.split(',')
            .filter_map(|name| match name.trim() {
                "user" => Some(Related::User),
                "forum" => Some(Related::Forum),
                "thread" => Some(Related::Thread),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
