//! # Error Handling for ForumDB
//!
//! This module defines the error types used throughout ForumDB. A single error
//! enum ([`Error`]) represents every failure mode, and [`Error::kind`] folds the
//! variants into the four categories a delivery layer cares about.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//!
//! ## Error Categories
//!
//! | Kind | Examples | Transport status |
//! |------|----------|------------------|
//! | NotFound | unknown forum, thread, post, user | 404 |
//! | Conflict | duplicate slug, parent in another thread | 409 |
//! | Validation | vote outside ±1, unknown sort mode, bad cursor | 400 |
//! | StorageFailure | SQLite error, writer gone, timeout | 500 |
//!
//! Not-found variants echo the identifier that failed to resolve, so the
//! message alone is enough to debug a bad request.

use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Forum, thread, post or user is missing.
    NotFound,
    /// Unique key already taken, or a parent post lives in another thread.
    Conflict,
    /// Malformed request parameters.
    Validation,
    /// Any persistence failure not otherwise classified.
    StorageFailure,
}

impl ErrorKind {
    /// HTTP status code a delivery layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::StorageFailure => 500,
        }
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in ForumDB operations.
///
/// # Example
///
/// ```rust
/// use forumdb::{Error, ErrorKind};
///
/// let err = Error::ThreadNotFound { reference: "42".to_string() };
/// assert_eq!(err.kind(), ErrorKind::NotFound);
/// assert_eq!(err.to_string(), "Can't find thread by slug or id: 42");
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Not Found
    // =========================================================================
    #[error("Can't find forum by slug: {slug}")]
    ForumNotFound { slug: String },

    #[error("Can't find thread by slug or id: {reference}")]
    ThreadNotFound { reference: String },

    #[error("Can't find post with id: {id}")]
    PostNotFound { id: i64 },

    #[error("Can't find user by nickname: {nickname}")]
    UserNotFound { nickname: String },

    /// A post in a batch names an author the user directory does not know.
    #[error("Can't find post author by nickname: {nickname}")]
    AuthorNotFound { nickname: String },

    // =========================================================================
    // Conflicts
    // =========================================================================
    /// The parent post is unknown, or belongs to a different thread than the batch.
    #[error("Parent post {parent} was created in another thread")]
    ParentConflict { parent: i64 },

    #[error("forum with slug '{slug}' already exists")]
    ForumExists { slug: String },

    #[error("thread with slug '{slug}' already exists")]
    ThreadExists { slug: String },

    #[error("user with nickname or email '{nickname}' already exists")]
    UserExists { nickname: String },

    // =========================================================================
    // Validation
    // =========================================================================
    #[error("vote voice must be -1 or 1, got {voice}")]
    InvalidVoice { voice: i64 },

    #[error("unknown sort mode '{0}': expected flat, tree or parent_tree")]
    InvalidSort(String),

    #[error("invalid cursor '{0}'")]
    InvalidCursor(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    // =========================================================================
    // Storage
    // =========================================================================
    /// SQLite operation failed.
    ///
    /// The `#[from]` attribute lets `?` convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or a row that does not decode.
    #[error("schema error: {0}")]
    Schema(String),

    /// A writer or reader worker failed outside any single statement: a
    /// group COMMIT that did not go through, an answer of the wrong shape, or
    /// a thread that could not be started.
    #[error("worker failure: {0}")]
    Worker(String),

    /// The path counter ran past the widest value a segment can hold.
    ///
    /// This is a configuration problem (segment width too small for the
    /// data set), not something a retry can fix.
    #[error("post path space exhausted: segment {0} does not fit the fixed width")]
    PathSpaceExhausted(u64),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0} has shut down")]
    Shutdown(&'static str),
}

impl Error {
    /// Classifies this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ForumNotFound { .. }
            | Error::ThreadNotFound { .. }
            | Error::PostNotFound { .. }
            | Error::UserNotFound { .. }
            | Error::AuthorNotFound { .. } => ErrorKind::NotFound,
            Error::ParentConflict { .. }
            | Error::ForumExists { .. }
            | Error::ThreadExists { .. }
            | Error::UserExists { .. } => ErrorKind::Conflict,
            Error::InvalidVoice { .. }
            | Error::InvalidSort(_)
            | Error::InvalidCursor(_)
            | Error::InvalidParameter { .. } => ErrorKind::Validation,
            Error::Sqlite(_)
            | Error::Schema(_)
            | Error::Worker(_)
            | Error::PathSpaceExhausted(_)
            | Error::Timeout(_)
            | Error::Shutdown(_) => ErrorKind::StorageFailure,
        }
    }

    /// Returns true if this is a SQLite UNIQUE or PRIMARY KEY violation.
    pub(crate) fn is_unique_violation(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
