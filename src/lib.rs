//! # ForumDB - Threaded Post Storage for a Forum Backend
//!
//! ForumDB is the storage core of a forum service built on SQLite. It provides:
//!
//! - **Comment trees**: every post stores a materialized path, so whole
//!   subtrees sort and page with ordinary index scans
//! - **Atomic post batches**: a batch with one bad post writes nothing
//! - **Three listing orders**: flat, depth-first tree, and root-grouped
//!   "parent tree", all with exclusive cursors
//! - **A vote ledger**: one vote per (user, thread), tally kept in step
//! - **Group commit**: concurrent writes share one SQLite transaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ForumService                             │
//! │     (id-or-slug resolution, soft conflicts, not-found errors)   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌────────────────────────────────┐  ┌─────────────────────────────┐
//! │          Writer Thread         │  │        Reader Pool          │
//! │  group commit + SAVEPOINTs     │  │  read-only connections      │
//! │  ┌────────────┐ ┌────────────┐ │  │  ┌───────────────────────┐  │
//! │  │ Post Tree  │ │ Vote       │ │  │  │ Query Planner         │  │
//! │  │ Store      │ │ Ledger     │ │  │  │ flat/tree/parent_tree │  │
//! │  └────────────┘ └────────────┘ │  │  └───────────────────────┘  │
//! └───────────────┬────────────────┘  └──────────────┬──────────────┘
//!                 └──────────────┬───────────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Prefix property**: a reply's path is its parent's path plus one segment
//! 2. **Monotonic segments**: path segments come from one storage-level
//!    counter, so path order matches insertion order at every depth
//! 3. **One vote per voter**: at most one row per (nickname, thread), and
//!    `Thread.votes` equals the sum of those rows
//! 4. **Batch atomicity**: a post batch commits completely or not at all,
//!    forum counter included
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and its NotFound/Conflict/Validation/StorageFailure kinds
//! - [`path`]: Materialized path encoding and the segment allocator
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Entities, request shapes and listing parameters
//! - [`storage`]: Post tree store and vote ledger (write side)
//! - [`query`]: Post listing plans
//! - [`reader`]: Lookups, listings and the reader pool
//! - [`writer`]: Batch writer with group commit
//! - [`config`]: Runtime configuration
//! - [`api`]: Async storage handle
//! - [`usecase`]: Domain orchestration (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for ForumDB operations.
pub mod error;

/// Materialized post paths.
///
/// Fixed-width, zero-padded segments whose byte order equals tree order, and
/// the allocator that hands out new segments inside the write transaction.
pub mod path;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types: users, forums, threads, posts, votes and request parameters.
pub mod types;

/// Synchronous write operations run by the batch writer.
pub mod storage;

/// Post listing in flat, tree and parent-tree order.
pub mod query;

/// Read operations and the pooled reader loop.
pub mod reader;

/// Batch writer with group commit.
///
/// Requests are collected over a short window (default 2ms) and executed in
/// one `BEGIN IMMEDIATE` transaction, each in its own SAVEPOINT, so a failing
/// post batch rolls back alone.
pub mod writer;

/// Configuration loaded from code or `FORUMDB_*` environment variables.
pub mod config;

/// Async handle owning the writer thread and the reader pool.
pub mod api;

/// Domain-level operations: the entry point for delivery layers.
pub mod usecase;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::ForumDb;
pub use config::ForumConfig;
pub use error::{Error, ErrorKind, Result};
pub use path::{PathSegment, PostPath};
pub use schema::Database;
pub use usecase::ForumService;
pub use writer::{BatchWriterHandle, WriterConfig};

pub use types::{
    Created, Forum, NewForum, NewPost, NewThread, Post, PostCursor, PostDetails, PostListParams,
    Related, ServiceStatus, SortMode, Thread, ThreadListParams, ThreadRef, ThreadUpdate, User,
    UserListParams, Vote, Voice,
};
