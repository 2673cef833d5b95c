//! # Materialized Post Paths
//!
//! Every post stores its full ancestry as a string of fixed-width, zero-padded
//! segments. A root post has one segment; a reply has its parent's path with one
//! more segment appended:
//!
//! ```text
//! post 1 (root)         000000001
//! post 2 (reply to 1)   000000001000000002
//! post 3 (root)         000000003
//! post 4 (reply to 2)   000000001000000002000000004
//! ```
//!
//! Because every segment has the same width, plain byte-wise string comparison
//! of two paths is the same as comparing their segment lists lexicographically.
//! SQLite can therefore sort and range-filter whole subtrees with an ordinary
//! index on a TEXT column.
//!
//! ## Allocation
//!
//! Segments come from one storage-level counter (the single row in
//! `path_counter`). The counter is bumped with `UPDATE ... RETURNING` inside the
//! writer's `BEGIN IMMEDIATE` transaction, so two writers - even in different
//! processes - can never observe the same value, and segment order follows
//! insertion order at every depth.

use std::fmt;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};

/// Number of decimal digits in one path segment.
pub const SEGMENT_WIDTH: usize = 9;

/// Largest counter value that still fits in [`SEGMENT_WIDTH`] digits.
pub const MAX_SEGMENT: u64 = 999_999_999;

// =============================================================================
// Path Segment
// =============================================================================

/// One allocated ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathSegment(u32);

impl PathSegment {
    /// Wraps a raw counter value, rejecting values wider than the segment.
    pub fn new(value: u64) -> Result<Self> {
        if value == 0 || value > MAX_SEGMENT {
            return Err(Error::PathSpaceExhausted(value));
        }
        Ok(Self(value as u32))
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = SEGMENT_WIDTH)
    }
}

// =============================================================================
// Post Path
// =============================================================================

/// The encoded ancestry of a post.
///
/// Ordering (`Ord`) is the same as the storage ordering: lexicographic over
/// segments, with a prefix sorting before everything it prefixes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PostPath(String);

impl PostPath {
    /// Path of a root post.
    pub fn root(segment: PathSegment) -> Self {
        Self(segment.to_string())
    }

    /// Path of a reply to the post at `self`.
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut encoded = String::with_capacity(self.0.len() + SEGMENT_WIDTH);
        encoded.push_str(&self.0);
        encoded.push_str(&segment.to_string());
        Self(encoded)
    }

    /// Decodes a stored path, validating its shape.
    pub fn parse(encoded: impl Into<String>) -> Result<Self> {
        let encoded = encoded.into();
        if encoded.is_empty()
            || encoded.len() % SEGMENT_WIDTH != 0
            || !encoded.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(Error::Schema(format!("malformed post path '{encoded}'")));
        }
        Ok(Self(encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of segments (1 for a root post).
    pub fn depth(&self) -> usize {
        self.0.len() / SEGMENT_WIDTH
    }

    /// The encoded first segment, shared by every post of one root group.
    pub fn root_key(&self) -> &str {
        &self.0[..SEGMENT_WIDTH.min(self.0.len())]
    }

    /// Decoded segments, outermost first.
    pub fn segments(&self) -> Vec<u32> {
        self.0
            .as_bytes()
            .chunks(SEGMENT_WIDTH)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0u32, |acc, digit| acc * 10 + u32::from(digit - b'0'))
            })
            .collect()
    }

    /// Last segment, i.e. the key allocated for this post itself.
    pub fn leaf(&self) -> u32 {
        self.segments().last().copied().unwrap_or(0)
    }

    /// True if `ancestor` is a (non-strict) prefix of this path.
    pub fn descends_from(&self, ancestor: &PostPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

impl fmt::Display for PostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Issues the next path segment from the storage-level counter.
///
/// Must run inside the caller's write transaction: the increment commits or
/// rolls back together with the rows that use it.
pub fn allocate(conn: &Connection) -> Result<PathSegment> {
    let value: Option<i64> = conn
        .query_row(
            "UPDATE path_counter SET value = value + 1 WHERE id = 0 RETURNING value",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let value = value.ok_or_else(|| Error::Schema("path_counter row is missing".to_string()))?;
    PathSegment::new(value as u64)
}

/// Current counter value without allocating.
pub fn current(conn: &Connection) -> Result<u64> {
    let value: i64 = conn.query_row("SELECT value FROM path_counter WHERE id = 0", [], |row| {
        row.get(0)
    })?;
    Ok(value as u64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn seg(v: u64) -> PathSegment {
        PathSegment::new(v).unwrap()
    }

    #[test]
    fn test_segment_is_zero_padded() {
        assert_eq!(seg(42).to_string(), "000000042");
        assert_eq!(seg(MAX_SEGMENT).to_string(), "999999999");
    }

    #[test]
    fn test_segment_overflow_is_fatal() {
        let err = PathSegment::new(MAX_SEGMENT + 1).unwrap_err();
        assert!(matches!(err, Error::PathSpaceExhausted(1_000_000_000)));
    }

    #[test]
    fn test_child_extends_parent() {
        let root = PostPath::root(seg(1));
        let reply = root.child(seg(2));
        let nested = reply.child(seg(10));

        assert_eq!(nested.depth(), 3);
        assert_eq!(nested.segments(), vec![1, 2, 10]);
        assert_eq!(nested.leaf(), 10);
        assert_eq!(nested.root_key(), "000000001");
        assert!(nested.descends_from(&reply));
        assert!(nested.descends_from(&root));
        assert!(!reply.descends_from(&nested));
    }

    /// String order must agree with segment order, including across widths
    /// where a naive decimal rendering (9 < 10) would sort wrongly.
    #[test]
    fn test_string_order_matches_segment_order() {
        let a = PostPath::root(seg(9));
        let b = PostPath::root(seg(10));
        let a_reply = a.child(seg(11));

        assert!(a < b);
        assert!(a < a_reply);
        assert!(a_reply < b);
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(PostPath::parse("000000001000000002").is_ok());
        assert!(PostPath::parse("").is_err());
        assert!(PostPath::parse("12345").is_err());
        assert!(PostPath::parse("00000000a").is_err());
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let first = allocate(conn).unwrap();
        let second = allocate(conn).unwrap();
        let third = allocate(conn).unwrap();

        assert_eq!(first.as_raw(), 1);
        assert!(first < second && second < third);
        assert_eq!(current(conn).unwrap(), 3);
    }

    #[test]
    fn test_allocate_reports_exhaustion() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        conn.execute(
            "UPDATE path_counter SET value = ?1 WHERE id = 0",
            [MAX_SEGMENT as i64],
        )
        .unwrap();

        assert!(matches!(
            allocate(conn),
            Err(Error::PathSpaceExhausted(_))
        ));
    }
}
