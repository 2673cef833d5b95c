//! # Runtime Configuration
//!
//! [`ForumConfig`] collects everything needed to open a [`ForumDb`](crate::ForumDb):
//! the database file, the reader pool size, group-commit tuning and the
//! per-request deadline.
//!
//! ## Environment
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `FORUMDB_PATH` | `db_path` | `forum.db` |
//! | `FORUMDB_READERS` | `reader_threads` | CPU count, clamped to 1..=16 |
//! | `FORUMDB_BATCH_TIMEOUT_MS` | `writer.batch_timeout` | 2 |
//! | `FORUMDB_REQUEST_TIMEOUT_MS` | `request_timeout` | none |
//!
//! Unset or empty variables keep the default; anything unparsable is an
//! `Error::InvalidParameter`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::writer::WriterConfig;

pub const ENV_PATH: &str = "FORUMDB_PATH";
pub const ENV_READERS: &str = "FORUMDB_READERS";
pub const ENV_BATCH_TIMEOUT_MS: &str = "FORUMDB_BATCH_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "FORUMDB_REQUEST_TIMEOUT_MS";

const DEFAULT_DB_PATH: &str = "forum.db";

/// Settings for opening a ForumDB instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForumConfig {
    /// SQLite database file. Created if missing.
    pub db_path: PathBuf,

    /// Reader pool size. `None` sizes the pool from the CPU count.
    pub reader_threads: Option<usize>,

    /// Group-commit tuning for the writer thread.
    pub writer: WriterConfig,

    /// How long a caller waits for a worker before giving up.
    pub request_timeout: Option<Duration>,
}

impl Default for ForumConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            reader_threads: None,
            writer: WriterConfig::default(),
            request_timeout: None,
        }
    }
}

impl ForumConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn reader_threads(mut self, count: usize) -> Self {
        self.reader_threads = Some(count);
        self
    }

    pub fn batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.writer.batch_timeout = batch_timeout;
        self
    }

    pub fn batch_max_size(mut self, batch_max_size: usize) -> Self {
        self.writer.batch_max_size = batch_max_size;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    /// Reads the configuration from `FORUMDB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = var(ENV_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = var(ENV_READERS) {
            let count = parse_number(ENV_READERS, &raw)?;
            if count == 0 {
                return Err(Error::InvalidParameter {
                    name: ENV_READERS.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.reader_threads = Some(count as usize);
        }
        if let Some(raw) = var(ENV_BATCH_TIMEOUT_MS) {
            config.writer.batch_timeout = Duration::from_millis(parse_number(ENV_BATCH_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = var(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout = Some(Duration::from_millis(parse_number(
                ENV_REQUEST_TIMEOUT_MS,
                &raw,
            )?));
        }

        Ok(config)
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse().map_err(|_| Error::InvalidParameter {
        name: name.to_string(),
        reason: format!("'{raw}' is not a non-negative integer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ForumConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ForumConfig::default());
        assert_eq!(config.writer.batch_timeout, Duration::from_millis(2));
    }

    #[test]
    fn test_reads_every_variable() {
        let config = ForumConfig::from_lookup(lookup(&[
            (ENV_PATH, "/tmp/forum.db"),
            (ENV_READERS, "4"),
            (ENV_BATCH_TIMEOUT_MS, "5"),
            (ENV_REQUEST_TIMEOUT_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/forum.db"));
        assert_eq!(config.reader_threads, Some(4));
        assert_eq!(config.writer.batch_timeout, Duration::from_millis(5));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = ForumConfig::from_lookup(lookup(&[(ENV_READERS, "many")])).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == ENV_READERS));

        assert!(ForumConfig::from_lookup(lookup(&[(ENV_READERS, "0")])).is_err());
        assert!(ForumConfig::from_lookup(lookup(&[(ENV_REQUEST_TIMEOUT_MS, "-1")])).is_err());
    }

    #[test]
    fn test_builder() {
        let config = ForumConfig::new("x.db")
            .reader_threads(2)
            .batch_max_size(8)
            .request_timeout(Duration::from_secs(1));
        assert_eq!(config.reader_threads, Some(2));
        assert_eq!(config.writer.batch_max_size, 8);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(1)));
    }
}
