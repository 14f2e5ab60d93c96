//! Error types for the query and resource caches.

use std::sync::Arc;
use thiserror::Error;

use crate::resource::FetchError;

/// Errors raised by the persistent stores.
#[derive(Debug, Error)]
pub enum StorageError {
  /// SQLite rejected the statement.
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  /// Stored payload could not be encoded or decoded.
  #[error("failed to encode cached payload: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A stored timestamp did not parse.
  #[error("invalid timestamp '{0}' in cache")]
  Timestamp(String),

  /// The store ran out of room for new records.
  #[error("storage quota exceeded ({limit} records)")]
  QuotaExceeded { limit: usize },

  /// Preparing the on-disk location failed.
  #[error("failed to prepare cache directory: {0}")]
  Io(#[from] std::io::Error),

  #[error("could not determine data directory")]
  NoDataDir,

  #[error("storage lock poisoned")]
  Poisoned,
}

/// Errors surfaced to callers of the caches.
///
/// Cloneable so that callers attached to one in-flight fetch can all
/// receive the same outcome.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// Offline, nothing cached, no fallback supplied.
  #[error("network unavailable and nothing cached for {key}")]
  Unavailable { key: String },

  /// Online fetch used up its retry budget and nothing was cached.
  #[error("fetch for {key} failed after {attempts} attempt(s): {message}")]
  FetchFailed {
    key: String,
    attempts: u32,
    message: String,
  },

  /// The store refused a write. Never fatal to the query itself.
  #[error("failed to persist {key}: {source}")]
  CacheWriteFailed {
    key: String,
    #[source]
    source: Arc<StorageError>,
  },

  /// A manifest asset could not be pre-cached during install.
  #[error("failed to pre-cache {url}: {reason}")]
  ManifestFetchFailed { url: String, reason: String },

  /// Activation was attempted before the manifest was pre-cached.
  #[error("resource cache {version} is not installed")]
  NotInstalled { version: String },

  /// Network request failed and no cached response exists.
  #[error(transparent)]
  Network(Arc<FetchError>),

  /// The caller abandoned the query before it resolved.
  #[error("query was cancelled")]
  Cancelled,

  #[error("cached value for {key} has an unexpected shape: {message}")]
  Serialization { key: String, message: String },

  #[error(transparent)]
  Storage(Arc<StorageError>),
}

impl From<StorageError> for CacheError {
  fn from(err: StorageError) -> Self {
    CacheError::Storage(Arc::new(err))
  }
}

impl From<FetchError> for CacheError {
  fn from(err: FetchError) -> Self {
    CacheError::Network(Arc::new(err))
  }
}
