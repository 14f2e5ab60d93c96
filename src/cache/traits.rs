//! Core types for the query cache: keys, results and query states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use super::error::CacheError;

/// One primitive component of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Str(String),
  Int(i64),
  Bool(bool),
}

impl KeyPart {
  fn to_value(&self) -> Value {
    match self {
      KeyPart::Str(s) => Value::String(s.clone()),
      KeyPart::Int(n) => Value::from(*n),
      KeyPart::Bool(b) => Value::Bool(*b),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<i32> for KeyPart {
  fn from(n: i32) -> Self {
    KeyPart::Int(n.into())
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

/// Ordered list of primitives identifying one query, e.g. `["page-content", "about"]`.
///
/// Two keys with the same parts in the same order address the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyPart>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// Canonical JSON form of the key, used for display and hashing.
  pub fn canonical(&self) -> String {
    Value::Array(self.0.iter().map(KeyPart::to_value).collect()).to_string()
  }

  /// SHA256 of the canonical form, giving stable fixed-length store keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical())
  }
}

/// A resolved query value with its provenance.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Start of the fetch that stored it; `None` for network and fallback values
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Value the fetcher just returned.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Stored value served while online, fresh or past its stale time.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because the network is down or the fetch failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Caller-supplied default served when nothing is cached.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }

  pub fn is_stale(&self) -> bool {
    matches!(
      self.source,
      CacheSource::CacheStale | CacheSource::Offline | CacheSource::Fallback
    )
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, past its stale time
  CacheStale,
  /// Network unavailable or failing, serving cached data
  Offline,
  /// Nothing cached, serving the caller's offline fallback
  Fallback,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "fresh",
      CacheSource::CacheStale => "stale",
      CacheSource::Offline => "offline",
      CacheSource::Fallback => "fallback",
    }
  }
}

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query is disabled or has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query resolved with data, possibly stale
  Success(CacheResult<T>),
  /// Nothing could be served
  Error(CacheError),
}

impl<T> QueryState<T> {
  pub fn is_idle(&self) -> bool {
    matches!(self, QueryState::Idle)
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  /// True when the served data is older than its stale time or came from an offline path.
  pub fn is_stale(&self) -> bool {
    match self {
      QueryState::Success(result) => result.is_stale(),
      _ => false,
    }
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(result) => Some(&result.data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&CacheError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }

  /// Collapse into a `Result`, yielding `None` for idle or loading states.
  pub fn into_result(self) -> Result<Option<CacheResult<T>>, CacheError> {
    match self {
      QueryState::Success(result) => Ok(Some(result)),
      QueryState::Error(e) => Err(e),
      QueryState::Idle | QueryState::Loading => Ok(None),
    }
  }
}
