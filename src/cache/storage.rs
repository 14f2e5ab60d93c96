//! Key-value store trait and its SQLite and in-memory implementations.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::error::StorageError;
use crate::db::Database;
use crate::resource::ResourceEntry;

/// A persisted query value.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  /// Last successfully fetched value
  pub value: Value,
  /// When the fetch that produced it started
  pub cached_at: DateTime<Utc>,
  /// Readable form of the query key
  pub description: String,
}

/// Persistent key-value store backing the query cache.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<StoredRecord>, StorageError>;

  /// Insert or overwrite the record for `key`.
  fn set(&self, key: &str, record: &StoredRecord) -> Result<(), StorageError>;

  /// Returns whether a record existed.
  fn delete(&self, key: &str) -> Result<bool, StorageError>;

  /// Remove every record, returning how many were dropped.
  fn clear(&self) -> Result<usize, StorageError>;

  /// All records, newest first.
  fn entries(&self) -> Result<Vec<(String, StoredRecord)>, StorageError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  /// Open the database at the default location.
  pub fn open() -> Result<Self, StorageError> {
    Ok(Self::new(Database::open_default()?))
  }

  pub fn in_memory() -> Result<Self, StorageError> {
    Ok(Self::new(Database::open_in_memory()?))
  }

  pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::Poisoned)
  }
}

impl KeyValueStore for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<StoredRecord>, StorageError> {
    let conn = self.conn()?;

    let row: Option<(Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT data, cached_at, query_description FROM query_cache WHERE query_hash = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((data, cached_at, description)) => Ok(Some(StoredRecord {
        value: serde_json::from_slice(&data)?,
        cached_at: parse_datetime(&cached_at)?,
        description,
      })),
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, record: &StoredRecord) -> Result<(), StorageError> {
    let conn = self.conn()?;
    let data = serde_json::to_vec(&record.value)?;

    conn.execute(
      "INSERT OR REPLACE INTO query_cache (query_hash, query_description, data, cached_at)
       VALUES (?, ?, ?, ?)",
      params![
        key,
        record.description,
        data,
        format_datetime(record.cached_at)
      ],
    )?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.conn()?;
    let removed = conn.execute("DELETE FROM query_cache WHERE query_hash = ?", params![key])?;
    Ok(removed > 0)
  }

  fn clear(&self) -> Result<usize, StorageError> {
    let conn = self.conn()?;
    Ok(conn.execute("DELETE FROM query_cache", [])?)
  }

  fn entries(&self) -> Result<Vec<(String, StoredRecord)>, StorageError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT query_hash, data, cached_at, query_description FROM query_cache
       ORDER BY cached_at DESC",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Vec<u8>>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(key, data, cached_at, description)| {
        Ok((
          key,
          StoredRecord {
            value: serde_json::from_slice(&data)?,
            cached_at: parse_datetime(&cached_at)?,
            description,
          },
        ))
      })
      .collect()
  }
}

#[derive(Default)]
pub(crate) struct MemoryState {
  pub(crate) records: HashMap<String, StoredRecord>,
  pub(crate) generations: BTreeMap<String, HashMap<String, ResourceEntry>>,
}

/// In-memory store for ephemeral runs and tests.
///
/// An optional record limit makes writes fail once reached, the way a
/// browser store fails when its quota is exhausted.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
  max_records: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(max_records: usize) -> Self {
    Self {
      state: Mutex::default(),
      max_records: Some(max_records),
    }
  }

  pub(crate) fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
    self.state.lock().map_err(|_| StorageError::Poisoned)
  }
}

impl KeyValueStore for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<StoredRecord>, StorageError> {
    Ok(self.state()?.records.get(key).cloned())
  }

  fn set(&self, key: &str, record: &StoredRecord) -> Result<(), StorageError> {
    let mut state = self.state()?;
    if let Some(limit) = self.max_records {
      if !state.records.contains_key(key) && state.records.len() >= limit {
        return Err(StorageError::QuotaExceeded { limit });
      }
    }
    state.records.insert(key.to_string(), record.clone());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    Ok(self.state()?.records.remove(key).is_some())
  }

  fn clear(&self) -> Result<usize, StorageError> {
    let mut state = self.state()?;
    let count = state.records.len();
    state.records.clear();
    Ok(count)
  }

  fn entries(&self) -> Result<Vec<(String, StoredRecord)>, StorageError> {
    let mut entries: Vec<_> = self
      .state()?
      .records
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    entries.sort_by(|a, b| b.1.cached_at.cmp(&a.1.cached_at));
    Ok(entries)
  }
}

/// Timestamps are stored as RFC 3339 with millisecond precision.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| StorageError::Timestamp(s.to_string()))
}
