//! Generation-partitioned response storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use super::http::Response;
use crate::cache::{format_datetime, parse_datetime, MemoryStorage, SqliteStorage, StorageError};

/// A captured response stored under a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
  pub cache_key: String,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Storage backend for the resource cache.
pub trait ResourceStore: Send + Sync {
  /// All stored generation names, sorted.
  fn generations(&self) -> Result<Vec<String>, StorageError>;

  /// Drop a generation and every entry in it. Returns whether it existed.
  fn delete_generation(&self, name: &str) -> Result<bool, StorageError>;

  /// Store or overwrite a response, creating the generation if needed.
  fn put(&self, generation: &str, cache_key: &str, response: &Response)
    -> Result<(), StorageError>;

  /// Store every response or none of them, creating the generation if needed.
  fn put_batch(&self, generation: &str, entries: &[(String, Response)])
    -> Result<(), StorageError>;

  fn lookup(&self, generation: &str, cache_key: &str)
    -> Result<Option<ResourceEntry>, StorageError>;

  fn evict(&self, generation: &str, cache_key: &str) -> Result<bool, StorageError>;

  fn entry_count(&self, generation: &str) -> Result<usize, StorageError>;
}

impl ResourceStore for SqliteStorage {
  fn generations(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_generations ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool, StorageError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM resource_cache WHERE generation = ?",
      params![name],
    )?;
    let removed = tx.execute("DELETE FROM cache_generations WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn put(
    &self,
    generation: &str,
    cache_key: &str,
    response: &Response,
  ) -> Result<(), StorageError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    insert_response(&tx, generation, cache_key, response)?;
    tx.commit()?;
    Ok(())
  }

  fn put_batch(
    &self,
    generation: &str,
    entries: &[(String, Response)],
  ) -> Result<(), StorageError> {
    let mut conn = self.conn()?;
    // Dropping the transaction on error rolls back every earlier insert
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)",
      params![generation, format_datetime(Utc::now())],
    )?;
    for (cache_key, response) in entries {
      insert_response(&tx, generation, cache_key, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn lookup(
    &self,
    generation: &str,
    cache_key: &str,
  ) -> Result<Option<ResourceEntry>, StorageError> {
    let conn = self.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM resource_cache
         WHERE generation = ? AND cache_key = ?",
        params![generation, cache_key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    match row {
      Some((url, status, headers, body, cached_at)) => Ok(Some(ResourceEntry {
        cache_key: cache_key.to_string(),
        response: Response {
          url,
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn evict(&self, generation: &str, cache_key: &str) -> Result<bool, StorageError> {
    let conn = self.conn()?;
    let removed = conn.execute(
      "DELETE FROM resource_cache WHERE generation = ? AND cache_key = ?",
      params![generation, cache_key],
    )?;
    Ok(removed > 0)
  }

  fn entry_count(&self, generation: &str) -> Result<usize, StorageError> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM resource_cache WHERE generation = ?",
      params![generation],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

fn insert_response(
  tx: &Transaction<'_>,
  generation: &str,
  cache_key: &str,
  response: &Response,
) -> Result<(), StorageError> {
  let headers = serde_json::to_string(&response.headers)?;
  let now = format_datetime(Utc::now());

  tx.execute(
    "INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)",
    params![generation, now],
  )?;
  tx.execute(
    "INSERT OR REPLACE INTO resource_cache (generation, cache_key, url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?)",
    params![
      generation,
      cache_key,
      response.url,
      response.status,
      headers,
      response.body,
      now
    ],
  )?;
  Ok(())
}

impl ResourceStore for MemoryStorage {
  fn generations(&self) -> Result<Vec<String>, StorageError> {
    Ok(self.state()?.generations.keys().cloned().collect())
  }

  fn delete_generation(&self, name: &str) -> Result<bool, StorageError> {
    Ok(self.state()?.generations.remove(name).is_some())
  }

  fn put(
    &self,
    generation: &str,
    cache_key: &str,
    response: &Response,
  ) -> Result<(), StorageError> {
    self
      .state()?
      .generations
      .entry(generation.to_string())
      .or_default()
      .insert(
        cache_key.to_string(),
        ResourceEntry {
          cache_key: cache_key.to_string(),
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    Ok(())
  }

  fn put_batch(
    &self,
    generation: &str,
    entries: &[(String, Response)],
  ) -> Result<(), StorageError> {
    let now = Utc::now();
    let mut state = self.state()?;
    let stored = state.generations.entry(generation.to_string()).or_default();
    for (cache_key, response) in entries {
      stored.insert(
        cache_key.clone(),
        ResourceEntry {
          cache_key: cache_key.clone(),
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn lookup(
    &self,
    generation: &str,
    cache_key: &str,
  ) -> Result<Option<ResourceEntry>, StorageError> {
    Ok(
      self
        .state()?
        .generations
        .get(generation)
        .and_then(|entries| entries.get(cache_key))
        .cloned(),
    )
  }

  fn evict(&self, generation: &str, cache_key: &str) -> Result<bool, StorageError> {
    Ok(
      self
        .state()?
        .generations
        .get_mut(generation)
        .map_or(false, |entries| entries.remove(cache_key).is_some()),
    )
  }

  fn entry_count(&self, generation: &str) -> Result<usize, StorageError> {
    Ok(
      self
        .state()?
        .generations
        .get(generation)
        .map_or(0, |entries| entries.len()),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(body: &str) -> Response {
    Response {
      url: "https://topcenter.example/favicon.ico".to_string(),
      status: 200,
      headers: vec![("content-type".to_string(), "image/x-icon".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  fn exercise_store(store: &dyn ResourceStore) {
    let key = "GET https://topcenter.example/favicon.ico";
    assert!(store.generations().unwrap().is_empty());

    // An empty batch still creates the generation, once
    store.put_batch("topcenter-cache-v1", &[]).unwrap();
    store.put_batch("topcenter-cache-v1", &[]).unwrap();
    assert_eq!(store.generations().unwrap(), vec!["topcenter-cache-v1"]);

    store.put("topcenter-cache-v1", key, &response("old")).unwrap();
    store.put("topcenter-cache-v1", key, &response("new")).unwrap();
    let entry = store.lookup("topcenter-cache-v1", key).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
    assert_eq!(entry.response.header("Content-Type"), Some("image/x-icon"));
    assert_eq!(store.entry_count("topcenter-cache-v1").unwrap(), 1);

    // put creates the generation on demand
    store.put("topcenter-cache-v2", key, &response("v2")).unwrap();
    assert_eq!(
      store.generations().unwrap(),
      vec!["topcenter-cache-v1", "topcenter-cache-v2"]
    );

    assert!(store.delete_generation("topcenter-cache-v1").unwrap());
    assert!(!store.delete_generation("topcenter-cache-v1").unwrap());
    assert!(store.lookup("topcenter-cache-v1", key).unwrap().is_none());
    assert_eq!(store.entry_count("topcenter-cache-v1").unwrap(), 0);

    assert!(store.evict("topcenter-cache-v2", key).unwrap());
    assert!(!store.evict("topcenter-cache-v2", key).unwrap());
    assert!(store.lookup("topcenter-cache-v2", key).unwrap().is_none());
  }

  #[test]
  fn test_batch_is_all_or_nothing() {
    let store = SqliteStorage::in_memory().unwrap();
    let favicon = "GET https://topcenter.example/favicon.ico";
    let offline = "GET https://topcenter.example/offline.html";
    store.put("topcenter-cache-v1", favicon, &response("old")).unwrap();

    store
      .conn()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_offline BEFORE INSERT ON resource_cache
         WHEN NEW.cache_key LIKE '%offline.html'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
      )
      .unwrap();

    let batch = vec![
      (favicon.to_string(), response("new")),
      (offline.to_string(), response("offline")),
    ];
    assert!(store.put_batch("topcenter-cache-v1", &batch).is_err());
    assert!(store.put_batch("topcenter-cache-v2", &batch).is_err());

    let kept = store.lookup("topcenter-cache-v1", favicon).unwrap().unwrap();
    assert_eq!(kept.response.body, b"old");
    assert!(store.lookup("topcenter-cache-v1", offline).unwrap().is_none());
    assert_eq!(store.generations().unwrap(), vec!["topcenter-cache-v1"]);
  }

  #[test]
  fn test_memory_batch_creates_generation() {
    let store = MemoryStorage::new();
    let batch = vec![
      ("GET https://topcenter.example/".to_string(), response("home")),
      ("GET https://topcenter.example/favicon.ico".to_string(), response("icon")),
    ];
    store.put_batch("topcenter-cache-v1", &batch).unwrap();

    assert_eq!(store.generations().unwrap(), vec!["topcenter-cache-v1"]);
    assert_eq!(store.entry_count("topcenter-cache-v1").unwrap(), 2);
  }

  #[test]
  fn test_sqlite_resource_store() {
    let store = SqliteStorage::in_memory().unwrap();
    exercise_store(&store);
  }

  #[test]
  fn test_memory_resource_store() {
    let store = MemoryStorage::new();
    exercise_store(&store);
  }
}
