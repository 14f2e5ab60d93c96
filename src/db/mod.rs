pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cache::StorageError;

/// SQLite connection with the cache schema applied
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self, StorageError> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    debug!(path = %path.display(), "opening cache database");
    let conn = Connection::open(path)?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf, StorageError> {
    Ok(data_dir()?.join("cache.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<(), StorageError> {
    self.conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  pub fn into_connection(self) -> Connection {
    self.conn
  }
}

/// Per-user data directory for the cache database and logs.
pub fn data_dir() -> Result<PathBuf, StorageError> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or(StorageError::NoDataDir)?;

  Ok(data_dir.join("tcache"))
}
