//! Offline-aware query caching for data persistence and offline support.
//!
//! This module wraps any async fetch with:
//! - Staleness tracking (fresh records short-circuit the network)
//! - Write-through persistence of every successful fetch
//! - Immediate retries, then fallback to the last stored value
//! - Offline mode (serve stored or fallback data without touching the network)
//! - Coalescing of concurrent fetches for the same key, with cancellation

mod error;
mod layer;
mod storage;
mod traits;

pub use error::{CacheError, StorageError};
pub use layer::{QueryCache, QueryConfig, QueryOptions};
pub use storage::{KeyValueStore, MemoryStorage, SqliteStorage, StoredRecord};
pub use traits::{CacheResult, CacheSource, KeyPart, QueryKey, QueryState};

pub(crate) use storage::{format_datetime, parse_datetime};
