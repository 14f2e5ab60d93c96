//! Offline-aware query cache that orchestrates caching logic with network fetching.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::storage::{KeyValueStore, StoredRecord};
use super::traits::{CacheResult, QueryKey, QueryState};
use crate::network::NetworkMonitor;

type FetchOutcome = std::result::Result<Value, CacheError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Defaults applied to every query unless overridden per call.
#[derive(Debug, Clone)]
pub struct QueryConfig {
  /// Minimum age before cached data triggers a refetch
  pub stale_time: Duration,
  /// Retries after the first failed attempt
  pub retry: u32,
  /// Upper bound for a single fetch attempt
  pub timeout: Option<Duration>,
  /// Attach concurrent callers for the same key to one fetch
  pub dedupe: bool,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      retry: 1,
      timeout: None,
      dedupe: true,
    }
  }
}

/// Per-call options for [`QueryCache::query`].
#[derive(Debug, Clone)]
pub struct QueryOptions<T> {
  pub stale_time: Duration,
  pub retry: u32,
  /// When false the query does not run and resolves to `Idle`
  pub enabled: bool,
  /// Served, marked stale, when nothing is cached and the network is unavailable
  pub offline_fallback: Option<T>,
  pub timeout: Option<Duration>,
  pub cancel: Option<CancellationToken>,
  pub dedupe: bool,
}

impl<T> Default for QueryOptions<T> {
  fn default() -> Self {
    Self::from(&QueryConfig::default())
  }
}

impl<T> From<&QueryConfig> for QueryOptions<T> {
  fn from(config: &QueryConfig) -> Self {
    Self {
      stale_time: config.stale_time,
      retry: config.retry,
      enabled: true,
      offline_fallback: None,
      timeout: config.timeout,
      cancel: None,
      dedupe: config.dedupe,
    }
  }
}

impl<T> QueryOptions<T> {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = retry;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_offline_fallback(mut self, value: T) -> Self {
    self.offline_fallback = Some(value);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_cancel(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }

  pub fn with_dedupe(mut self, dedupe: bool) -> Self {
    self.dedupe = dedupe;
    self
  }
}

/// The parts of [`QueryOptions`] that govern the network fetch itself.
struct FetchPolicy {
  retry: u32,
  timeout: Option<Duration>,
  dedupe: bool,
  cancel: Option<CancellationToken>,
}

/// Query cache that serves the freshest available value and degrades to
/// cached data when the network is unavailable or failing.
pub struct QueryCache<S: KeyValueStore> {
  storage: Arc<S>,
  network: NetworkMonitor,
  config: QueryConfig,
  /// Fetches currently running, keyed by cache hash
  in_flight: Arc<Mutex<HashMap<String, WeakShared<BoxFuture<'static, FetchOutcome>>>>>,
}

impl<S: KeyValueStore + 'static> QueryCache<S> {
  pub fn new(storage: Arc<S>, network: NetworkMonitor) -> Self {
    Self {
      storage,
      network,
      config: QueryConfig::default(),
      in_flight: Arc::default(),
    }
  }

  pub fn with_config(mut self, config: QueryConfig) -> Self {
    self.config = config;
    self
  }

  /// Options seeded from this cache's configuration.
  pub fn options<T>(&self) -> QueryOptions<T> {
    QueryOptions::from(&self.config)
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.network
  }

  /// Resolve `key`, calling `fetcher` only when the cache cannot answer.
  ///
  /// 1. Disabled queries resolve to `Idle` without touching anything
  /// 2. Offline: serve the stored value (always stale), else the fallback
  /// 3. Online with a fresh record: serve it without fetching
  /// 4. Otherwise fetch with retries, persisting the value on success
  /// 5. If every attempt fails, degrade as in step 2
  pub async fn query<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: QueryOptions<T>,
  ) -> QueryState<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if !options.enabled {
      debug!(%key, "query disabled");
      return QueryState::Idle;
    }

    match self.resolve(key, fetcher, options).await {
      Ok(result) => QueryState::Success(result),
      Err(e) => QueryState::Error(e),
    }
  }

  async fn resolve<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: QueryOptions<T>,
  ) -> std::result::Result<CacheResult<T>, CacheError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let QueryOptions {
      stale_time,
      retry,
      offline_fallback,
      timeout,
      cancel,
      dedupe,
      ..
    } = options;
    let hash = key.cache_hash();
    let cached = self.read_cached::<T>(key, &hash);

    if !self.network.is_online() {
      debug!(%key, cached = cached.is_some(), "offline, skipping network");
      return degrade(cached, offline_fallback).ok_or_else(|| CacheError::Unavailable {
        key: key.to_string(),
      });
    }

    let cached = match cached {
      Some((data, cached_at)) if is_fresh(cached_at, stale_time) => {
        debug!(%key, "cache fresh");
        return Ok(CacheResult::from_cache(data, cached_at, false));
      }
      other => other,
    };

    let policy = FetchPolicy {
      retry,
      timeout,
      dedupe,
      cancel,
    };
    let outcome = self.fetch_shared(key, &hash, fetcher, &policy).await;

    match outcome {
      Ok(value) => serde_json::from_value(value)
        .map(CacheResult::from_network)
        .map_err(|e| CacheError::Serialization {
          key: key.to_string(),
          message: e.to_string(),
        }),
      Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
      Err(err) => match degrade(cached, offline_fallback) {
        Some(result) => {
          warn!(%key, error = %err, "fetch failed, serving cached data");
          Ok(result)
        }
        None => Err(err),
      },
    }
  }

  /// Run the fetch, attaching to an identical in-flight fetch when allowed.
  async fn fetch_shared<T, F, Fut>(
    &self,
    key: &QueryKey,
    hash: &str,
    fetcher: F,
    options: &FetchPolicy,
  ) -> FetchOutcome
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let start = || {
      run_fetch(
        Arc::clone(&self.storage),
        key.clone(),
        hash.to_string(),
        fetcher,
        options.retry,
        options.timeout,
      )
      .boxed()
      .shared()
    };

    let fetch = if options.dedupe {
      let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      match in_flight.get(hash).and_then(WeakShared::upgrade) {
        Some(existing) => {
          debug!(%key, "joining in-flight fetch");
          existing
        }
        None => {
          let fetch = start();
          if let Some(weak) = fetch.downgrade() {
            in_flight.insert(hash.to_string(), weak);
          }
          fetch
        }
      }
    } else {
      start()
    };

    let outcome = match &options.cancel {
      Some(token) => {
        tokio::select! {
          biased;
          _ = token.cancelled() => {
            debug!(%key, "query cancelled by caller");
            Err(CacheError::Cancelled)
          }
          outcome = fetch.clone() => outcome,
        }
      }
      None => fetch.clone().await,
    };

    if options.dedupe {
      self.release(hash, fetch);
    }

    outcome
  }

  /// Clear the in-flight slot once its fetch has completed or been abandoned.
  fn release(&self, hash: &str, fetch: SharedFetch) {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    let ours = in_flight
      .get(hash)
      .and_then(WeakShared::upgrade)
      .map_or(false, |current| current.ptr_eq(&fetch));
    let finished = fetch.peek().is_some();

    // Dropping the last handle drops the unfinished fetch with it
    drop(fetch);
    let abandoned = in_flight
      .get(hash)
      .map_or(false, |weak| weak.upgrade().is_none());

    if (ours && finished) || abandoned {
      in_flight.remove(hash);
    }
  }

  /// Read and decode the stored record. Unreadable records count as misses.
  fn read_cached<T: DeserializeOwned>(
    &self,
    key: &QueryKey,
    hash: &str,
  ) -> Option<(T, DateTime<Utc>)> {
    let record = match self.storage.get(hash) {
      Ok(record) => record?,
      Err(e) => {
        warn!(%key, error = %e, "failed to read cached value");
        return None;
      }
    };

    match serde_json::from_value(record.value) {
      Ok(data) => Some((data, record.cached_at)),
      Err(e) => {
        warn!(%key, error = %e, "cached value does not match the requested type");
        None
      }
    }
  }

  /// Read the stored value without going to the network.
  pub fn peek<T: DeserializeOwned>(
    &self,
    key: &QueryKey,
  ) -> std::result::Result<Option<CacheResult<T>>, CacheError> {
    let Some(record) = self.storage.get(&key.cache_hash())? else {
      return Ok(None);
    };

    let data = serde_json::from_value(record.value).map_err(|e| CacheError::Serialization {
      key: key.to_string(),
      message: e.to_string(),
    })?;
    let stale = !is_fresh(record.cached_at, self.config.stale_time);

    Ok(Some(CacheResult::from_cache(data, record.cached_at, stale)))
  }

  /// Drop the stored value for `key`.
  pub fn invalidate(&self, key: &QueryKey) -> std::result::Result<bool, CacheError> {
    let removed = self.storage.delete(&key.cache_hash())?;
    if removed {
      info!(%key, "invalidated cached query");
    }
    Ok(removed)
  }

  /// Drop every stored value.
  pub fn clear(&self) -> std::result::Result<usize, CacheError> {
    let removed = self.storage.clear()?;
    info!(removed, "cleared query cache");
    Ok(removed)
  }

  pub fn records(&self) -> std::result::Result<Vec<(String, StoredRecord)>, CacheError> {
    Ok(self.storage.entries()?)
  }
}

impl<S: KeyValueStore> Clone for QueryCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: self.network.clone(),
      config: self.config.clone(),
      in_flight: Arc::clone(&self.in_flight),
    }
  }
}

/// Attempt the fetch `retry + 1` times, persisting the first success.
async fn run_fetch<S, T, F, Fut>(
  storage: Arc<S>,
  key: QueryKey,
  hash: String,
  fetcher: F,
  retry: u32,
  timeout: Option<Duration>,
) -> FetchOutcome
where
  S: KeyValueStore,
  T: Serialize,
  F: Fn() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let started_at = Utc::now();
  let attempts = retry.saturating_add(1);
  let mut last_error = String::new();

  for attempt in 1..=attempts {
    let result = match timeout {
      Some(limit) => match tokio::time::timeout(limit, fetcher()).await {
        Ok(result) => result,
        Err(_) => Err(eyre!("timed out after {:?}", limit)),
      },
      None => fetcher().await,
    };

    match result {
      Ok(data) => {
        let value = serde_json::to_value(&data).map_err(|e| CacheError::Serialization {
          key: key.to_string(),
          message: e.to_string(),
        })?;
        persist(&*storage, &key, &hash, &value, started_at);
        debug!(%key, attempt, "fetched from network");
        return Ok(value);
      }
      Err(e) => {
        last_error = e
          .chain()
          .map(|cause| cause.to_string())
          .collect::<Vec<_>>()
          .join(": ");
        debug!(%key, attempt, attempts, error = %last_error, "fetch attempt failed");
      }
    }
  }

  Err(CacheError::FetchFailed {
    key: key.to_string(),
    attempts,
    message: last_error,
  })
}

/// Write-through. Failures are logged and swallowed.
///
/// Records are stamped with the start of the fetch that produced them, so a
/// fetch started later always wins regardless of which one resolves first.
fn persist<S: KeyValueStore + ?Sized>(
  storage: &S,
  key: &QueryKey,
  hash: &str,
  value: &Value,
  started_at: DateTime<Utc>,
) {
  if let Ok(Some(existing)) = storage.get(hash) {
    if existing.cached_at > started_at {
      debug!(%key, "value from a later fetch already stored, skipping write");
      return;
    }
  }

  let record = StoredRecord {
    value: value.clone(),
    cached_at: started_at,
    description: key.to_string(),
  };

  if let Err(e) = storage.set(hash, &record) {
    let err = CacheError::CacheWriteFailed {
      key: key.to_string(),
      source: Arc::new(e),
    };
    warn!(error = %err, "cache write failed, returning uncached value");
  }
}

/// Serve the last cached value, else the caller's fallback, both marked stale.
fn degrade<T>(cached: Option<(T, DateTime<Utc>)>, fallback: Option<T>) -> Option<CacheResult<T>> {
  match (cached, fallback) {
    (Some((data, cached_at)), _) => Some(CacheResult::offline(data, cached_at)),
    (None, Some(data)) => Some(CacheResult::fallback(data)),
    (None, None) => None,
  }
}

fn is_fresh(cached_at: DateTime<Utc>, stale_time: Duration) -> bool {
  let age = (Utc::now() - cached_at).to_std().unwrap_or(Duration::ZERO);
  age < stale_time
}
