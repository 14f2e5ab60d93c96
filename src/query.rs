//! Pollable handle around a single cached query.
//!
//! A `Query<T>` owns one key, one fetcher and one set of options. Fetches run
//! on the runtime and the result is picked up with `poll()`, so a caller's
//! event loop never blocks on the network.
//!
//! # Example
//!
//! ```ignore
//! let http = fetcher.clone();
//! let mut query = Query::new(
//!   cache.clone(),
//!   QueryKey::new(["team-members"]),
//!   move || {
//!     let http = http.clone();
//!     async move { http.get_json::<Vec<TeamMember>>("/api/team").await }
//!   },
//!   cache.options(),
//! );
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!   match query.state() {
//!     QueryState::Success(result) => render(&result.data, result.source),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle | QueryState::Loading => {}
//!   }
//! }
//! ```

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, KeyValueStore, QueryCache, QueryKey, QueryOptions, QueryState};

/// Starts one resolution of the query, bound to a cancellation token.
type RunnerFn<T> = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, QueryState<T>> + Send + Sync>;

/// Async query with loading, success and error states.
///
/// Dropping the handle, or calling `refetch()`, cancels the pending
/// resolution. A cancelled fetch that no other caller shares never reaches
/// storage.
pub struct Query<T> {
  key: QueryKey,
  state: QueryState<T>,
  runner: RunnerFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<QueryState<T>>>,
  pending: Option<CancellationToken>,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  pub fn new<S, F, Fut>(cache: QueryCache<S>, key: QueryKey, fetcher: F, options: QueryOptions<T>) -> Self
  where
    S: KeyValueStore + 'static,
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let query_key = key.clone();
    let runner = move |token: CancellationToken| {
      let cache = cache.clone();
      let key = query_key.clone();
      let fetcher = fetcher.clone();
      let options = options.clone().with_cancel(token);
      async move { cache.query(&key, fetcher, options).await }.boxed()
    };

    Self {
      key,
      state: QueryState::Idle,
      runner: Box::new(runner),
      receiver: None,
      pending: None,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&CacheError> {
    self.state.error()
  }

  pub fn is_stale(&self) -> bool {
    self.state.is_stale()
  }

  /// Start resolving unless a resolution is already pending.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Cancel any pending resolution and start a new one.
  pub fn refetch(&mut self) {
    self.cancel_pending();
    self.start_fetch();
  }

  /// Pick up the result of a pending resolution.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(state) => {
        self.state = state;
        self.receiver = None;
        self.pending = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Task ended without reporting back
        self.state = QueryState::Error(CacheError::Cancelled);
        self.receiver = None;
        self.pending = None;
        true
      }
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    self.receiver = Some(rx);
    self.pending = Some(token.clone());
    self.state = QueryState::Loading;

    let future = (self.runner)(token);
    tokio::spawn(async move {
      let state = future.await;
      // Receiver is gone after refetch or drop
      let _ = tx.send(state);
    });
  }

  fn cancel_pending(&mut self) {
    if let Some(token) = self.pending.take() {
      token.cancel();
    }
    self.receiver = None;
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    if let Some(token) = self.pending.take() {
      token.cancel();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("pending", &self.pending.is_some())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::network::NetworkMonitor;
  use color_eyre::{eyre::eyre, Report};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn cache(online: bool) -> QueryCache<MemoryStorage> {
    QueryCache::new(Arc::new(MemoryStorage::new()), NetworkMonitor::new(online))
  }

  #[tokio::test]
  async fn test_query_success() {
    let cache = cache(true);
    let mut query = Query::new(
      cache.clone(),
      QueryKey::new(["numbers"]),
      || async { Ok::<_, Report>(vec![1, 2, 3]) },
      cache.options(),
    );

    assert!(query.state().is_idle());

    query.fetch();
    assert!(query.is_loading());

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(query.poll());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
    assert!(!query.is_stale());
    match query.state() {
      QueryState::Success(result) => assert_eq!(result.source, CacheSource::Network),
      other => panic!("expected success, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_query_error() {
    let cache = cache(true);
    let mut query: Query<i32> = Query::new(
      cache.clone(),
      QueryKey::new(["broken"]),
      || async { Err::<i32, _>(eyre!("Something went wrong")) },
      cache.options().with_retry(0),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(query.poll());
    match query.error() {
      Some(CacheError::FetchFailed { attempts, message, .. }) => {
        assert_eq!(*attempts, 1);
        assert!(message.contains("Something went wrong"));
      }
      other => panic!("expected fetch failure, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_query_serves_fallback() {
    let cache = cache(false);
    let mut query = Query::new(
      cache.clone(),
      QueryKey::new(["team-members"]),
      || async { Ok::<_, Report>(vec!["Ana".to_string()]) },
      cache.options().with_offline_fallback(Vec::<String>::new()),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(query.poll());
    assert_eq!(query.data(), Some(&Vec::new()));
    assert!(query.is_stale());
  }

  #[tokio::test]
  async fn test_fetch_while_loading_is_noop() {
    let cache = cache(true);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut query = Query::new(
      cache.clone(),
      QueryKey::new(["slow"]),
      move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok::<_, Report>(42)
        }
      },
      cache.options(),
    );

    query.fetch();
    query.fetch();
    assert!(query.is_loading());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refetch_cancels_pending() {
    let cache = cache(true);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let mut query = Query::new(
      cache.clone(),
      QueryKey::new(["counter"]),
      move || {
        let counter = Arc::clone(&counter);
        async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok::<_, Report>(counter.fetch_add(1, Ordering::SeqCst))
        }
      },
      cache.options(),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    query.refetch();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(query.poll());
    // The first fetch was dropped before it could count
    assert_eq!(query.data(), Some(&0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_dropping_pending_query_skips_store_write() {
    let cache = cache(true);
    let key = QueryKey::new(["dropped"]);
    let mut query = Query::new(
      cache.clone(),
      key.clone(),
      || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, Report>("late".to_string())
      },
      cache.options(),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(query);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(cache.peek::<String>(&key).unwrap().is_none());
  }
}
