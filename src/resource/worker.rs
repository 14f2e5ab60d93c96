//! Network-first resource cache with generational eviction.

use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::http::{Fetcher, Request, Response};
use super::store::ResourceStore;
use crate::cache::CacheError;

/// Lifecycle of the resource cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Not installed; requests go straight to the network
  Idle,
  /// Pre-caching the manifest
  Installing,
  /// Manifest cached, waiting for activation
  Installed,
  /// Purging old generations
  Activating,
  /// Intercepting requests
  Active,
}

/// Serves requests network-first, falling back to the current generation.
pub struct ResourceCache<S: ResourceStore, F: Fetcher> {
  store: Arc<S>,
  fetcher: Arc<F>,
  /// Current generation tag
  version: String,
  /// Critical assets pre-cached on install
  manifest: Vec<Url>,
  state: Mutex<WorkerState>,
}

impl<S: ResourceStore, F: Fetcher> ResourceCache<S, F> {
  pub fn new(store: Arc<S>, fetcher: Arc<F>, version: impl Into<String>, manifest: Vec<Url>) -> Self {
    Self {
      store,
      fetcher,
      version: version.into(),
      manifest,
      state: Mutex::new(WorkerState::Idle),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    debug!(?state, version = %self.version, "resource cache state");
  }

  /// Pre-cache every manifest asset into the current generation.
  ///
  /// All-or-nothing: if any asset fails to fetch, is not a 200, or cannot be
  /// stored, the store is left exactly as it was.
  pub async fn install(&self) -> Result<usize, CacheError> {
    self.set_state(WorkerState::Installing);
    info!(version = %self.version, assets = self.manifest.len(), "installing resource cache");

    match self.precache().await {
      Ok(count) => {
        self.set_state(WorkerState::Installed);
        info!(version = %self.version, count, "resource cache installed");
        Ok(count)
      }
      Err(e) => {
        self.set_state(WorkerState::Idle);
        warn!(version = %self.version, error = %e, "resource cache install failed");
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize, CacheError> {
    let requests: Vec<Request> = self.manifest.iter().cloned().map(Request::get).collect();

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response =
        self
          .fetcher
          .fetch(request)
          .await
          .map_err(|e| CacheError::ManifestFetchFailed {
            url: request.url.to_string(),
            reason: e.to_string(),
          })?;

      if !response.is_cacheable() {
        return Err(CacheError::ManifestFetchFailed {
          url: request.url.to_string(),
          reason: format!("unexpected status {}", response.status),
        });
      }
      Ok::<_, CacheError>(response)
    }))
    .await?;

    let entries: Vec<(String, Response)> = requests
      .iter()
      .map(Request::cache_key)
      .zip(responses)
      .collect();
    self.store.put_batch(&self.version, &entries)?;

    Ok(entries.len())
  }

  /// Whether every manifest asset is present in the current generation.
  pub fn is_installed(&self) -> Result<bool, CacheError> {
    if !self.store.generations()?.contains(&self.version) {
      return Ok(false);
    }
    for url in &self.manifest {
      let key = Request::get(url.clone()).cache_key();
      if self.store.lookup(&self.version, &key)?.is_none() {
        debug!(%key, version = %self.version, "manifest asset missing");
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Delete every generation other than the current one and start intercepting.
  ///
  /// Only an installed generation can be activated, either by this instance
  /// or by an earlier install into the same store. Returns the generations
  /// that were purged.
  pub fn activate(&self) -> Result<Vec<String>, CacheError> {
    let previous = self.state();
    if !matches!(previous, WorkerState::Installed | WorkerState::Active) && !self.is_installed()? {
      warn!(version = %self.version, state = ?previous, "refusing to activate before install");
      return Err(CacheError::NotInstalled {
        version: self.version.clone(),
      });
    }

    self.set_state(WorkerState::Activating);

    let purged = match self.purge_old_generations() {
      Ok(purged) => purged,
      Err(e) => {
        self.set_state(previous);
        return Err(e);
      }
    };

    self.set_state(WorkerState::Active);
    info!(version = %self.version, purged = ?purged, "resource cache active");
    Ok(purged)
  }

  fn purge_old_generations(&self) -> Result<Vec<String>, CacheError> {
    let mut purged = Vec::new();
    for name in self.store.generations()? {
      if name != self.version && self.store.delete_generation(&name)? {
        debug!(generation = %name, "purged stale cache generation");
        purged.push(name);
      }
    }
    Ok(purged)
  }

  /// Install (unless the manifest is already stored) and activate.
  pub async fn start(&self) -> Result<Vec<String>, CacheError> {
    if self.is_installed()? {
      self.set_state(WorkerState::Installed);
    } else {
      self.install().await?;
    }
    self.activate()
  }

  /// Serve one request.
  ///
  /// Network first. A 200 GET response is stored under the current generation
  /// before being returned; any other response is returned as-is. If the
  /// network fails, the stored response is served, else the network error
  /// propagates.
  pub async fn handle(&self, request: &Request) -> Result<Response, CacheError> {
    if self.state() != WorkerState::Active || !request.method.is_cacheable() {
      debug!(method = %request.method, url = %request.url, "passing through");
      return Ok(self.fetcher.fetch(request).await?);
    }

    let key = request.cache_key();

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          if let Err(e) = self.store.put(&self.version, &key, &response) {
            warn!(%key, error = %e, "failed to store response");
          }
        }
        Ok(response)
      }
      Err(network_err) => match self.store.lookup(&self.version, &key) {
        Ok(Some(entry)) => {
          info!(%key, error = %network_err, "network failed, serving cached response");
          Ok(entry.response)
        }
        Ok(None) => Err(network_err.into()),
        Err(e) => {
          warn!(%key, error = %e, "cache lookup failed");
          Err(network_err.into())
        }
      },
    }
  }

  /// Remove one stored response from the current generation.
  pub fn evict(&self, request: &Request) -> Result<bool, CacheError> {
    let removed = self.store.evict(&self.version, &request.cache_key())?;
    if removed {
      info!(key = %request.cache_key(), "evicted cached response");
    }
    Ok(removed)
  }

  /// Stored generations with their entry counts.
  pub fn generations(&self) -> Result<Vec<(String, usize)>, CacheError> {
    self
      .store
      .generations()?
      .into_iter()
      .map(|name| {
        let count = self.store.entry_count(&name)?;
        Ok::<_, CacheError>((name, count))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::resource::http::{FetchError, Method};
  use futures::future::{BoxFuture, FutureExt};
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  const ORIGIN: &str = "https://topcenter.example";

  /// Scripted network: serves configured bodies, or fails everything when down.
  #[derive(Default)]
  struct FakeNetwork {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    down: AtomicBool,
    calls: AtomicU32,
  }

  impl FakeNetwork {
    fn route(&self, path: &str, status: u16, body: &str) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url(path).to_string(), (status, body.as_bytes().to_vec()));
    }

    fn set_down(&self, down: bool) {
      self.down.store(down, Ordering::SeqCst);
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Fetcher for FakeNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = if self.down.load(Ordering::SeqCst) {
        Err(FetchError::Disconnected {
          url: request.url.to_string(),
        })
      } else {
        let (status, body) = self
          .routes
          .lock()
          .unwrap()
          .get(request.url.as_str())
          .cloned()
          .unwrap_or((404, Vec::new()));
        Ok(Response {
          url: request.url.to_string(),
          status,
          headers: Vec::new(),
          body,
        })
      };
      async move { result }.boxed()
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn manifest() -> Vec<Url> {
    ["/", "/favicon.ico", "/offline.html", "/sounds/notification.mp3"]
      .iter()
      .map(|p| url(p))
      .collect()
  }

  fn network_with_manifest() -> Arc<FakeNetwork> {
    let network = Arc::new(FakeNetwork::default());
    network.route("/", 200, "<html>home</html>");
    network.route("/favicon.ico", 200, "icon-v1");
    network.route("/offline.html", 200, "<html>offline</html>");
    network.route("/sounds/notification.mp3", 200, "ding");
    network
  }

  fn cache(
    store: &Arc<MemoryStorage>,
    network: &Arc<FakeNetwork>,
    version: &str,
  ) -> ResourceCache<MemoryStorage, FakeNetwork> {
    ResourceCache::new(Arc::clone(store), Arc::clone(network), version, manifest())
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");

    assert_eq!(worker.install().await.unwrap(), 4);
    assert_eq!(worker.state(), WorkerState::Installed);
    assert_eq!(
      worker.generations().unwrap(),
      vec![("topcenter-cache-v1".to_string(), 4)]
    );
  }

  #[tokio::test]
  async fn test_install_failure_leaves_no_partial_generation() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    network.route("/sounds/notification.mp3", 404, "");
    let worker = cache(&store, &network, "topcenter-cache-v1");

    let err = worker.install().await.unwrap_err();

    match err {
      CacheError::ManifestFetchFailed { url, .. } => assert!(url.ends_with("notification.mp3")),
      other => panic!("expected ManifestFetchFailed, got {:?}", other),
    }
    assert_eq!(worker.state(), WorkerState::Idle);
    assert!(store.generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_fails_when_network_down() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    network.set_down(true);
    let worker = cache(&store, &network, "topcenter-cache-v1");

    assert!(matches!(
      worker.install().await,
      Err(CacheError::ManifestFetchFailed { .. })
    ));
  }

  #[tokio::test]
  async fn test_network_failure_serves_cached_response() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    network.set_down(true);
    let response = worker.handle(&Request::get(url("/favicon.ico"))).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"icon-v1");
  }

  #[tokio::test]
  async fn test_network_failure_without_cache_propagates() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    network.set_down(true);
    let err = worker
      .handle(&Request::get(url("/api/articles")))
      .await
      .unwrap_err();

    assert!(matches!(err, CacheError::Network(_)));
  }

  #[tokio::test]
  async fn test_network_first_refreshes_cached_entry() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    network.route("/favicon.ico", 200, "icon-v2");
    let response = worker.handle(&Request::get(url("/favicon.ico"))).await.unwrap();
    assert_eq!(response.body, b"icon-v2");

    let key = Request::get(url("/favicon.ico")).cache_key();
    let stored = store.lookup("topcenter-cache-v1", &key).unwrap().unwrap();
    assert_eq!(stored.response.body, b"icon-v2");
  }

  #[tokio::test]
  async fn test_non_200_responses_are_returned_but_not_stored() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    network.route("/blog/missing", 404, "not found");
    let response = worker.handle(&Request::get(url("/blog/missing"))).await.unwrap();
    assert_eq!(response.status, 404);

    let key = Request::get(url("/blog/missing")).cache_key();
    assert!(store.lookup("topcenter-cache-v1", &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_non_get_requests_bypass_cache() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    network.route("/api/contact", 200, "ok");
    let post = Request::new(Method::Post, url("/api/contact"));
    worker.handle(&post).await.unwrap();
    assert!(store
      .lookup("topcenter-cache-v1", &post.cache_key())
      .unwrap()
      .is_none());

    network.set_down(true);
    assert!(worker.handle(&post).await.is_err());
  }

  #[tokio::test]
  async fn test_requests_pass_through_before_activation() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.install().await.unwrap();

    network.route("/team", 200, "team");
    worker.handle(&Request::get(url("/team"))).await.unwrap();

    let key = Request::get(url("/team")).cache_key();
    assert!(store.lookup("topcenter-cache-v1", &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_activation_purges_other_generations() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let v1 = cache(&store, &network, "topcenter-cache-v1");
    v1.start().await.unwrap();

    let v2 = cache(&store, &network, "topcenter-cache-v2");
    v2.install().await.unwrap();
    assert_eq!(store.generations().unwrap().len(), 2);

    let purged = v2.activate().unwrap();

    assert_eq!(purged, vec!["topcenter-cache-v1".to_string()]);
    assert_eq!(store.generations().unwrap(), vec!["topcenter-cache-v2"]);
    let key = Request::get(url("/favicon.ico")).cache_key();
    assert!(store.lookup("topcenter-cache-v1", &key).unwrap().is_none());
    assert_eq!(v2.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_request_after_version_bump_hits_network() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    cache(&store, &network, "topcenter-cache-v1")
      .start()
      .await
      .unwrap();

    let v2 = cache(&store, &network, "topcenter-cache-v2");
    v2.start().await.unwrap();
    let before = network.calls();

    network.route("/favicon.ico", 200, "icon-v2");
    let response = v2.handle(&Request::get(url("/favicon.ico"))).await.unwrap();

    assert_eq!(network.calls(), before + 1);
    assert_eq!(response.body, b"icon-v2");
  }

  #[tokio::test]
  async fn test_start_skips_install_when_generation_exists() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    cache(&store, &network, "topcenter-cache-v1")
      .start()
      .await
      .unwrap();
    let before = network.calls();

    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    assert_eq!(network.calls(), before);
    assert_eq!(worker.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");

    let err = worker.activate().unwrap_err();

    assert!(matches!(err, CacheError::NotInstalled { .. }));
    assert_eq!(worker.state(), WorkerState::Idle);
    assert!(store.generations().unwrap().is_empty());

    let next = cache(&store, &network, "topcenter-cache-v1");
    next.start().await.unwrap();
    assert_eq!(
      next.generations().unwrap(),
      vec![("topcenter-cache-v1".to_string(), 4)]
    );
    assert_eq!(next.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_activate_accepts_install_from_another_instance() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    cache(&store, &network, "topcenter-cache-v1")
      .install()
      .await
      .unwrap();

    let worker = cache(&store, &network, "topcenter-cache-v1");
    assert!(worker.is_installed().unwrap());
    worker.activate().unwrap();
    assert_eq!(worker.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_start_reinstalls_incomplete_generation() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let first = cache(&store, &network, "topcenter-cache-v1");
    first.start().await.unwrap();
    first.evict(&Request::get(url("/offline.html"))).unwrap();
    let before = network.calls();

    let worker = cache(&store, &network, "topcenter-cache-v1");
    assert!(!worker.is_installed().unwrap());
    worker.start().await.unwrap();

    assert_eq!(network.calls(), before + 4);
    assert!(worker.is_installed().unwrap());
  }

  #[tokio::test]
  async fn test_failed_store_write_keeps_previous_install() {
    let store = Arc::new(crate::cache::SqliteStorage::in_memory().unwrap());
    let network = network_with_manifest();
    let worker = ResourceCache::new(
      Arc::clone(&store),
      Arc::clone(&network),
      "topcenter-cache-v1",
      manifest(),
    );
    worker.install().await.unwrap();

    store
      .conn()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_sounds BEFORE INSERT ON resource_cache
         WHEN NEW.cache_key LIKE '%notification.mp3'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
      )
      .unwrap();
    network.route("/favicon.ico", 200, "icon-v2");

    assert!(matches!(worker.install().await, Err(CacheError::Storage(_))));
    assert_eq!(worker.state(), WorkerState::Idle);

    let key = Request::get(url("/favicon.ico")).cache_key();
    let kept = store.lookup("topcenter-cache-v1", &key).unwrap().unwrap();
    assert_eq!(kept.response.body, b"icon-v1");
    assert!(worker.is_installed().unwrap());
  }

  #[tokio::test]
  async fn test_evict_removes_entry() {
    let store = Arc::new(MemoryStorage::new());
    let network = network_with_manifest();
    let worker = cache(&store, &network, "topcenter-cache-v1");
    worker.start().await.unwrap();

    let request = Request::get(url("/favicon.ico"));
    assert!(worker.evict(&request).unwrap());
    assert!(!worker.evict(&request).unwrap());

    network.set_down(true);
    assert!(worker.handle(&request).await.is_err());
  }
}
