//! Process-wide connectivity state.
//!
//! The caches only read this. It is written by whatever listens for
//! connectivity changes: the probe task below, or the CLI's `--offline` switch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

/// Shared online/offline flag with change notifications.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a connectivity change. Returns whether the state flipped.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "network state changed");
    }
    changed
  }

  /// Receiver that wakes on every online/offline transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Poll `url` with HEAD requests, marking the network offline whenever the
  /// request cannot complete. Any HTTP status counts as online.
  pub fn spawn_probe(&self, client: reqwest::Client, url: Url, interval: Duration) -> JoinHandle<()> {
    let monitor = self.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let online = match client.head(url.clone()).send().await {
          Ok(_) => true,
          Err(e) => {
            debug!(error = %e, "connectivity probe failed");
            false
          }
        };
        monitor.set_online(online);
      }
    })
  }
}

impl Default for NetworkMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_online_reports_transitions_only() {
    let monitor = NetworkMonitor::new(true);
    assert!(monitor.is_online());

    assert!(!monitor.set_online(true));
    assert!(monitor.set_online(false));
    assert!(!monitor.is_online());
  }

  #[test]
  fn test_clones_share_state() {
    let monitor = NetworkMonitor::default();
    let other = monitor.clone();

    other.set_online(false);
    assert!(!monitor.is_online());
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let monitor = NetworkMonitor::new(true);
    let mut rx = monitor.subscribe();

    monitor.set_online(false);
    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }

  #[tokio::test]
  async fn test_probe_marks_unreachable_host_offline() {
    let monitor = NetworkMonitor::new(true);
    let mut rx = monitor.subscribe();
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(200))
      .build()
      .unwrap();
    // Port 9 on localhost is the discard service, closed on any sane machine
    let url = Url::parse("http://127.0.0.1:9/").unwrap();

    let probe = monitor.spawn_probe(client, url, Duration::from_millis(10));
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
      .await
      .unwrap()
      .unwrap();
    probe.abort();

    assert!(!monitor.is_online());
  }
}
