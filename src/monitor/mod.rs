//! Connectivity tracking and the triggers that decide when sync runs.

mod event;
mod trigger;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub use event::{Event, EventHandler};
pub use trigger::Trigger;

/// Shared online/offline flag.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Tells whether the portal can be reached right now.
pub trait ReachabilityProbe: Send + Sync + 'static {
  fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// Probe the portal periodically and feed the result into `connectivity`.
pub fn spawn_probe<P: ReachabilityProbe>(
  probe: Arc<P>,
  connectivity: Connectivity,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let online = probe.is_reachable().await;
      if connectivity.set_online(online) {
        info!(online, "connectivity changed");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct Switch(AtomicBool);

  impl ReachabilityProbe for Switch {
    async fn is_reachable(&self) -> bool {
      self.0.load(Ordering::SeqCst)
    }
  }

  #[test]
  fn test_set_online_reports_changes() {
    let connectivity = Connectivity::new(false);
    assert!(!connectivity.set_online(false));
    assert!(connectivity.set_online(true));
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn test_probe_feeds_connectivity() {
    let probe = Arc::new(Switch(AtomicBool::new(true)));
    let connectivity = Connectivity::new(false);
    let mut changes = connectivity.subscribe();

    let task = spawn_probe(Arc::clone(&probe), connectivity.clone(), Duration::from_millis(5));
    changes.wait_for(|online| *online).await.unwrap();

    probe.0.store(false, Ordering::SeqCst);
    changes.wait_for(|online| !*online).await.unwrap();
    task.abort();
  }
}
