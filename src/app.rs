//! Wiring of the offline engine for the command-line front end.

use color_eyre::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clients::{ClientHub, ClientMessage};
use crate::config::Config;
use crate::error::{Severity, UiSignal};
use crate::monitor::{spawn_probe, Connectivity, Event, EventHandler, ReachabilityProbe, Trigger};
use crate::server::HttpApi;
use crate::store::OfflineStore;
use crate::sync::{SyncEngine, SyncState};

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Durable store shared with the sync engine
  store: Arc<OfflineStore>,

  /// Portal client
  api: Arc<HttpApi>,

  clients: ClientHub,
  connectivity: Connectivity,
}

impl App {
  /// Open the store and build the portal client. Starts out offline until probed.
  pub fn new(config: Config) -> Result<Self> {
    let store = Arc::new(OfflineStore::open(&config.database_path()?)?);
    let api = Arc::new(HttpApi::new(&config.server)?);

    Ok(Self {
      config,
      store,
      api,
      clients: ClientHub::new(),
      connectivity: Connectivity::new(false),
    })
  }

  pub fn store(&self) -> &OfflineStore {
    &self.store
  }

  pub fn api(&self) -> &HttpApi {
    &self.api
  }

  /// Close the store. Later store calls fail.
  pub fn close(&self) -> Result<()> {
    self.store.close()
  }

  /// Probe the portal once and record the answer.
  pub async fn probe(&self) -> bool {
    let online = self.api.is_reachable().await;
    self.connectivity.set_online(online);
    online
  }

  /// Build a trigger whose signals are logged by a presenter task.
  ///
  /// The presenter finishes once every clone of the trigger is dropped.
  pub fn trigger(&self) -> (Trigger<HttpApi>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let presenter = tokio::spawn(present(rx));

    let engine = SyncEngine::new(
      Arc::clone(&self.store),
      Arc::clone(&self.api),
      self.connectivity.clone(),
    );
    let trigger = Trigger::new(
      engine,
      Arc::clone(&self.store),
      Arc::clone(&self.api),
      self.connectivity.clone(),
      self.clients.clone(),
      tx,
      self.config.monitor.clone(),
    );
    (trigger, presenter)
  }

  /// Watch connectivity and sync on every transition until Ctrl-C.
  ///
  /// Stdin lines drive the operator side: `sync` requests a manual sync,
  /// `hide` and `show` track whether a page is on screen.
  pub async fn run(&self) -> Result<()> {
    self.probe().await;

    let (trigger, presenter) = self.trigger();
    let mut events = EventHandler::new(&self.connectivity);

    let probe = spawn_probe(
      Arc::clone(&self.api),
      self.connectivity.clone(),
      self.config.monitor.probe_interval(),
    );
    let client_log = spawn_client_log(self.clients.subscribe());
    let state_log = spawn_state_log(trigger.sync_state());
    let input = spawn_input(events.sender());

    let shutdown = events.sender();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown.send(Event::Shutdown);
      }
    });

    trigger.startup().await;
    info!(server = %self.config.server.url, "monitoring; type 'sync' to sync now, Ctrl-C to stop");
    trigger.run(&mut events).await;

    probe.abort();
    client_log.abort();
    state_log.abort();
    input.abort();
    presenter.abort();
    info!("monitor stopped");
    self.close()
  }
}

/// Log every signal meant for the operator.
async fn present(mut rx: mpsc::UnboundedReceiver<UiSignal>) {
  while let Some(signal) = rx.recv().await {
    match signal {
      UiSignal::Notice {
        severity: Severity::Danger,
        kind,
        message,
      } => error!(?kind, "{}", message),
      UiSignal::Notice {
        severity: Severity::Warning,
        message,
        ..
      } => warn!("{}", message),
      UiSignal::Notice { message, .. } => info!("{}", message),
      UiSignal::PendingCount(count) => info!(pending = count, "pending records"),
      UiSignal::Connectivity { online } => info!(online, "connectivity"),
    }
  }
}

fn spawn_client_log(mut rx: broadcast::Receiver<ClientMessage>) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      match rx.recv().await {
        Ok(message) => info!(?message, "client message"),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "client messages dropped")
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  })
}

fn spawn_state_log(mut states: watch::Receiver<SyncState>) -> JoinHandle<()> {
  tokio::spawn(async move {
    while states.changed().await.is_ok() {
      let state = *states.borrow_and_update();
      debug!(?state, "sync state");
    }
  })
}

fn spawn_input(events: mpsc::UnboundedSender<Event>) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      let Some(event) = parse_input(&line) else {
        continue;
      };
      if events.send(event).is_err() {
        break;
      }
    }
  })
}

/// Operator command typed on stdin.
fn parse_input(line: &str) -> Option<Event> {
  match line.trim().to_ascii_lowercase().as_str() {
    "sync" => Some(Event::ManualSync),
    "hide" => Some(Event::Visible(false)),
    "show" => Some(Event::Visible(true)),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_input() {
    assert_eq!(parse_input(" SYNC\n"), Some(Event::ManualSync));
    assert_eq!(parse_input("hide"), Some(Event::Visible(false)));
    assert_eq!(parse_input("show"), Some(Event::Visible(true)));
    assert_eq!(parse_input("reload"), None);
  }
}
