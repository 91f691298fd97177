//! Decides when sync runs and what the operator is told about it.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clients::{ClientHub, ClientMessage};
use crate::config::MonitorConfig;
use crate::error::{FailureKind, Severity, UiSignal};
use crate::server::GatehouseApi;
use crate::store::{OfflineStore, PendingPayload};
use crate::sync::{SyncEngine, SyncOutcome, SyncState};

use super::event::{Event, EventHandler};
use super::Connectivity;

/// Glue between connectivity, the sync engine and the presentation feed.
pub struct Trigger<A: GatehouseApi> {
  engine: SyncEngine<A>,
  store: Arc<OfflineStore>,
  api: Arc<A>,
  connectivity: Connectivity,
  clients: ClientHub,
  ui: mpsc::UnboundedSender<UiSignal>,
  config: MonitorConfig,
  /// Whether a page is showing; reloads only make sense when one is
  visible: Arc<AtomicBool>,
}

impl<A: GatehouseApi> Clone for Trigger<A> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      store: Arc::clone(&self.store),
      api: Arc::clone(&self.api),
      connectivity: self.connectivity.clone(),
      clients: self.clients.clone(),
      ui: self.ui.clone(),
      config: self.config.clone(),
      visible: Arc::clone(&self.visible),
    }
  }
}

impl<A: GatehouseApi> Trigger<A> {
  pub fn new(
    engine: SyncEngine<A>,
    store: Arc<OfflineStore>,
    api: Arc<A>,
    connectivity: Connectivity,
    clients: ClientHub,
    ui: mpsc::UnboundedSender<UiSignal>,
    config: MonitorConfig,
  ) -> Self {
    Self {
      engine,
      store,
      api,
      connectivity,
      clients,
      ui,
      config,
      visible: Arc::new(AtomicBool::new(true)),
    }
  }

  pub fn set_visible(&self, visible: bool) {
    self.visible.store(visible, Ordering::SeqCst);
  }

  /// Progress of the sync engine, for a "syncing" indicator.
  pub fn sync_state(&self) -> watch::Receiver<SyncState> {
    self.engine.subscribe_state()
  }

  fn signal(&self, signal: UiSignal) {
    // Presentation may be gone during shutdown
    let _ = self.ui.send(signal);
  }

  fn signal_pending(&self) {
    match self.store.count_pending() {
      Ok(count) => self.signal(UiSignal::PendingCount(count)),
      Err(e) => warn!(error = %e, "could not count pending records"),
    }
  }

  /// Store a form submission captured while offline.
  ///
  /// A storage failure is returned to the caller: the submission was not saved.
  pub fn capture(&self, payload: PendingPayload) -> Result<i64> {
    let kind = payload.kind();
    match self.store.enqueue(payload) {
      Ok(temp_id) => {
        self.signal(UiSignal::notice(
          Severity::Warning,
          format!(
            "{} saved offline; it will sync automatically when the connection returns.",
            kind.label()
          ),
        ));
        self.signal_pending();
        Ok(temp_id)
      }
      Err(e) => {
        self.signal(UiSignal::failure(
          FailureKind::Storage,
          format!("The {} was NOT saved: {}", kind.label(), e),
        ));
        Err(e)
      }
    }
  }

  /// Refresh the resident snapshot; failures are logged and ignored.
  pub async fn refresh(&self) {
    if let Err(e) = self.store.refresh_reference_records(self.api.as_ref()).await {
      debug!(error = %e, "keeping previous resident snapshot");
    }
  }

  /// Startup: refresh the snapshot and sync once if records are waiting.
  pub async fn startup(&self) -> Option<SyncOutcome> {
    self.signal(UiSignal::Connectivity {
      online: self.connectivity.is_online(),
    });
    self.signal_pending();

    if !self.connectivity.is_online() {
      return None;
    }

    self.refresh().await;
    let pending = self.store.count_pending().unwrap_or(0);
    if pending == 0 {
      return None;
    }

    info!(pending, "pending records found at startup");
    Some(self.run_sync(self.config.reload_delay()).await)
  }

  /// Sync on operator request.
  pub async fn manual_sync(&self) -> SyncOutcome {
    self.run_sync(self.config.manual_reload_delay()).await
  }

  /// Connectivity came back: wait for the link to settle, then sync.
  pub async fn on_online(&self) -> SyncOutcome {
    info!("connection restored");
    self.signal(UiSignal::Connectivity { online: true });
    tokio::time::sleep(self.config.stabilize_delay()).await;
    self.refresh().await;
    self.run_sync(self.config.reload_delay()).await
  }

  pub fn on_offline(&self) {
    info!("connection lost");
    self.signal(UiSignal::Connectivity { online: false });
    self.signal(UiSignal::notice(
      Severity::Warning,
      "You are offline. Registrations will be stored locally and synced when the connection returns.",
    ));
  }

  async fn run_sync(&self, reload_delay: Duration) -> SyncOutcome {
    let outcome = self.engine.sync().await;
    self.report(&outcome);
    self.signal_pending();

    // A clean cycle, even an empty one, reloads so the page shows server state
    if matches!(outcome, SyncOutcome::Synced(_)) && self.visible.load(Ordering::SeqCst) {
      self.schedule_reload(reload_delay);
    }
    outcome
  }

  fn report(&self, outcome: &SyncOutcome) {
    match outcome {
      SyncOutcome::Deferred => debug!("sync deferred while offline"),
      SyncOutcome::Synced(report) => {
        if let Some(response) = &report.response {
          self.signal(UiSignal::notice(Severity::Success, response.summary()));
        }
      }
      SyncOutcome::Failed(e) => {
        self.signal(UiSignal::failure(
          e.kind(),
          "Sync failed. We will try again soon.",
        ));
      }
    }
  }

  fn schedule_reload(&self, delay: Duration) {
    let clients = self.clients.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      clients.send(ClientMessage::Reload);
    });
  }

  /// Process events until shutdown.
  pub async fn run(&self, events: &mut EventHandler) {
    while let Some(event) = events.next().await {
      match event {
        Event::Online => {
          // Keep the loop responsive while the link settles
          let this = self.clone();
          tokio::spawn(async move {
            this.on_online().await;
          });
        }
        Event::Offline => self.on_offline(),
        Event::Visible(visible) => self.set_visible(visible),
        Event::ManualSync => {
          let this = self.clone();
          tokio::spawn(async move {
            this.manual_sync().await;
          });
        }
        Event::Shutdown => break,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::server::{ResidentsResponse, SyncResponse};
  use crate::store::{Resident, VisitorPayload};
  use crate::sync::testing::FakeApi;

  struct Harness {
    trigger: Trigger<FakeApi>,
    store: Arc<OfflineStore>,
    api: Arc<FakeApi>,
    connectivity: Connectivity,
    clients: ClientHub,
    ui: mpsc::UnboundedReceiver<UiSignal>,
  }

  fn fast_config() -> MonitorConfig {
    MonitorConfig {
      probe_interval_ms: 10,
      stabilize_delay_ms: 5,
      reload_delay_ms: 5,
      manual_reload_delay_ms: 5,
    }
  }

  fn harness(api: FakeApi, online: bool) -> Harness {
    let store = Arc::new(OfflineStore::open_in_memory().unwrap());
    let api = Arc::new(api);
    let connectivity = Connectivity::new(online);
    let clients = ClientHub::new();
    let (tx, ui) = mpsc::unbounded_channel();
    let engine = SyncEngine::new(Arc::clone(&store), Arc::clone(&api), connectivity.clone());
    let trigger = Trigger::new(
      engine,
      Arc::clone(&store),
      Arc::clone(&api),
      connectivity.clone(),
      clients.clone(),
      tx,
      fast_config(),
    );
    Harness {
      trigger,
      store,
      api,
      connectivity,
      clients,
      ui,
    }
  }

  fn visitor(name: &str) -> PendingPayload {
    PendingPayload::Visitor(VisitorPayload {
      full_name: name.into(),
      ..Default::default()
    })
  }

  fn drain(ui: &mut mpsc::UnboundedReceiver<UiSignal>) -> Vec<UiSignal> {
    let mut signals = Vec::new();
    while let Ok(signal) = ui.try_recv() {
      signals.push(signal);
    }
    signals
  }

  #[tokio::test]
  async fn test_capture_signals_pending_count() {
    let mut h = harness(FakeApi::accepting(), false);
    h.trigger.capture(visitor("Ana Silva")).unwrap();

    let signals = drain(&mut h.ui);
    assert!(signals.contains(&UiSignal::PendingCount(1)));
    assert!(matches!(
      signals[0],
      UiSignal::Notice {
        severity: Severity::Warning,
        ..
      }
    ));
  }

  #[tokio::test]
  async fn test_failed_capture_reports_storage_error() {
    let mut h = harness(FakeApi::accepting(), false);
    h.store.close().unwrap();

    assert!(h.trigger.capture(visitor("Ana Silva")).is_err());
    let signals = drain(&mut h.ui);
    assert!(matches!(
      signals.last(),
      Some(UiSignal::Notice {
        kind: Some(FailureKind::Storage),
        ..
      })
    ));
  }

  #[tokio::test]
  async fn test_online_transition_syncs_and_reloads() {
    let mut h = harness(
      FakeApi::accepting().with_response(SyncResponse {
        visitors_created: 1,
        operator: "joao".into(),
        ..Default::default()
      }),
      false,
    );
    let mut client = h.clients.subscribe();
    h.trigger.capture(visitor("Ana Silva")).unwrap();

    h.connectivity.set_online(true);
    let outcome = h.trigger.on_online().await;
    assert_eq!(outcome.synced_records(), 1);
    assert_eq!(h.store.count_pending().unwrap(), 0);

    assert_eq!(client.recv().await.unwrap(), ClientMessage::Reload);
    let signals = drain(&mut h.ui);
    assert!(signals.contains(&UiSignal::notice(
      Severity::Success,
      "Synced! 1 visitor(s) registered by joao."
    )));
    assert_eq!(signals.last(), Some(&UiSignal::PendingCount(0)));
  }

  #[tokio::test]
  async fn test_empty_cycle_still_reloads() {
    let h = harness(FakeApi::accepting(), true);
    let mut client = h.clients.subscribe();

    let outcome = h.trigger.on_online().await;
    assert_eq!(outcome.synced_records(), 0);
    assert_eq!(client.recv().await.unwrap(), ClientMessage::Reload);

    assert_eq!(h.trigger.manual_sync().await.synced_records(), 0);
    assert_eq!(client.recv().await.unwrap(), ClientMessage::Reload);
    assert_eq!(h.api.calls(), 0);
  }

  #[tokio::test]
  async fn test_no_reload_when_hidden_or_failed() {
    let h = harness(FakeApi::failing(SyncError::Network("reset".into())), true);
    let mut client = h.clients.subscribe();
    h.store.enqueue(visitor("Ana Silva")).unwrap();

    assert!(!h.trigger.manual_sync().await.is_success());

    let hidden = harness(FakeApi::accepting(), true);
    let mut hidden_client = hidden.clients.subscribe();
    hidden.trigger.set_visible(false);
    assert!(hidden.trigger.manual_sync().await.is_success());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(client.try_recv().is_err());
    assert!(hidden_client.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_startup_syncs_pending_when_online() {
    let h = harness(
      FakeApi::accepting().with_residents(ResidentsResponse {
        residents: vec![serde_json::from_value::<Resident>(
          serde_json::json!({"id": 1, "nome": "Maria", "apartamento": "3"}),
        )
        .unwrap()],
        operator: "joao".into(),
      }),
      true,
    );
    h.store.enqueue(visitor("Ana Silva")).unwrap();

    let outcome = h.trigger.startup().await;
    assert_eq!(outcome.map(|o| o.synced_records()), Some(1));
    assert_eq!(h.api.calls(), 1);
    assert_eq!(h.store.residents().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_startup_offline_does_nothing() {
    let h = harness(FakeApi::accepting(), false);
    h.store.enqueue(visitor("Ana Silva")).unwrap();

    assert!(h.trigger.startup().await.is_none());
    assert_eq!(h.api.calls(), 0);
    assert_eq!(h.store.count_pending().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failed_sync_signals_transient_failure() {
    let mut h = harness(FakeApi::failing(SyncError::Network("reset".into())), true);
    h.store.enqueue(visitor("Ana Silva")).unwrap();

    assert!(!h.trigger.manual_sync().await.is_success());
    let signals = drain(&mut h.ui);
    assert!(signals.iter().any(|s| matches!(
      s,
      UiSignal::Notice {
        kind: Some(FailureKind::Transient),
        ..
      }
    )));
    assert_eq!(signals.last(), Some(&UiSignal::PendingCount(1)));
  }

  #[tokio::test]
  async fn test_run_loop_handles_events() {
    let h = harness(FakeApi::accepting(), false);
    let mut client = h.clients.subscribe();
    let mut events = EventHandler::new(&h.connectivity);
    let sender = events.sender();
    h.store.enqueue(visitor("Ana Silva")).unwrap();

    let trigger = h.trigger.clone();
    let loop_task = tokio::spawn(async move { trigger.run(&mut events).await });

    h.connectivity.set_online(true);
    assert_eq!(client.recv().await.unwrap(), ClientMessage::Reload);
    assert_eq!(h.api.calls(), 1);

    sender.send(Event::Shutdown).unwrap();
    loop_task.await.unwrap();
  }

  #[tokio::test]
  async fn test_hidden_page_is_not_reloaded() {
    let h = harness(FakeApi::accepting().with_delay(Duration::from_millis(20)), true);
    let mut client = h.clients.subscribe();
    let mut events = EventHandler::new(&h.connectivity);
    let sender = events.sender();
    let mut states = h.trigger.sync_state();

    let trigger = h.trigger.clone();
    let loop_task = tokio::spawn(async move { trigger.run(&mut events).await });

    h.store.enqueue(visitor("Ana Silva")).unwrap();
    sender.send(Event::Visible(false)).unwrap();
    sender.send(Event::ManualSync).unwrap();

    states.wait_for(|s| *s == SyncState::Sending).await.unwrap();
    states.wait_for(|s| *s == SyncState::Idle).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.api.calls(), 1);
    assert!(client.try_recv().is_err());

    sender.send(Event::Shutdown).unwrap();
    loop_task.await.unwrap();
  }
}
