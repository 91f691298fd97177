//! Single-flight sync cycle: drain, send one batch, clear on success.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::monitor::Connectivity;
use crate::server::{idempotency_key, GatehouseApi, SyncBatch, SyncResponse};
use crate::store::{OfflineStore, Watermark};

/// Where the current cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
  Sending,
  Clearing,
}

/// What a finished cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  /// Records sent and cleared
  pub sent: usize,
  /// Server answer; `None` when there was nothing to send
  pub response: Option<SyncResponse>,
}

/// Result of one sync request, shared by every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// No connectivity; the server was not contacted
  Deferred,
  Synced(SyncReport),
  Failed(SyncError),
}

impl SyncOutcome {
  #[cfg(test)]
  pub fn is_success(&self) -> bool {
    matches!(self, SyncOutcome::Synced(_))
  }

  pub fn synced_records(&self) -> usize {
    match self {
      SyncOutcome::Synced(report) => report.sent,
      _ => 0,
    }
  }
}

type CycleFuture = Shared<BoxFuture<'static, SyncOutcome>>;

/// A spawned cycle plus a flag raised as soon as its outcome is known.
struct Inflight {
  cycle: CycleFuture,
  done: Arc<AtomicBool>,
}

struct Inner<A> {
  store: Arc<OfflineStore>,
  api: Arc<A>,
  connectivity: Connectivity,
  state: watch::Sender<SyncState>,
  /// The running cycle, if any; later triggers join it until it is done
  inflight: Mutex<Option<Inflight>>,
  /// Records the server accepted but we failed to clear
  unconfirmed: Mutex<Option<Watermark>>,
}

/// Drives sync cycles against the portal. Cheap to clone.
pub struct SyncEngine<A: GatehouseApi> {
  inner: Arc<Inner<A>>,
}

impl<A: GatehouseApi> Clone for SyncEngine<A> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<A: GatehouseApi> SyncEngine<A> {
  pub fn new(store: Arc<OfflineStore>, api: Arc<A>, connectivity: Connectivity) -> Self {
    let (state, _) = watch::channel(SyncState::Idle);
    Self {
      inner: Arc::new(Inner {
        store,
        api,
        connectivity,
        state,
        inflight: Mutex::new(None),
        unconfirmed: Mutex::new(None),
      }),
    }
  }

  #[cfg(test)]
  pub fn state(&self) -> SyncState {
    *self.inner.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
    self.inner.state.subscribe()
  }

  /// Run a sync cycle, or join the one already running.
  ///
  /// Overlapping calls never issue a second server request: they all resolve
  /// to the outcome of the cycle in flight. A cycle whose outcome is already
  /// known is never joined, so a call always covers records captured before it.
  pub async fn sync(&self) -> SyncOutcome {
    if !self.inner.connectivity.is_online() {
      info!("still offline, sync deferred");
      return SyncOutcome::Deferred;
    }

    let cycle = {
      let mut inflight = self.inner.inflight.lock().await;
      match inflight.as_ref() {
        Some(running) if !running.done.load(Ordering::Acquire) => {
          debug!("sync already running, joining it");
          running.cycle.clone()
        }
        _ => {
          let done = Arc::new(AtomicBool::new(false));
          let engine = self.clone();
          let finished = Arc::clone(&done);
          // Spawned so the cycle finishes even if every caller goes away
          let handle = tokio::spawn(async move {
            let outcome = engine.run_cycle().await;
            finished.store(true, Ordering::Release);

            let mut inflight = engine.inner.inflight.lock().await;
            // A newer cycle may already have replaced this one
            if inflight
              .as_ref()
              .is_some_and(|running| Arc::ptr_eq(&running.done, &finished))
            {
              *inflight = None;
            }
            outcome
          });
          let cycle = handle
            .map(|joined| {
              joined.unwrap_or_else(|e| SyncOutcome::Failed(SyncError::Storage(e.to_string())))
            })
            .boxed()
            .shared();
          *inflight = Some(Inflight {
            cycle: cycle.clone(),
            done,
          });
          cycle
        }
      }
    };

    cycle.await
  }

  fn set_state(&self, state: SyncState) {
    self.inner.state.send_replace(state);
  }

  async fn run_cycle(&self) -> SyncOutcome {
    let outcome = self.cycle_steps().await;
    self.set_state(SyncState::Idle);
    outcome
  }

  async fn cycle_steps(&self) -> SyncOutcome {
    if let Err(e) = self.finish_unconfirmed_clear().await {
      return SyncOutcome::Failed(e);
    }

    self.set_state(SyncState::Draining);
    let snapshot = match self.inner.store.drain_all() {
      Ok(snapshot) => snapshot,
      Err(e) => {
        error!(error = %e, "failed to read pending records");
        return SyncOutcome::Failed(SyncError::Storage(e.to_string()));
      }
    };

    if snapshot.is_empty() {
      info!("nothing to sync");
      return SyncOutcome::Synced(SyncReport {
        sent: 0,
        response: None,
      });
    }

    self.set_state(SyncState::Sending);
    let batch = SyncBatch::from_snapshot(&snapshot);
    let key = idempotency_key(&snapshot);
    info!(
      visitors = batch.visitors.len(),
      packages = batch.packages.len(),
      requests = batch.requests.len(),
      "syncing pending records"
    );

    let response = match self.inner.api.submit_batch(&batch, &key).await {
      Ok(response) => response,
      Err(e) => {
        warn!(error = %e, "sync failed, records kept for retry");
        return SyncOutcome::Failed(e);
      }
    };

    self.set_state(SyncState::Clearing);
    let watermark = snapshot.watermark();
    if let Err(e) = self.inner.store.clear_through(&watermark) {
      error!(error = %e, "server accepted batch but local clear failed");
      *self.inner.unconfirmed.lock().await = Some(watermark);
      return SyncOutcome::Failed(SyncError::ClearFailed(e.to_string()));
    }

    info!(
      sent = batch.len(),
      created = response.total_created(),
      operator = %response.operator,
      "sync complete"
    );
    SyncOutcome::Synced(SyncReport {
      sent: batch.len(),
      response: Some(response),
    })
  }

  /// Clear records a previous cycle got accepted but could not delete,
  /// before anything is drained again.
  async fn finish_unconfirmed_clear(&self) -> Result<(), SyncError> {
    let mut unconfirmed = self.inner.unconfirmed.lock().await;
    if let Some(watermark) = *unconfirmed {
      self.set_state(SyncState::Clearing);
      match self.inner.store.clear_through(&watermark) {
        Ok(removed) => {
          info!(removed, "cleared records accepted by an earlier sync");
          *unconfirmed = None;
        }
        Err(e) => {
          error!(error = %e, "still unable to clear accepted records");
          return Err(SyncError::ClearFailed(e.to_string()));
        }
      }
    }
    Ok(())
  }
}
