//! In-process portal double for sync and monitor tests.

use color_eyre::{eyre::eyre, Result};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::SyncError;
use crate::server::{GatehouseApi, ResidentsResponse, SyncBatch, SyncResponse};

type SubmitHook = Box<dyn Fn() + Send + Sync>;

/// Records every batch it receives and answers with a fixed result.
pub struct FakeApi {
  result: std::result::Result<SyncResponse, SyncError>,
  residents: Option<ResidentsResponse>,
  delay: Duration,
  on_submit: Option<SubmitHook>,
  received: Mutex<Vec<(SyncBatch, String)>>,
}

impl FakeApi {
  pub fn accepting() -> Self {
    Self {
      result: Ok(SyncResponse::default()),
      residents: None,
      delay: Duration::ZERO,
      on_submit: None,
      received: Mutex::new(Vec::new()),
    }
  }

  pub fn failing(error: SyncError) -> Self {
    Self {
      result: Err(error),
      ..Self::accepting()
    }
  }

  /// Answer every batch with this raw 2xx body.
  pub fn answering(body: &str) -> Self {
    Self {
      result: SyncResponse::from_body(body.as_bytes()),
      ..Self::accepting()
    }
  }

  pub fn with_response(mut self, response: SyncResponse) -> Self {
    self.result = Ok(response);
    self
  }

  pub fn with_residents(mut self, residents: ResidentsResponse) -> Self {
    self.residents = Some(residents);
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Run `hook` while the batch is "on the wire".
  pub fn on_submit(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_submit = Some(Box::new(hook));
    self
  }

  pub fn calls(&self) -> usize {
    self.received.lock().unwrap().len()
  }

  pub fn batches(&self) -> Vec<SyncBatch> {
    self
      .received
      .lock()
      .unwrap()
      .iter()
      .map(|(batch, _)| batch.clone())
      .collect()
  }

  pub fn keys(&self) -> Vec<String> {
    self
      .received
      .lock()
      .unwrap()
      .iter()
      .map(|(_, key)| key.clone())
      .collect()
  }
}

impl GatehouseApi for FakeApi {
  async fn fetch_residents(&self) -> Result<ResidentsResponse> {
    self
      .residents
      .clone()
      .ok_or_else(|| eyre!("residents endpoint unreachable"))
  }

  async fn submit_batch(
    &self,
    batch: &SyncBatch,
    idempotency_key: &str,
  ) -> std::result::Result<SyncResponse, SyncError> {
    self
      .received
      .lock()
      .unwrap()
      .push((batch.clone(), idempotency_key.to_string()));
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if let Some(hook) = &self.on_submit {
      hook();
    }
    self.result.clone()
  }
}
