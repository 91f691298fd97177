use std::future::Future;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use url::Url;

use crate::cache::{CachedResponse, Fetcher, Request};
use crate::config::{Config, ServerConfig};
use crate::error::SyncError;
use crate::monitor::ReachabilityProbe;

use super::api_types::{ResidentsResponse, SyncBatch, SyncResponse};

/// The portal endpoints the offline engine talks to.
pub trait GatehouseApi: Send + Sync + 'static {
  /// Current resident directory plus the operator of the session.
  fn fetch_residents(&self) -> impl Future<Output = Result<ResidentsResponse>> + Send;

  /// Submit one batch. Either the whole batch is accepted or the call fails.
  fn submit_batch(
    &self,
    batch: &SyncBatch,
    idempotency_key: &str,
  ) -> impl Future<Output = std::result::Result<SyncResponse, SyncError>> + Send;
}

/// reqwest-backed portal client
#[derive(Clone)]
pub struct HttpApi {
  client: reqwest::Client,
  base: Url,
  residents_url: Url,
  sync_url: Url,
  session: Option<String>,
}

impl HttpApi {
  pub fn new(config: &ServerConfig) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", config.url, e))?;
    let residents_url = base
      .join(&config.residents_path)
      .map_err(|e| eyre!("Invalid residents path '{}': {}", config.residents_path, e))?;
    let sync_url = base
      .join(&config.sync_path)
      .map_err(|e| eyre!("Invalid sync path '{}': {}", config.sync_path, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      residents_url,
      sync_url,
      session: Config::session_cookie(),
    })
  }

  fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.session {
      Some(cookie) => request.header(COOKIE, cookie),
      None => request,
    }
  }

  /// Resolve an asset path against the server base url.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base
      .join(url)
      .map_err(|e| eyre!("Invalid url '{}': {}", url, e))
  }
}

impl GatehouseApi for HttpApi {
  async fn fetch_residents(&self) -> Result<ResidentsResponse> {
    let response = self
      .with_session(self.client.get(self.residents_url.clone()))
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch residents: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Residents endpoint refused: {}", e))?;

    response
      .json::<ResidentsResponse>()
      .await
      .map_err(|e| eyre!("Failed to parse residents: {}", e))
  }

  async fn submit_batch(
    &self,
    batch: &SyncBatch,
    idempotency_key: &str,
  ) -> std::result::Result<SyncResponse, SyncError> {
    let response = self
      .with_session(self.client.post(self.sync_url.clone()))
      .header("Idempotency-Key", idempotency_key)
      .json(batch)
      .send()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(SyncError::Rejected {
        status: status.as_u16(),
      });
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;

    SyncResponse::from_body(&body)
  }
}

impl Fetcher for HttpApi {
  async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
    let url = self.resolve(&request.url)?;
    let response = self
      .with_session(self.client.request(request.method.clone(), url.clone()))
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    Ok(CachedResponse {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}

impl ReachabilityProbe for HttpApi {
  async fn is_reachable(&self) -> bool {
    // Any HTTP answer means the link is up
    self
      .client
      .head(self.base.clone())
      .send()
      .await
      .is_ok()
  }
}
