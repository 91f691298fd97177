//! Network-first cache layer for the app shell.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use tracing::{debug, info, warn};

use crate::clients::ClientHub;

use super::storage::ResponseStorage;
use super::traits::{CacheResult, CachedResponse, Fetcher, Request};

/// Intercepts requests and keeps one current cache generation.
///
/// Storage is never written outside the current generation.
pub struct ResourceCache<S: ResponseStorage, F: Fetcher> {
  storage: S,
  fetcher: F,
  generation: String,
  /// URL fragments that must never be served from cache
  bypass: Vec<String>,
  clients: ClientHub,
}

impl<S: ResponseStorage, F: Fetcher> ResourceCache<S, F> {
  pub fn new(
    storage: S,
    fetcher: F,
    generation: impl Into<String>,
    bypass: Vec<String>,
    clients: ClientHub,
  ) -> Self {
    Self {
      storage,
      fetcher,
      generation: generation.into(),
      bypass,
      clients,
    }
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  /// Whether the url contains a bypass fragment.
  pub fn is_bypassed(&self, url: &str) -> bool {
    self.bypass.iter().any(|route| url.contains(route.as_str()))
  }

  /// Fetch every shell asset into the current generation.
  ///
  /// Assets on the bypass list are skipped since they are never served from
  /// cache. All assets are fetched before anything is written, and written in one
  /// transaction, so a failed install leaves no partial generation. The new
  /// generation is ready for activation as soon as this returns.
  pub async fn install(&self, assets: &[String]) -> Result<usize> {
    let requests: Vec<Request> = assets
      .iter()
      .filter(|asset| {
        let bypassed = self.is_bypassed(asset.as_str());
        if bypassed {
          debug!(asset = %asset, "bypassed asset not installed");
        }
        !bypassed
      })
      .map(|a| Request::get(a.as_str()))
      .collect();

    let responses = try_join_all(requests.iter().map(|request| self.fetch_asset(request))).await?;

    let entries: Vec<(Request, CachedResponse)> = requests.into_iter().zip(responses).collect();

    self.storage.open_generation(&self.generation)?;
    self.storage.put_all(&self.generation, &entries)?;

    info!(
      generation = %self.generation,
      assets = entries.len(),
      "shell installed"
    );
    Ok(entries.len())
  }

  async fn fetch_asset(&self, request: &Request) -> Result<CachedResponse> {
    let response = self.fetcher.fetch(request).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Asset {} answered with status {}",
        request.url,
        response.status
      ));
    }
    Ok(response)
  }

  /// Drop every generation except the current one, then claim open clients.
  ///
  /// Returns the names of the deleted generations.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.generations()? {
      if name != self.generation {
        let removed = self.storage.delete_generation(&name)?;
        debug!(generation = %name, removed, "stale generation deleted");
        deleted.push(name);
      }
    }

    let claimed = self.clients.claim(&self.generation);
    info!(
      generation = %self.generation,
      deleted = deleted.len(),
      claimed,
      "cache generation activated"
    );
    Ok(deleted)
  }

  /// Serve a request, network first.
  ///
  /// 1. Non-GET and bypass urls go straight to the network, cache untouched
  /// 2. Otherwise fetch from network and store a copy (best effort)
  /// 3. On network failure, serve the cached copy if there is one
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<CachedResponse>> {
    if request.method != Method::GET || self.is_bypassed(&request.url) {
      let response = self.fetcher.fetch(request).await?;
      return Ok(CacheResult::passthrough(response));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          // A failed write must not hold back the live response
          if let Err(e) = self.storage.put(&self.generation, request, &response) {
            warn!(url = %request.url, error = %e, "failed to cache response");
          }
        }
        Ok(CacheResult::from_network(response))
      }
      Err(network_err) => match self.storage.get(&self.generation, request) {
        Ok(Some(cached)) => {
          debug!(url = %request.url, "network failed, serving cached copy");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        Ok(None) => Err(network_err),
        Err(e) => {
          warn!(url = %request.url, error = %e, "cache lookup failed");
          Err(network_err)
        }
      },
    }
  }
}
