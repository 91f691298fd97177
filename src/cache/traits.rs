//! Core traits and types for the shell response cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::future::Future;

/// A request intercepted at the network boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: String,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::GET,
      url: url.into(),
    }
  }

  /// Stable, fixed-length key for storage lookups.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{} {}", self.method, self.url.trim()).as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response body plus the headers we replay from cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Network access used by the cache layer.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<CachedResponse>> + Send;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Live network response, copied into the cache.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Live network response the cache never touched.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }

  /// Cached copy served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Bypass path or non-GET request, served straight from network
  Passthrough,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
