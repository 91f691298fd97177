//! Serde types matching the portal's offline endpoints.
//!
//! The wire names are Portuguese; Rust-side names live on the record types in
//! `store::records`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;
use crate::store::{
  PackagePayload, PendingSnapshot, RequestPayload, Resident, VisitorPayload,
};

// ============================================================================
// Reference data refresh
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ResidentsResponse {
  #[serde(rename = "moradores")]
  pub residents: Vec<Resident>,
  /// Operator of the session that made the request
  #[serde(rename = "porteiro")]
  pub operator: String,
}

// ============================================================================
// Sync submission
// ============================================================================

/// One batch carrying every drained record, grouped by kind.
///
/// Only the payloads go out: temp ids, capture times and attribution stay local.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncBatch {
  #[serde(rename = "visitantes")]
  pub visitors: Vec<VisitorPayload>,
  #[serde(rename = "encomendas")]
  pub packages: Vec<PackagePayload>,
  #[serde(rename = "solicitacoes")]
  pub requests: Vec<RequestPayload>,
}

impl SyncBatch {
  pub fn from_snapshot(snapshot: &PendingSnapshot) -> Self {
    Self {
      visitors: snapshot
        .visitors
        .iter()
        .map(|r| r.payload.clone().normalized())
        .collect(),
      packages: snapshot
        .packages
        .iter()
        .map(|r| r.payload.clone().normalized())
        .collect(),
      requests: snapshot
        .requests
        .iter()
        .map(|r| r.payload.clone().normalized())
        .collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.visitors.len() + self.packages.len() + self.requests.len()
  }
}

/// Stable key for a set of drained records.
///
/// Resending the same records yields the same key, so an idempotent endpoint
/// can drop the duplicate.
pub fn idempotency_key(snapshot: &PendingSnapshot) -> String {
  let mut hasher = Sha256::new();
  for (kind, temp_id, captured_at) in snapshot.identities() {
    hasher.update(format!("{}:{}:{};", kind.label(), temp_id, captured_at.to_rfc3339()).as_bytes());
  }
  hex::encode(hasher.finalize())
}

/// Confirmation of an accepted batch. Every field is required: a body without
/// them (an error page, `{}`) is not a confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SyncResponse {
  #[serde(rename = "visitantes_criados")]
  pub visitors_created: u64,
  #[serde(rename = "encomendas_criadas")]
  pub packages_created: u64,
  #[serde(rename = "solicitacoes_criadas")]
  pub requests_created: u64,
  /// Operator the server attributed the records to
  #[serde(rename = "porteiro")]
  pub operator: String,
}

impl SyncResponse {
  /// Parse a 2xx body from the sync endpoint.
  pub fn from_body(body: &[u8]) -> Result<Self, SyncError> {
    serde_json::from_slice(body).map_err(|e| SyncError::Malformed(e.to_string()))
  }

  pub fn total_created(&self) -> u64 {
    self.visitors_created + self.packages_created + self.requests_created
  }

  /// Human summary, e.g. "2 visitor(s), 1 package(s) registered by joao".
  pub fn summary(&self) -> String {
    let mut parts = Vec::new();
    if self.visitors_created > 0 {
      parts.push(format!("{} visitor(s)", self.visitors_created));
    }
    if self.packages_created > 0 {
      parts.push(format!("{} package(s)", self.packages_created));
    }
    if self.requests_created > 0 {
      parts.push(format!("{} request(s)", self.requests_created));
    }
    format!("Synced! {} registered by {}.", parts.join(", "), self.operator)
  }
}
