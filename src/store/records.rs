//! Record types held by the offline store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which pending queue a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingKind {
  Visitor,
  Package,
  Request,
}

impl PendingKind {
  pub const ALL: [PendingKind; 3] = [PendingKind::Visitor, PendingKind::Package, PendingKind::Request];

  /// Table backing this queue
  pub fn table(self) -> &'static str {
    match self {
      PendingKind::Visitor => "pending_visitors",
      PendingKind::Package => "pending_packages",
      PendingKind::Request => "pending_requests",
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      PendingKind::Visitor => "visitor",
      PendingKind::Package => "package",
      PendingKind::Request => "request",
    }
  }
}

/// Visitor entry captured at the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorPayload {
  #[serde(rename = "nome_completo")]
  pub full_name: String,
  #[serde(default)]
  pub cpf: String,
  #[serde(rename = "data_nascimento", default)]
  pub birth_date: Option<String>,
  #[serde(rename = "placa_veiculo", default)]
  pub vehicle_plate: String,
  #[serde(rename = "morador_id", default)]
  pub resident_id: Option<i64>,
  #[serde(rename = "quem_autorizou", default)]
  pub authorized_by: String,
  #[serde(rename = "observacoes", default)]
  pub notes: String,
}

/// Package received for a resident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePayload {
  #[serde(rename = "morador_id")]
  pub resident_id: i64,
  #[serde(default)]
  pub volume: String,
  #[serde(rename = "destinatario_alternativo", default)]
  pub alternate_recipient: String,
}

/// Service request logged on behalf of a resident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
  #[serde(rename = "tipo", default)]
  pub request_type: String,
  #[serde(rename = "descricao")]
  pub description: String,
  #[serde(rename = "morador_id", default)]
  pub resident_id: Option<i64>,
}

/// Request type used when the form leaves it blank.
pub const DEFAULT_REQUEST_TYPE: &str = "OUTRO";

/// A form submission waiting for its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPayload {
  Visitor(VisitorPayload),
  Package(PackagePayload),
  Request(RequestPayload),
}

impl PendingPayload {
  pub fn kind(&self) -> PendingKind {
    match self {
      PendingPayload::Visitor(_) => PendingKind::Visitor,
      PendingPayload::Package(_) => PendingKind::Package,
      PendingPayload::Request(_) => PendingKind::Request,
    }
  }

  /// Trim fields, apply defaults and reject submissions the server would refuse.
  pub fn normalized(self) -> Result<Self> {
    match self {
      PendingPayload::Visitor(v) => {
        let v = v.normalized();
        if v.full_name.is_empty() {
          return Err(eyre!("Visitor name is required"));
        }
        Ok(PendingPayload::Visitor(v))
      }
      PendingPayload::Package(p) => {
        if p.resident_id <= 0 {
          return Err(eyre!("Select a resident before registering the package"));
        }
        Ok(PendingPayload::Package(p.normalized()))
      }
      PendingPayload::Request(r) => {
        let r = r.normalized();
        if r.description.is_empty() {
          return Err(eyre!("Request description is required"));
        }
        Ok(PendingPayload::Request(r))
      }
    }
  }

  pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
    match self {
      PendingPayload::Visitor(v) => serde_json::to_vec(v),
      PendingPayload::Package(p) => serde_json::to_vec(p),
      PendingPayload::Request(r) => serde_json::to_vec(r),
    }
  }
}

impl VisitorPayload {
  pub fn normalized(self) -> Self {
    Self {
      full_name: self.full_name.trim().to_string(),
      cpf: self.cpf.trim().to_string(),
      birth_date: non_empty(self.birth_date),
      vehicle_plate: self.vehicle_plate.trim().to_string(),
      resident_id: self.resident_id,
      authorized_by: self.authorized_by.trim().to_string(),
      notes: self.notes.trim().to_string(),
    }
  }
}

impl PackagePayload {
  pub fn normalized(self) -> Self {
    Self {
      resident_id: self.resident_id,
      volume: self.volume.trim().to_string(),
      alternate_recipient: self.alternate_recipient.trim().to_string(),
    }
  }
}

impl RequestPayload {
  pub fn normalized(self) -> Self {
    let request_type = self.request_type.trim();
    Self {
      request_type: if request_type.is_empty() {
        DEFAULT_REQUEST_TYPE.to_string()
      } else {
        request_type.to_string()
      },
      description: self.description.trim().to_string(),
      resident_id: self.resident_id,
    }
  }
}

/// Empty form values become `None` so they go out as `null`.
fn non_empty(value: Option<String>) -> Option<String> {
  value
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
}

/// A stored capture. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord<T> {
  /// Local-only id, meaningless to the server
  pub temp_id: i64,
  pub captured_at: DateTime<Utc>,
  /// Operator the capture is attributed to
  pub operator: String,
  pub payload: T,
}

/// Highest temp id seen per queue in a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
  pub visitor: Option<i64>,
  pub package: Option<i64>,
  pub request: Option<i64>,
}

impl Watermark {
  pub fn get(&self, kind: PendingKind) -> Option<i64> {
    match kind {
      PendingKind::Visitor => self.visitor,
      PendingKind::Package => self.package,
      PendingKind::Request => self.request,
    }
  }
}

/// Contents of all three queues read in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSnapshot {
  pub visitors: Vec<PendingRecord<VisitorPayload>>,
  pub packages: Vec<PendingRecord<PackagePayload>>,
  pub requests: Vec<PendingRecord<RequestPayload>>,
}

impl PendingSnapshot {
  pub fn is_empty(&self) -> bool {
    self.visitors.is_empty() && self.packages.is_empty() && self.requests.is_empty()
  }

  pub fn total(&self) -> usize {
    self.visitors.len() + self.packages.len() + self.requests.len()
  }

  pub fn watermark(&self) -> Watermark {
    Watermark {
      visitor: self.visitors.iter().map(|r| r.temp_id).max(),
      package: self.packages.iter().map(|r| r.temp_id).max(),
      request: self.requests.iter().map(|r| r.temp_id).max(),
    }
  }

  /// (kind, temp id, capture time) for every record, in queue order.
  pub fn identities(&self) -> Vec<(PendingKind, i64, DateTime<Utc>)> {
    let visitors = self
      .visitors
      .iter()
      .map(|r| (PendingKind::Visitor, r.temp_id, r.captured_at));
    let packages = self
      .packages
      .iter()
      .map(|r| (PendingKind::Package, r.temp_id, r.captured_at));
    let requests = self
      .requests
      .iter()
      .map(|r| (PendingKind::Request, r.temp_id, r.captured_at));
    visitors.chain(packages).chain(requests).collect()
  }
}

/// Resident directory entry mirrored from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resident {
  pub id: i64,
  /// Remaining server fields, kept verbatim
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Resident {
  fn field(&self, name: &str) -> Option<&str> {
    self
      .fields
      .get(name)
      .and_then(Value::as_str)
      .filter(|s| !s.is_empty())
  }

  /// Display label, e.g. "A - 102 - Maria".
  pub fn label(&self) -> String {
    let name = self.field("nome").unwrap_or("?");
    let apartment = self.field("apartamento").unwrap_or("?");
    match self.field("bloco") {
      Some(block) => format!("{} - {} - {}", block, apartment, name),
      None => format!("{} - {}", apartment, name),
    }
  }
}
