//! Durable local store for the resident snapshot and the pending queues.
//!
//! One SQLite connection behind a mutex: every operation runs in its own
//! transaction, so callers never observe a partial write and concurrent
//! enqueue/drain/clear calls are serialized.

mod records;
pub mod schema;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::server::GatehouseApi;

pub use records::{
  PackagePayload, PendingKind, PendingPayload, PendingRecord, PendingSnapshot, RequestPayload,
  Resident, VisitorPayload, Watermark,
};

/// Preference holding the last operator seen by a refresh.
const OPERATOR_PREFERENCE: &str = "porteiro_username";

/// Attribution used when no operator was ever cached.
pub const UNKNOWN_OPERATOR: &str = "unknown";

/// Offline database with an explicit open/close lifecycle.
pub struct OfflineStore {
  conn: Mutex<Option<Connection>>,
}

impl OfflineStore {
  /// Open or create the store at `path`, upgrading the schema if needed.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    let store = Self::from_connection(conn)?;
    info!(path = %path.display(), "offline store ready");
    Ok(store)
  }

  /// Store backed by a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    run_migrations(&conn)?;

    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  /// Close the underlying connection. Later calls fail.
  pub fn close(&self) -> Result<()> {
    let mut guard = self.lock()?;
    if let Some(conn) = guard.take() {
      conn
        .close()
        .map_err(|(_, e)| eyre!("Failed to close database: {}", e))?;
    }
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run raw SQL against the open connection.
  #[cfg(test)]
  pub(crate) fn run_sql(&self, sql: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute_batch(sql)
        .map_err(|e| eyre!("Failed to run sql: {}", e))
    })
  }

  fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
    let mut guard = self.lock()?;
    let conn = guard
      .as_mut()
      .ok_or_else(|| eyre!("Offline store is closed"))?;
    f(conn)
  }

  // ==========================================================================
  // Reference snapshot
  // ==========================================================================

  /// Fetch the resident directory and replace the local snapshot.
  ///
  /// On failure the previous snapshot is left as it was.
  pub async fn refresh_reference_records<A: GatehouseApi>(&self, api: &A) -> Result<usize> {
    let response = match api.fetch_residents().await {
      Ok(response) => response,
      Err(e) => {
        warn!(error = %e, "could not refresh resident snapshot");
        return Err(e);
      }
    };

    self.replace_residents(&response.residents, &response.operator)?;
    info!(
      count = response.residents.len(),
      operator = %response.operator,
      "resident snapshot refreshed"
    );
    Ok(response.residents.len())
  }

  /// Clear-then-insert the snapshot and remember the operator, in one transaction.
  pub fn replace_residents(&self, residents: &[Resident], operator: &str) -> Result<()> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute("DELETE FROM residents", [])
        .map_err(|e| eyre!("Failed to clear residents: {}", e))?;

      for resident in residents {
        let data =
          serde_json::to_vec(resident).map_err(|e| eyre!("Failed to serialize resident: {}", e))?;
        tx.execute(
          "INSERT OR REPLACE INTO residents (id, data) VALUES (?, ?)",
          params![resident.id, data],
        )
        .map_err(|e| eyre!("Failed to store resident: {}", e))?;
      }

      tx.execute(
        "INSERT OR REPLACE INTO preferences (key, value) VALUES (?, ?)",
        params![OPERATOR_PREFERENCE, operator],
      )
      .map_err(|e| eyre!("Failed to store operator: {}", e))?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))
    })
  }

  /// Every resident in the snapshot, ordered by id.
  pub fn residents(&self) -> Result<Vec<Resident>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT data FROM residents ORDER BY id")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let residents = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))
        .map_err(|e| eyre!("Failed to query residents: {}", e))?
        .filter_map(|r| r.ok())
        .filter_map(|data| serde_json::from_slice(&data).ok())
        .collect();

      Ok(residents)
    })
  }

  /// Last known operator, or [`UNKNOWN_OPERATOR`].
  pub fn operator(&self) -> Result<String> {
    self.with_conn(|conn| read_operator(conn))
  }

  // ==========================================================================
  // Pending queues
  // ==========================================================================

  /// Stamp and append a capture to its queue, returning the temp id.
  pub fn enqueue(&self, payload: PendingPayload) -> Result<i64> {
    let payload = payload.normalized()?;
    let kind = payload.kind();
    let data = payload
      .to_json()
      .map_err(|e| eyre!("Failed to serialize {}: {}", kind.label(), e))?;

    let temp_id = self.with_conn(|conn| {
      let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      let operator = read_operator(&tx)?;
      tx.execute(
        &format!(
          "INSERT INTO {} (captured_at, operator, data) VALUES (?, ?, ?)",
          kind.table()
        ),
        params![Utc::now().to_rfc3339(), operator, data],
      )
      .map_err(|e| eyre!("Failed to save {} locally: {}", kind.label(), e))?;
      let temp_id = tx.last_insert_rowid();

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(temp_id)
    })?;

    debug!(kind = kind.label(), temp_id, "capture queued");
    Ok(temp_id)
  }

  /// Number of records across all three queues.
  pub fn count_pending(&self) -> Result<u64> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      let mut total = 0u64;
      for kind in PendingKind::ALL {
        let count: i64 = tx
          .query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| {
            row.get(0)
          })
          .map_err(|e| eyre!("Failed to count {}: {}", kind.table(), e))?;
        total += count as u64;
      }
      Ok(total)
    })
  }

  /// Read every queue in one transaction. Nothing is deleted.
  pub fn drain_all(&self) -> Result<PendingSnapshot> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      Ok(PendingSnapshot {
        visitors: read_queue(&tx, PendingKind::Visitor)?,
        packages: read_queue(&tx, PendingKind::Package)?,
        requests: read_queue(&tx, PendingKind::Request)?,
      })
    })
  }

  /// Empty all three queues atomically. Returns the number of records removed.
  pub fn clear_all(&self) -> Result<u64> {
    self.delete_pending(|_| None)
  }

  /// Remove the records covered by a drained snapshot, keeping later captures.
  pub fn clear_through(&self, watermark: &Watermark) -> Result<u64> {
    self.delete_pending(|kind| Some(watermark.get(kind)))
  }

  /// `bound(kind)`: `None` deletes the whole queue, `Some(None)` keeps it,
  /// `Some(Some(id))` deletes ids up to and including `id`.
  fn delete_pending(&self, bound: impl Fn(PendingKind) -> Option<Option<i64>>) -> Result<u64> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      let mut removed = 0usize;
      for kind in PendingKind::ALL {
        removed += match bound(kind) {
          None => tx.execute(&format!("DELETE FROM {}", kind.table()), []),
          Some(None) => Ok(0),
          Some(Some(max)) => tx.execute(
            &format!("DELETE FROM {} WHERE temp_id <= ?", kind.table()),
            params![max],
          ),
        }
        .map_err(|e| eyre!("Failed to clear {}: {}", kind.table(), e))?;
      }

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(removed as u64)
    })
  }
}

/// Create missing tables and bump the schema version.
fn run_migrations(conn: &Connection) -> Result<()> {
  let version: i32 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if version > schema::SCHEMA_VERSION {
    return Err(eyre!(
      "Database schema version {} is newer than supported version {}",
      version,
      schema::SCHEMA_VERSION
    ));
  }

  conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

  if version < schema::SCHEMA_VERSION {
    conn
      .pragma_update(None, "user_version", schema::SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to update schema version: {}", e))?;
    debug!(from = version, to = schema::SCHEMA_VERSION, "schema upgraded");
  }

  Ok(())
}

fn read_operator(conn: &Connection) -> Result<String> {
  let mut stmt = conn
    .prepare("SELECT value FROM preferences WHERE key = ?")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let operator: Option<String> = stmt
    .query_row(params![OPERATOR_PREFERENCE], |row| row.get(0))
    .optional()
    .map_err(|e| eyre!("Failed to read operator: {}", e))?;

  Ok(
    operator
      .filter(|o| !o.is_empty())
      .unwrap_or_else(|| UNKNOWN_OPERATOR.to_string()),
  )
}

fn read_queue<T: DeserializeOwned>(
  conn: &Connection,
  kind: PendingKind,
) -> Result<Vec<PendingRecord<T>>> {
  let mut stmt = conn
    .prepare(&format!(
      "SELECT temp_id, captured_at, operator, data FROM {} ORDER BY temp_id",
      kind.table()
    ))
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows = stmt
    .query_map([], |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, Vec<u8>>(3)?,
      ))
    })
    .map_err(|e| eyre!("Failed to query {}: {}", kind.table(), e))?;

  let mut records = Vec::new();
  for row in rows {
    let (temp_id, captured_at, operator, data) =
      row.map_err(|e| eyre!("Failed to read {}: {}", kind.table(), e))?;
    let payload = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Corrupt {} record {}: {}", kind.label(), temp_id, e))?;
    records.push(PendingRecord {
      temp_id,
      captured_at: parse_datetime(&captured_at)?,
      operator,
      payload,
    });
  }

  Ok(records)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::server::{ResidentsResponse, SyncBatch, SyncResponse};
  use std::sync::Arc;

  fn visitor(name: &str) -> PendingPayload {
    PendingPayload::Visitor(VisitorPayload {
      full_name: name.into(),
      ..Default::default()
    })
  }

  fn package(resident_id: i64) -> PendingPayload {
    PendingPayload::Package(PackagePayload {
      resident_id,
      volume: "caixa".into(),
      alternate_recipient: String::new(),
    })
  }

  fn request(description: &str) -> PendingPayload {
    PendingPayload::Request(RequestPayload {
      request_type: "MANUTENCAO".into(),
      description: description.into(),
      resident_id: None,
    })
  }

  fn resident(id: i64, name: &str) -> Resident {
    serde_json::from_value(serde_json::json!({
      "id": id, "nome": name, "bloco": "A", "apartamento": "101"
    }))
    .unwrap()
  }

  /// Residents endpoint that either answers or fails.
  struct DirectoryApi {
    response: Option<ResidentsResponse>,
  }

  impl GatehouseApi for DirectoryApi {
    async fn fetch_residents(&self) -> Result<ResidentsResponse> {
      self
        .response
        .clone()
        .ok_or_else(|| eyre!("connection refused"))
    }

    async fn submit_batch(
      &self,
      _batch: &SyncBatch,
      _key: &str,
    ) -> std::result::Result<SyncResponse, SyncError> {
      Err(SyncError::Network("not used".into()))
    }
  }

  #[test]
  fn test_enqueue_counts_and_ids() {
    let store = OfflineStore::open_in_memory().unwrap();
    assert_eq!(store.count_pending().unwrap(), 0);

    let first = store.enqueue(visitor("Ana Silva")).unwrap();
    let second = store.enqueue(visitor("Bruno Costa")).unwrap();
    store.enqueue(package(3)).unwrap();
    store.enqueue(request("Portão travado")).unwrap();

    assert!(second > first);
    assert_eq!(store.count_pending().unwrap(), 4);
  }

  #[test]
  fn test_enqueue_stamps_operator() {
    let store = OfflineStore::open_in_memory().unwrap();
    store.enqueue(visitor("Ana Silva")).unwrap();
    store.replace_residents(&[], "joao").unwrap();
    store.enqueue(visitor("Bruno Costa")).unwrap();

    let snapshot = store.drain_all().unwrap();
    assert_eq!(snapshot.visitors[0].operator, UNKNOWN_OPERATOR);
    assert_eq!(snapshot.visitors[1].operator, "joao");
    assert_eq!(snapshot.visitors[1].payload.full_name, "Bruno Costa");
  }

  #[test]
  fn test_invalid_capture_is_not_stored() {
    let store = OfflineStore::open_in_memory().unwrap();
    assert!(store.enqueue(request("  ")).is_err());
    assert_eq!(store.count_pending().unwrap(), 0);
  }

  #[test]
  fn test_drain_does_not_delete() {
    let store = OfflineStore::open_in_memory().unwrap();
    store.enqueue(package(3)).unwrap();
    store.enqueue(request("Vazamento")).unwrap();

    let first = store.drain_all().unwrap();
    let second = store.drain_all().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.packages.len(), 1);
    assert_eq!(first.requests[0].payload.description, "Vazamento");
    assert_eq!(store.count_pending().unwrap(), 2);
  }

  #[test]
  fn test_clear_all_empties_every_queue() {
    let store = OfflineStore::open_in_memory().unwrap();
    store.enqueue(visitor("Ana Silva")).unwrap();
    store.enqueue(package(3)).unwrap();
    store.enqueue(request("Vazamento")).unwrap();

    assert_eq!(store.clear_all().unwrap(), 3);
    assert_eq!(store.count_pending().unwrap(), 0);
    assert!(store.drain_all().unwrap().is_empty());
  }

  #[test]
  fn test_clear_through_keeps_later_captures() {
    let store = OfflineStore::open_in_memory().unwrap();
    store.enqueue(visitor("Ana Silva")).unwrap();
    store.enqueue(package(3)).unwrap();
    let watermark = store.drain_all().unwrap().watermark();

    store.enqueue(visitor("Carla Dias")).unwrap();
    store.enqueue(request("Vazamento")).unwrap();

    assert_eq!(store.clear_through(&watermark).unwrap(), 2);
    let left = store.drain_all().unwrap();
    assert_eq!(left.visitors.len(), 1);
    assert_eq!(left.visitors[0].payload.full_name, "Carla Dias");
    assert_eq!(left.requests.len(), 1);
    assert!(left.packages.is_empty());
  }

  #[test]
  fn test_temp_ids_not_reused_after_clear() {
    let store = OfflineStore::open_in_memory().unwrap();
    let first = store.enqueue(visitor("Ana Silva")).unwrap();
    store.clear_all().unwrap();
    let second = store.enqueue(visitor("Ana Silva")).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_replace_residents_is_full_replacement() {
    let store = OfflineStore::open_in_memory().unwrap();
    store
      .replace_residents(&[resident(1, "Maria"), resident(2, "José")], "joao")
      .unwrap();
    store.replace_residents(&[resident(3, "Lia")], "ana").unwrap();

    let residents = store.residents().unwrap();
    assert_eq!(residents.len(), 1);
    assert_eq!(residents[0].id, 3);
    assert_eq!(store.operator().unwrap(), "ana");
  }

  #[test]
  fn test_unreadable_operator_is_an_error() {
    let store = OfflineStore::open_in_memory().unwrap();
    assert_eq!(store.operator().unwrap(), UNKNOWN_OPERATOR);

    store
      .run_sql("INSERT INTO preferences (key, value) VALUES ('porteiro_username', X'00FF')")
      .unwrap();
    assert!(store.operator().is_err());
  }

  #[tokio::test]
  async fn test_refresh_replaces_snapshot() {
    let store = OfflineStore::open_in_memory().unwrap();
    store.replace_residents(&[resident(1, "Maria")], "joao").unwrap();

    let api = DirectoryApi {
      response: Some(ResidentsResponse {
        residents: vec![resident(5, "Rita"), resident(6, "Caio")],
        operator: "pedro".into(),
      }),
    };
    assert_eq!(store.refresh_reference_records(&api).await.unwrap(), 2);
    assert_eq!(store.residents().unwrap().len(), 2);
    assert_eq!(store.operator().unwrap(), "pedro");
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_snapshot() {
    let store = OfflineStore::open_in_memory().unwrap();
    store
      .replace_residents(&[resident(1, "Maria"), resident(2, "José")], "joao")
      .unwrap();

    let api = DirectoryApi { response: None };
    assert!(store.refresh_reference_records(&api).await.is_err());

    let residents = store.residents().unwrap();
    assert_eq!(residents.len(), 2);
    assert_eq!(residents[0].label(), "A - 101 - Maria");
    assert_eq!(store.operator().unwrap(), "joao");
  }

  #[test]
  fn test_reopen_is_idempotent_and_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let store = OfflineStore::open(&path).unwrap();
    store.enqueue(visitor("Ana Silva")).unwrap();
    store.close().unwrap();
    assert!(store.count_pending().is_err());

    let reopened = OfflineStore::open(&path).unwrap();
    assert_eq!(reopened.count_pending().unwrap(), 1);
    let version: i32 = reopened
      .with_conn(|conn| {
        conn
          .query_row("PRAGMA user_version", [], |row| row.get(0))
          .map_err(|e| eyre!("{}", e))
      })
      .unwrap();
    assert_eq!(version, schema::SCHEMA_VERSION);
  }

  #[test]
  fn test_concurrent_enqueue_and_clear_lose_nothing() {
    let store = Arc::new(OfflineStore::open_in_memory().unwrap());

    let writer = {
      let store = Arc::clone(&store);
      std::thread::spawn(move || {
        for i in 0..50 {
          store.enqueue(visitor(&format!("Visitante {}", i))).unwrap();
        }
      })
    };

    let mut cleared = 0u64;
    for _ in 0..20 {
      let snapshot = store.drain_all().unwrap();
      cleared += store.clear_through(&snapshot.watermark()).unwrap();
    }
    writer.join().unwrap();

    assert_eq!(cleared + store.count_pending().unwrap(), 50);
  }
}
