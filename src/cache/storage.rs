//! Response storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedResponse, Request};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for response storage backends, partitioned by cache generation.
pub trait ResponseStorage: Send + Sync {
  /// Make sure a (possibly empty) generation exists.
  fn open_generation(&self, generation: &str) -> Result<()>;

  /// Store one response under a generation, replacing any previous copy.
  fn put(&self, generation: &str, request: &Request, response: &CachedResponse) -> Result<()>;

  /// Store many responses in one transaction; all or nothing.
  fn put_all(&self, generation: &str, entries: &[(Request, CachedResponse)]) -> Result<()>;

  /// Look up a response in a generation.
  fn get(&self, generation: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Names of every stored generation.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and everything in it. Returns the number of responses removed.
  fn delete_generation(&self, generation: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl ResponseStorage for NoopStorage {
  fn open_generation(&self, _generation: &str) -> Result<()> {
    Ok(())
  }

  fn put(&self, _generation: &str, _request: &Request, _response: &CachedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _generation: &str, _entries: &[(Request, CachedResponse)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _generation: &str, _request: &Request) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn generations(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_generation(&self, _generation: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based response storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the response cache at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS responses (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);
"#;

fn insert_response(
  conn: &Connection,
  generation: &str,
  request: &Request,
  response: &CachedResponse,
) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to register generation: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO responses (generation, request_key, url, status, content_type, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        request.cache_key(),
        request.url,
        response.status,
        response.content_type,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", request.url, e))?;

  Ok(())
}

impl ResponseStorage for SqliteStorage {
  fn open_generation(&self, generation: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;

    Ok(())
  }

  fn put(&self, generation: &str, request: &Request, response: &CachedResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_response(&conn, generation, request, response)
  }

  fn put_all(&self, generation: &str, entries: &[(Request, CachedResponse)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (request, response) in entries {
      insert_response(&tx, generation, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, generation: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, content_type, body, cached_at FROM responses
         WHERE generation = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let result: Option<(u16, Option<String>, Vec<u8>, String)> = stmt
      .query_row(params![generation, request.cache_key()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cached response: {}", e))?;

    match result {
      Some((status, content_type, body, cached_at_str)) => Ok(Some(CachedEntry {
        response: CachedResponse {
          status,
          content_type,
          body,
        },
        cached_at: parse_datetime(&cached_at_str)?,
      })),
      None => Ok(None),
    }
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<usize> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = tx
      .execute(
        "DELETE FROM responses WHERE generation = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete responses of {}: {}", generation, e))?;
    tx.execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
