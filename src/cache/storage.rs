//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::generation::CachedEntry;
use crate::remote::{Headers, Response};

/// Trait for cache storage backends.
///
/// Implementations are synchronous; `CacheTiers` moves calls onto the
/// blocking pool.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn create_generation(&self, name: &str) -> Result<()>;

  /// Names of all stored generations.
  fn generations(&self) -> Result<Vec<String>>;

  /// Drop a generation and every entry in it. Returns false if it did not exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Look up one entry.
  fn get_entry(&self, generation: &str, request_key: &str) -> Result<Option<CachedEntry>>;

  /// Store an entry, replacing any previous one under the same key.
  fn put_entry(&self, generation: &str, request_key: &str, entry: &CachedEntry) -> Result<()>;

  /// Create the generation and store every entry in one transaction.
  /// Either all entries land or none do, and the generation is only
  /// created if they do.
  fn put_entries(&self, generation: &str, entries: &[(String, CachedEntry)]) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, request_key),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn create_generation(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", name, e))?;

    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    Ok(deleted > 0)
  }

  fn get_entry(&self, generation: &str, request_key: &str) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM entries
         WHERE generation = ? AND request_key = ?",
        params![generation, request_key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((url, status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(Some(CachedEntry {
      url,
      response: Response {
        status,
        headers,
        body,
        synthetic: false,
      },
      stored_at: parse_datetime(&stored_at)?,
    }))
  }

  fn put_entry(&self, generation: &str, request_key: &str, entry: &CachedEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?, ?)",
        params![generation, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (generation, request_key, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          generation,
          request_key,
          entry.url,
          entry.response.status,
          headers,
          entry.response.body,
          entry.stored_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn put_entries(&self, generation: &str, entries: &[(String, CachedEntry)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Rolled back on drop unless committed
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?, ?)",
      params![generation, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

    {
      let mut stmt = tx
        .prepare(
          "INSERT OR REPLACE INTO entries (generation, request_key, url, status, headers, body, stored_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

      for (request_key, entry) in entries {
        let headers = serde_json::to_string(&entry.response.headers)
          .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

        stmt
          .execute(params![
            generation,
            request_key,
            entry.url,
            entry.response.status,
            headers,
            entry.response.body,
            entry.stored_at.to_rfc3339()
          ])
          .map_err(|e| eyre!("Failed to store cache entry for {}: {}", entry.url, e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
