//! SQLite-backed durable upload queue.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::upload::{NewUpload, QueuedUpload, RemoveOutcome};
use crate::cache::parse_datetime;
use crate::remote::Headers;

/// Schema for the upload queue.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_blob BLOB NOT NULL,
    target_url TEXT NOT NULL,
    headers TEXT NOT NULL,
    file_name TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_enqueued_at ON uploads(enqueued_at);
"#;

/// Durable store of pending uploads.
///
/// The single connection is guarded by a mutex, so writers are serialized and
/// `AUTOINCREMENT` ids are neither skipped by races nor reused after deletion.
#[derive(Clone)]
pub struct QueueStore {
  conn: Arc<Mutex<Connection>>,
}

impl QueueStore {
  /// Open (or create) the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  async fn blocking<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      op(&conn)
    })
    .await
    .map_err(|e| eyre!("Queue task failed: {}", e))?
  }

  /// Persist an upload and return its id.
  pub async fn enqueue(&self, upload: NewUpload) -> Result<i64> {
    let headers = serde_json::to_string(&upload.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let id = self
      .blocking(move |conn| {
        conn
          .execute(
            "INSERT INTO uploads (file_blob, target_url, headers, file_name, enqueued_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
              upload.file.bytes,
              upload.target_url,
              headers,
              upload.file.name,
              Utc::now().to_rfc3339()
            ],
          )
          .map_err(|e| eyre!("Failed to enqueue upload: {}", e))?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    debug!(id, "upload queued");
    Ok(id)
  }

  /// Snapshot of every queued upload, oldest first.
  pub async fn list_all(&self) -> Result<Vec<QueuedUpload>> {
    self
      .blocking(|conn| {
        let mut stmt = conn
          .prepare(
            "SELECT id, file_blob, target_url, headers, file_name, enqueued_at
             FROM uploads ORDER BY id",
          )
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows = stmt
          .query_map([], |row| {
            Ok((
              row.get::<_, i64>(0)?,
              row.get::<_, Vec<u8>>(1)?,
              row.get::<_, String>(2)?,
              row.get::<_, String>(3)?,
              row.get::<_, String>(4)?,
              row.get::<_, String>(5)?,
            ))
          })
          .map_err(|e| eyre!("Failed to list uploads: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read upload row: {}", e))?;

        rows
          .into_iter()
          .map(
            |(id, file_blob, target_url, headers, file_name, enqueued_at)| -> Result<QueuedUpload> {
              let headers: Headers = serde_json::from_str(&headers)
                .map_err(|e| eyre!("Upload {} has corrupt headers: {}", id, e))?;
              Ok(QueuedUpload {
                id,
                file_blob,
                target_url,
                headers,
                file_name,
                enqueued_at: parse_datetime(&enqueued_at)?,
              })
            },
          )
          .collect()
      })
      .await
  }

  pub async fn remove(&self, id: i64) -> Result<RemoveOutcome> {
    let deleted = self
      .blocking(move |conn| {
        conn
          .execute("DELETE FROM uploads WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to remove upload {}: {}", id, e))
      })
      .await?;

    Ok(if deleted > 0 {
      RemoveOutcome::Removed
    } else {
      RemoveOutcome::NotFound
    })
  }

  pub async fn count(&self) -> Result<usize> {
    self
      .blocking(|conn| {
        conn
          .query_row("SELECT COUNT(*) FROM uploads", [], |row| row.get::<_, i64>(0))
          .map(|count| count as usize)
          .map_err(|e| eyre!("Failed to count uploads: {}", e))
      })
      .await
  }
}
