//! Replays queued uploads against the remote API.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::store::QueueStore;
use super::upload::{QueuedUpload, RemoveOutcome};
use crate::remote::Transport;

/// Outcome of one drain pass, by upload id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: Vec<i64>,
  pub failed: Vec<i64>,
  /// Already being delivered by a concurrent pass
  pub skipped: Vec<i64>,
}

impl DrainReport {
  pub fn is_empty(&self) -> bool {
    self.delivered.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
  }
}

/// Delivers queued uploads oldest-first, removing each only after the server acknowledges it.
///
/// A crash between acknowledgment and removal leaves the record in place, so
/// delivery is at-least-once and the server must tolerate duplicates.
pub struct Drainer {
  store: QueueStore,
  transport: Arc<dyn Transport>,
  in_flight: Mutex<HashSet<i64>>,
}

/// Marks an id as being delivered until dropped.
struct InFlight<'a> {
  ids: &'a Mutex<HashSet<i64>>,
  id: i64,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if let Ok(mut ids) = self.ids.lock() {
      ids.remove(&self.id);
    }
  }
}

impl Drainer {
  pub fn new(store: QueueStore, transport: Arc<dyn Transport>) -> Self {
    Self {
      store,
      transport,
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  pub fn store(&self) -> &QueueStore {
    &self.store
  }

  fn claim(&self, id: i64) -> Option<InFlight<'_>> {
    let mut ids = self.in_flight.lock().ok()?;
    if !ids.insert(id) {
      return None;
    }
    Some(InFlight {
      ids: &self.in_flight,
      id,
    })
  }

  /// Replay every queued upload once. A failed record never stops the pass.
  pub async fn drain(&self) -> Result<DrainReport> {
    let uploads = self.store.list_all().await?;
    let mut report = DrainReport::default();

    for upload in uploads {
      let Some(_claim) = self.claim(upload.id) else {
        debug!(id = upload.id, "upload already in flight, skipping");
        report.skipped.push(upload.id);
        continue;
      };

      if let Err(e) = self.deliver(&upload).await {
        warn!(id = upload.id, file = %upload.file_name, error = %e, "queued upload failed, keeping it");
        report.failed.push(upload.id);
        continue;
      }

      match self.store.remove(upload.id).await {
        Ok(RemoveOutcome::Removed) => report.delivered.push(upload.id),
        Ok(RemoveOutcome::NotFound) => {
          debug!(id = upload.id, "upload was already removed");
          report.delivered.push(upload.id);
        }
        Err(e) => {
          // Delivered but still queued; the next pass sends it again.
          warn!(id = upload.id, error = %e, "failed to remove delivered upload");
          report.failed.push(upload.id);
        }
      }
    }

    if !report.is_empty() {
      info!(
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "drained upload queue"
      );
    }

    Ok(report)
  }

  /// Send one upload. Only a 2xx acknowledgment counts as delivered.
  pub async fn deliver(&self, upload: &QueuedUpload) -> Result<()> {
    let request = upload.to_request()?;
    let response = self.transport.send(&request).await?;

    if response.is_success() {
      Ok(())
    } else {
      Err(eyre!(
        "server rejected upload {} with status {}",
        upload.id,
        response.status
      ))
    }
  }
}
