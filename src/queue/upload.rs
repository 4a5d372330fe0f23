use chrono::{DateTime, Utc};

use crate::remote::{Headers, Request};

/// File contents handed over by the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
  pub name: String,
  pub bytes: Vec<u8>,
}

impl FileBlob {
  pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      name: name.into(),
      bytes: bytes.into(),
    }
  }
}

/// An upload waiting to be written to the queue.
#[derive(Debug, Clone)]
pub struct NewUpload {
  pub file: FileBlob,
  pub target_url: String,
  pub headers: Headers,
}

/// A durably queued upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUpload {
  /// Auto-assigned, never reused
  pub id: i64,
  pub file_blob: Vec<u8>,
  pub target_url: String,
  pub headers: Headers,
  /// Diagnostics only
  pub file_name: String,
  /// Diagnostics only; processing order is `id`
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedUpload {
  /// The request that replays this upload.
  pub fn to_request(&self) -> color_eyre::Result<Request> {
    let url = url::Url::parse(&self.target_url)
      .map_err(|e| color_eyre::eyre::eyre!("Queued upload {} has invalid URL: {}", self.id, e))?;
    Ok(Request::post(url, self.file_blob.clone()).with_headers(&self.headers))
  }
}

/// Result of removing a queued upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
  Removed,
  NotFound,
}
