//! Cache tier manager: the async face of the cache storage.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;

use super::generation::{CacheGeneration, CachedEntry, Tier};
use super::storage::CacheStorage;
use crate::remote::Response;

/// Handle to a generation. Writes through a handle create the generation if needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationHandle {
  tier: Tier,
  name: String,
}

impl From<&CacheGeneration> for GenerationHandle {
  fn from(generation: &CacheGeneration) -> Self {
    Self {
      tier: generation.tier,
      name: generation.name(),
    }
  }
}

impl GenerationHandle {
  pub fn tier(&self) -> Tier {
    self.tier
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Owns every cache generation and entry.
///
/// All storage work runs on the blocking pool so request tasks only suspend.
/// Eviction is whole-generation; entries never expire on their own.
pub struct CacheTiers {
  storage: Arc<dyn CacheStorage>,
}

impl CacheTiers {
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  async fn blocking<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&dyn CacheStorage) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || op(&*storage))
      .await
      .map_err(|e| eyre!("Cache task failed: {}", e))?
  }

  /// Open a generation, creating it if absent.
  pub async fn open(&self, generation: &CacheGeneration) -> Result<GenerationHandle> {
    let handle = GenerationHandle::from(generation);
    let name = handle.name.clone();
    self
      .blocking(move |storage| storage.create_generation(&name))
      .await?;

    Ok(handle)
  }

  pub async fn match_entry(
    &self,
    handle: &GenerationHandle,
    request_key: &str,
  ) -> Result<Option<CachedEntry>> {
    let name = handle.name.clone();
    let key = request_key.to_string();
    self
      .blocking(move |storage| storage.get_entry(&name, &key))
      .await
  }

  /// Store a response under `request_key`, overwriting any previous entry.
  pub async fn put(
    &self,
    handle: &GenerationHandle,
    request_key: &str,
    url: &str,
    response: &Response,
  ) -> Result<()> {
    let name = handle.name.clone();
    let key = request_key.to_string();
    let entry = CachedEntry {
      url: url.to_string(),
      response: Response {
        synthetic: false,
        ..response.clone()
      },
      stored_at: Utc::now(),
    };

    debug!(generation = %name, url, "caching response");
    self
      .blocking(move |storage| storage.put_entry(&name, &key, &entry))
      .await
  }

  /// Store a batch of `(request_key, url, response)` atomically, creating
  /// the generation along with it.
  pub async fn put_all(
    &self,
    handle: &GenerationHandle,
    batch: Vec<(String, String, Response)>,
  ) -> Result<()> {
    let name = handle.name.clone();
    let stored_at = Utc::now();
    let entries: Vec<(String, CachedEntry)> = batch
      .into_iter()
      .map(|(key, url, response)| {
        let entry = CachedEntry {
          url,
          response: Response {
            synthetic: false,
            ..response
          },
          stored_at,
        };
        (key, entry)
      })
      .collect();

    debug!(generation = %name, entries = entries.len(), "caching batch");
    self
      .blocking(move |storage| storage.put_entries(&name, &entries))
      .await
  }

  pub async fn delete_generation(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self
      .blocking(move |storage| storage.delete_generation(&name))
      .await
  }

  pub async fn generations(&self) -> Result<Vec<String>> {
    self.blocking(|storage| storage.generations()).await
  }
}

impl Clone for CacheTiers {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
