//! Install/activate lifecycle of a deploy.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManifest, CacheTiers, GenerationHandle, Tier};
use crate::remote::{Request, Response, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Uninstalled,
  Installing,
  /// Installed and waiting for activation. `skip_waiting` means it may
  /// activate without waiting for existing sessions to close.
  Installed {
    skip_waiting: bool,
  },
  Active,
}

/// What activation cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Stale generations that could not be deleted; left for the next activation
  pub failed: Vec<String>,
}

pub struct LifecycleController {
  tiers: CacheTiers,
  transport: Arc<dyn Transport>,
  manifest: CacheManifest,
  precache: Vec<Url>,
  state: RwLock<LifecycleState>,
  /// Set by activation and never cleared by a later install, so a failed
  /// reinstall leaves the running version in control.
  controlling: AtomicBool,
  install_prompt: AtomicBool,
}

impl LifecycleController {
  pub fn new(
    tiers: CacheTiers,
    transport: Arc<dyn Transport>,
    manifest: CacheManifest,
    precache: Vec<Url>,
  ) -> Self {
    Self {
      tiers,
      transport,
      manifest,
      precache,
      state: RwLock::new(LifecycleState::Uninstalled),
      controlling: AtomicBool::new(false),
      install_prompt: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, next: LifecycleState) {
    *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
  }

  /// True once activation has claimed control of requests.
  pub fn is_controlling(&self) -> bool {
    self.controlling.load(Ordering::SeqCst)
  }

  fn take_control(&self) {
    self.set_state(LifecycleState::Active);
    self.controlling.store(true, Ordering::SeqCst);
  }

  /// Warm the static tier and open the other current generations.
  ///
  /// All precache fetches must return 2xx before anything is written, and the
  /// static generation is written in one batch. On failure the controller
  /// stays `Installing` and install can be retried; if an earlier version is
  /// active it keeps control.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);

    if let Err(e) = self.warm().await {
      if self.is_controlling() {
        warn!(error = %e, "reinstall failed, current version keeps control");
      }
      return Err(e);
    }

    self.set_state(LifecycleState::Installed { skip_waiting: true });
    Ok(())
  }

  async fn warm(&self) -> Result<()> {
    let fetched = try_join_all(self.precache.iter().map(|url| self.fetch_precache(url))).await?;

    let static_handle = GenerationHandle::from(&self.manifest.generation(Tier::Static));
    let batch = fetched
      .into_iter()
      .map(|(url, response)| {
        let key = Request::get(url.clone()).cache_key();
        (key, url.to_string(), response)
      })
      .collect();
    self.tiers.put_all(&static_handle, batch).await?;

    // Opened last: a restart only resumes once every current generation exists.
    for generation in self.manifest.current() {
      if generation.tier != Tier::Static {
        self.tiers.open(&generation).await?;
      }
    }

    info!(
      resources = self.precache.len(),
      generation = static_handle.name(),
      "install complete"
    );
    Ok(())
  }

  async fn fetch_precache(&self, url: &Url) -> Result<(Url, Response)> {
    let response = self
      .transport
      .send(&Request::get(url.clone()))
      .await
      .map_err(|e| eyre!("Precache of {} failed: {}", url, e))?;

    if !response.is_success() {
      return Err(eyre!(
        "Precache of {} returned status {}",
        url,
        response.status
      ));
    }
    Ok((url.clone(), response))
  }

  /// Delete stale generations and take control.
  ///
  /// Deletion failures are logged; control is taken regardless.
  pub async fn activate(&self) -> Result<ActivationReport> {
    match self.state() {
      LifecycleState::Installed { .. } | LifecycleState::Active => {}
      state => return Err(eyre!("Cannot activate from state {:?}", state)),
    }

    let report = self.evict_stale().await;
    self.take_control();
    info!("activated, controlling requests");
    Ok(report)
  }

  async fn evict_stale(&self) -> ActivationReport {
    let current: HashSet<String> = self.manifest.current_names().into_iter().collect();
    let mut report = ActivationReport::default();

    match self.tiers.generations().await {
      Ok(existing) => {
        for name in existing.into_iter().filter(|name| !current.contains(name)) {
          match self.tiers.delete_generation(&name).await {
            Ok(_) => {
              info!(generation = %name, "deleted stale cache generation");
              report.deleted.push(name);
            }
            Err(e) => {
              warn!(generation = %name, error = %e, "failed to delete stale cache generation");
              report.failed.push(name);
            }
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to enumerate cache generations"),
    }

    report
  }

  /// Take control without reinstalling when an earlier run completed the
  /// install of this deploy. Generations it left behind are evicted as
  /// activation would have. Returns whether control was taken.
  pub async fn resume(&self) -> Result<bool> {
    let existing = self.tiers.generations().await?;
    let installed = self
      .manifest
      .current_names()
      .iter()
      .all(|name| existing.contains(name));

    if installed {
      let report = self.evict_stale().await;
      if !report.deleted.is_empty() {
        debug!(deleted = ?report.deleted, "evicted generations on resume");
      }
      self.take_control();
    }
    Ok(installed)
  }

  /// Record whether the host has an install prompt to offer.
  pub fn set_install_prompt(&self, available: bool) {
    self.install_prompt.store(available, Ordering::SeqCst);
  }

  pub fn install_prompt_available(&self) -> bool {
    self.install_prompt.load(Ordering::SeqCst)
  }
}
