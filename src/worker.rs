//! The facade a host drives: request interception, lifecycle, and upload queueing.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheManifest, CacheTiers, SqliteStorage};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::event::ConnectivityEvent;
use crate::lifecycle::{ActivationReport, LifecycleController};
use crate::queue::{DrainReport, Drainer, FileBlob, NewUpload, QueueStore};
use crate::remote::{Headers, HttpTransport, Request, Response, Transport};
use crate::routes::RouteRules;
use crate::sync::SyncTrigger;

/// Settings a worker is built from.
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
  pub rules: RouteRules,
  pub manifest: CacheManifest,
  pub precache: Vec<Url>,
  pub sweep_interval: Option<Duration>,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      rules: config.routes.clone(),
      manifest: config.cache.versions.clone(),
      precache: config.precache_urls()?,
      sweep_interval: config.sweep_interval(),
    })
  }
}

/// What happened to a direct upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
  /// The server accepted it
  Delivered(Response),
  /// The server answered with a non-2xx status; nothing was queued
  Rejected(Response),
  /// The network was unreachable; queued under this id
  Queued(i64),
}

/// One deploy of the offline layer.
///
/// Cloning is cheap; every clone drives the same stores.
#[derive(Clone)]
pub struct OfflineWorker {
  dispatcher: Arc<Dispatcher>,
  lifecycle: Arc<LifecycleController>,
  trigger: Arc<SyncTrigger>,
  store: QueueStore,
  transport: Arc<dyn Transport>,
}

impl OfflineWorker {
  pub fn new(
    settings: WorkerSettings,
    tiers: CacheTiers,
    store: QueueStore,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let dispatcher = Dispatcher::new(
      settings.rules,
      &settings.manifest,
      tiers.clone(),
      Arc::clone(&transport),
      TaskTracker::new(),
    );
    let lifecycle = LifecycleController::new(
      tiers,
      Arc::clone(&transport),
      settings.manifest,
      settings.precache,
    );
    let drainer = Arc::new(Drainer::new(store.clone(), Arc::clone(&transport)));
    let trigger = SyncTrigger::new(drainer, settings.sweep_interval);

    Self {
      dispatcher: Arc::new(dispatcher),
      lifecycle: Arc::new(lifecycle),
      trigger: Arc::new(trigger),
      store,
      transport,
    }
  }

  /// Open the on-disk stores named by `config` and talk HTTP to its API.
  pub async fn open(config: &Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let tiers = CacheTiers::new(SqliteStorage::open(&data_dir.join("cache.db"))?);
    let store = QueueStore::open(&data_dir.join("queue.db"))?;
    let transport = Arc::new(HttpTransport::new(config.connect_timeout())?);

    let worker = Self::new(WorkerSettings::from_config(config)?, tiers, store, transport);
    worker.trigger.arm_if_pending().await?;
    if let Err(e) = worker.lifecycle.resume().await {
      warn!(error = %e, "could not check for an existing install");
    }
    Ok(worker)
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  pub fn sync_trigger(&self) -> Arc<SyncTrigger> {
    Arc::clone(&self.trigger)
  }

  pub fn transport(&self) -> Arc<dyn Transport> {
    Arc::clone(&self.transport)
  }

  pub async fn install(&self) -> Result<()> {
    self.lifecycle.install().await
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate().await
  }

  /// Handle one inbound request on its own task.
  ///
  /// Until activation claims control, requests go straight to the network.
  pub fn handle_fetch(&self, request: Request) -> JoinHandle<Response> {
    let dispatcher = Arc::clone(&self.dispatcher);
    let controlling = self.lifecycle.is_controlling();
    tokio::spawn(async move {
      if controlling {
        dispatcher.dispatch(request).await
      } else {
        dispatcher.pass_through(&request).await
      }
    })
  }

  /// `handle_fetch` and wait. A panicked request task becomes a 503.
  pub async fn fetch(&self, request: Request) -> Response {
    let url = request.url.clone();
    match self.handle_fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(%url, error = %e, "request task failed");
        Response::offline()
      }
    }
  }

  /// Wait for background cache writes and revalidations.
  pub async fn settle(&self) {
    self.dispatcher.settle().await;
  }

  /// Queue an upload that failed for lack of connectivity and arm the sync trigger.
  pub async fn queue_upload_for_sync(
    &self,
    file: FileBlob,
    target_url: &Url,
    headers: Headers,
  ) -> Result<i64> {
    let file_name = file.name.clone();
    let id = self
      .store
      .enqueue(NewUpload {
        file,
        target_url: target_url.to_string(),
        headers,
      })
      .await?;
    self.trigger.arm();

    info!(id, file = %file_name, "upload queued for sync");
    Ok(id)
  }

  /// Try the upload now; queue it if the network is unreachable.
  pub async fn upload(
    &self,
    file: FileBlob,
    target_url: &Url,
    headers: Headers,
  ) -> Result<UploadOutcome> {
    let request = Request::post(target_url.clone(), file.bytes.clone()).with_headers(&headers);

    match self.transport.send(&request).await {
      Ok(response) if response.is_success() => Ok(UploadOutcome::Delivered(response)),
      Ok(response) => Ok(UploadOutcome::Rejected(response)),
      Err(e) => {
        warn!(url = %target_url, error = %e, "upload failed, queueing");
        let id = self.queue_upload_for_sync(file, target_url, headers).await?;
        Ok(UploadOutcome::Queued(id))
      }
    }
  }

  pub async fn queued_upload_count(&self) -> Result<usize> {
    self.store.count().await
  }

  /// Badge count: an unreadable queue reads as empty.
  pub async fn queued_upload_count_or_zero(&self) -> usize {
    match self.queued_upload_count().await {
      Ok(count) => count,
      Err(e) => {
        warn!(error = %e, "could not read upload queue");
        0
      }
    }
  }

  pub fn queue(&self) -> &QueueStore {
    &self.store
  }

  /// Forward a host connectivity event.
  pub fn connectivity(&self, event: ConnectivityEvent) -> Option<JoinHandle<()>> {
    self.trigger.handle(event)
  }

  pub fn is_online(&self) -> bool {
    self.trigger.is_online()
  }

  /// Drain the queue now, regardless of connectivity events.
  pub async fn drain(&self) -> Result<DrainReport> {
    self.trigger.sync().await
  }
}
