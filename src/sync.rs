//! Sync trigger: drains the upload queue when connectivity returns.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::ConnectivityEvent;
use crate::queue::{DrainReport, Drainer};

/// Reacts to connectivity events by draining the queue.
///
/// The trigger is armed whenever something is queued and disarms once a
/// drain leaves the queue empty. An optional sweep interval drains on a timer
/// as well, for hosts whose connectivity events can be missed.
pub struct SyncTrigger {
  drainer: Arc<Drainer>,
  /// Last connectivity event seen, `None` before the first one.
  connectivity: Mutex<Option<ConnectivityEvent>>,
  armed: AtomicBool,
  sweep_interval: Option<Duration>,
}

impl SyncTrigger {
  pub fn new(drainer: Arc<Drainer>, sweep_interval: Option<Duration>) -> Self {
    Self {
      drainer,
      connectivity: Mutex::new(None),
      armed: AtomicBool::new(false),
      sweep_interval,
    }
  }

  /// Connectivity is assumed until an offline event says otherwise.
  pub fn is_online(&self) -> bool {
    *self.last_seen() != Some(ConnectivityEvent::Offline)
  }

  fn last_seen(&self) -> MutexGuard<'_, Option<ConnectivityEvent>> {
    self
      .connectivity
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_armed(&self) -> bool {
    self.armed.load(Ordering::SeqCst)
  }

  /// Request a drain on the next reconnect.
  pub fn arm(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }

  /// Arm if uploads survived from a previous run.
  pub async fn arm_if_pending(&self) -> Result<bool> {
    let pending = self.drainer.store().count().await?;
    if pending > 0 {
      info!(pending, "queued uploads found, sync armed");
      self.arm();
    }
    Ok(pending > 0)
  }

  /// Apply one connectivity event. Returns the drain task if one was started.
  pub fn handle(self: &Arc<Self>, event: ConnectivityEvent) -> Option<JoinHandle<()>> {
    let previous = self.last_seen().replace(event);
    if previous == Some(event) {
      return None;
    }

    match event {
      ConnectivityEvent::Offline => {
        info!("connectivity lost");
        None
      }
      ConnectivityEvent::Online => {
        info!("connectivity restored");
        if !self.is_armed() {
          return None;
        }
        Some(self.spawn_sync())
      }
    }
  }

  fn spawn_sync(self: &Arc<Self>) -> JoinHandle<()> {
    let trigger = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = trigger.sync().await {
        warn!(error = %e, "upload sync failed");
      }
    })
  }

  /// Drain now, re-arming if anything is left afterwards.
  ///
  /// The flag is cleared before the drain starts, so an `arm()` that lands
  /// while the drain runs is never overwritten.
  pub async fn sync(&self) -> Result<DrainReport> {
    self.armed.store(false, Ordering::SeqCst);

    let report = match self.drainer.drain().await {
      Ok(report) => report,
      Err(e) => {
        self.arm();
        return Err(e);
      }
    };

    match self.drainer.store().count().await {
      Ok(0) => debug!("upload queue empty, sync disarmed"),
      Ok(pending) => {
        debug!(pending, "uploads left after drain, sync stays armed");
        self.arm();
      }
      Err(e) => {
        warn!(error = %e, "could not count queue after drain");
        self.arm();
      }
    }

    Ok(report)
  }

  /// Consume connectivity events until the sender side closes.
  pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectivityEvent>) {
    let mut sweep = self.sweep_interval.map(tokio::time::interval);

    loop {
      let sweep_tick = async {
        match sweep.as_mut() {
          Some(ticker) => {
            ticker.tick().await;
          }
          None => std::future::pending::<()>().await,
        }
      };

      tokio::select! {
        event = events.recv() => match event {
          Some(event) => {
            self.handle(event);
          }
          None => break,
        },
        _ = sweep_tick => {
          if self.is_online() && self.is_armed() {
            debug!("periodic sync sweep");
            self.spawn_sync();
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{FileBlob, NewUpload, QueueStore};
  use crate::remote::mock::MockTransport;
  use crate::remote::Headers;

  async fn trigger(sweep: Option<Duration>) -> (Arc<SyncTrigger>, QueueStore, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/api/upload", 200, "");
    let store = QueueStore::open_in_memory().unwrap();
    let drainer = Arc::new(Drainer::new(store.clone(), transport.clone()));
    (Arc::new(SyncTrigger::new(drainer, sweep)), store, transport)
  }

  async fn enqueue(store: &QueueStore) {
    store
      .enqueue(NewUpload {
        file: FileBlob::new("a.txt", b"a".to_vec()),
        target_url: "https://files.example/api/upload".to_string(),
        headers: Headers::new(),
      })
      .await
      .unwrap();
  }

  async fn wait_until_empty(store: &QueueStore) {
    tokio::time::timeout(Duration::from_secs(2), async {
      while store.count().await.unwrap() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("queue was not drained");
  }

  #[tokio::test]
  async fn test_reconnect_drains_when_armed() {
    let (trigger, store, _) = trigger(None).await;
    enqueue(&store).await;
    trigger.arm();

    assert!(trigger.handle(ConnectivityEvent::Offline).is_none());
    assert!(!trigger.is_online());

    let drain = trigger.handle(ConnectivityEvent::Online).unwrap();
    drain.await.unwrap();

    assert!(trigger.is_online());
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(!trigger.is_armed());
  }

  #[tokio::test]
  async fn test_reconnect_without_arm_does_nothing() {
    let (trigger, store, transport) = trigger(None).await;
    enqueue(&store).await;

    trigger.handle(ConnectivityEvent::Offline);
    assert!(trigger.handle(ConnectivityEvent::Online).is_none());
    assert_eq!(transport.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_repeated_online_is_not_a_transition() {
    let (trigger, _, _) = trigger(None).await;
    trigger.arm();

    assert!(trigger.handle(ConnectivityEvent::Online).is_some());
    assert!(trigger.handle(ConnectivityEvent::Online).is_none());
  }

  #[tokio::test]
  async fn test_failed_drain_stays_armed() {
    let (trigger, store, transport) = trigger(None).await;
    enqueue(&store).await;
    transport.fail("/api/upload");
    trigger.arm();

    let report = trigger.sync().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(trigger.is_armed());
  }

  #[tokio::test]
  async fn test_arm_during_slow_drain_is_kept() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(50)));
    transport.respond("/api/upload", 200, "");
    let store = QueueStore::open_in_memory().unwrap();
    let drainer = Arc::new(Drainer::new(store.clone(), transport.clone()));
    let trigger = Arc::new(SyncTrigger::new(drainer, None));
    enqueue(&store).await;
    trigger.arm();

    let sync = tokio::spawn({
      let trigger = Arc::clone(&trigger);
      async move { trigger.sync().await }
    });
    // The first delivery is in flight once the transport has seen it.
    while transport.total_calls() == 0 {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(!trigger.is_armed());

    enqueue(&store).await;
    trigger.arm();
    let report = sync.await.unwrap().unwrap();

    assert_eq!(report.delivered.len(), 1);
    assert!(trigger.is_armed());
    assert_eq!(store.count().await.unwrap(), 1);

    // The upload queued mid-drain goes out on the next reconnect.
    trigger.handle(ConnectivityEvent::Offline);
    trigger
      .handle(ConnectivityEvent::Online)
      .expect("trigger should still be armed")
      .await
      .unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(!trigger.is_armed());
  }

  #[tokio::test]
  async fn test_connectivity_is_unknown_until_first_event() {
    let (trigger, _, _) = trigger(None).await;
    assert!(trigger.is_online());

    assert!(trigger.handle(ConnectivityEvent::Offline).is_none());
    assert!(!trigger.is_online());
    assert!(trigger.handle(ConnectivityEvent::Offline).is_none());
    assert!(!trigger.is_online());
  }

  #[tokio::test]
  async fn test_arm_if_pending() {
    let (trigger, store, _) = trigger(None).await;
    assert!(!trigger.arm_if_pending().await.unwrap());

    enqueue(&store).await;
    assert!(trigger.arm_if_pending().await.unwrap());
    assert!(trigger.is_armed());
  }

  #[tokio::test]
  async fn test_run_consumes_events() {
    let (trigger, store, _) = trigger(None).await;
    enqueue(&store).await;
    trigger.arm();

    let (tx, rx) = mpsc::unbounded_channel();
    let runner = tokio::spawn(Arc::clone(&trigger).run(rx));
    tx.send(ConnectivityEvent::Offline).unwrap();
    tx.send(ConnectivityEvent::Online).unwrap();

    wait_until_empty(&store).await;
    drop(tx);
    runner.await.unwrap();
  }

  #[tokio::test]
  async fn test_sweep_drains_without_events() {
    let (trigger, store, _) = trigger(Some(Duration::from_millis(10))).await;
    enqueue(&store).await;
    trigger.arm();

    let (tx, rx) = mpsc::unbounded_channel();
    let runner = tokio::spawn(Arc::clone(&trigger).run(rx));

    wait_until_empty(&store).await;
    drop(tx);
    runner.await.unwrap();
  }
}
