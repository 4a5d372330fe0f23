use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use url::Url;

use crate::remote::{Request, Transport};

/// Connectivity signals from the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

/// Emits connectivity events by probing the remote API on a fixed tick.
///
/// Any HTTP response counts as online; only transport failures count as
/// offline. Events are sent on transitions only, starting with the first probe.
pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  probe_url: Url,
  interval: Duration,
}

impl ConnectivityMonitor {
  pub fn new(transport: Arc<dyn Transport>, probe_url: Url, interval: Duration) -> Self {
    Self {
      transport,
      probe_url,
      interval,
    }
  }

  /// Probe until the receiving side goes away.
  pub fn spawn(self, tx: mpsc::UnboundedSender<ConnectivityEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut last: Option<ConnectivityEvent> = None;

      loop {
        ticker.tick().await;
        if tx.is_closed() {
          break;
        }

        let event = match self.transport.send(&Request::get(self.probe_url.clone())).await {
          Ok(_) => ConnectivityEvent::Online,
          Err(e) => {
            debug!(error = %e, "connectivity probe failed");
            ConnectivityEvent::Offline
          }
        };

        if last != Some(event) {
          last = Some(event);
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::mock::MockTransport;

  #[tokio::test]
  async fn test_emits_transitions_only() {
    let transport = Arc::new(MockTransport::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = ConnectivityMonitor::new(
      transport.clone(),
      Url::parse("https://files.example/api/health").unwrap(),
      Duration::from_millis(5),
    );
    let handle = monitor.spawn(tx);

    assert_eq!(rx.recv().await, Some(ConnectivityEvent::Online));

    transport.set_online(false);
    assert_eq!(rx.recv().await, Some(ConnectivityEvent::Offline));

    transport.set_online(true);
    assert_eq!(rx.recv().await, Some(ConnectivityEvent::Online));
    assert!(transport.calls_to("/api/health") >= 3);

    drop(rx);
    handle.await.unwrap();
  }
}
