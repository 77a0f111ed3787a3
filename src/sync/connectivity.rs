//! Online/offline state shared by the page and background contexts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared connectivity flag. Clones observe and update the same state.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state; listeners are woken only on a change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      if online {
        tracing::info!("connectivity restored");
      } else {
        tracing::warn!("connectivity lost, operations will be queued");
      }
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Poll `probe` every `interval` and record its answer.
  pub fn spawn_probe<F, Fut>(&self, interval: Duration, probe: F) -> JoinHandle<()>
  where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
  {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        connectivity.set_online(probe().await);
      }
    })
  }
}

/// Wait for the next offline → online transition, starting from `was_online`.
///
/// The caller keeps the starting state so that a change made before this
/// future is first polled is still seen. Returns `false` once the
/// connectivity state has been dropped.
pub async fn restored(rx: &mut watch::Receiver<bool>, mut was_online: bool) -> bool {
  loop {
    if rx.changed().await.is_err() {
      return false;
    }
    let online = *rx.borrow_and_update();
    if online && !was_online {
      return true;
    }
    was_online = online;
  }
}
