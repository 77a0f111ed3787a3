//! Background dispatcher: replays operations independently of the page.
//!
//! The dispatcher runs as its own task and is driven by two inputs: trigger
//! registrations arriving over a channel, and connectivity transitions. The
//! only in-memory state it keeps is the set of registered sync tags; every
//! replay reads the durable operation log, so a trigger can fire with no page
//! alive at all.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::connectivity::Connectivity;
use super::events::{SyncEvent, SyncReport};
use super::replay::Replayer;
use crate::cache::SqliteStorage;
use crate::error::{CacheError, Result};
use crate::remote::RemoteExecutor;

#[derive(Debug)]
enum Command {
  Register(String),
  Shutdown,
}

/// Cheap handle used by the page to register triggers.
#[derive(Clone)]
pub struct BackgroundHandle {
  tx: mpsc::UnboundedSender<Command>,
}

impl BackgroundHandle {
  /// Ask for a one-time replay of `sync_tag` the next time we are online.
  ///
  /// Fails when the dispatcher is gone; callers then drain by hand.
  pub fn register_trigger(&self, sync_tag: &str) -> Result<()> {
    self
      .tx
      .send(Command::Register(sync_tag.to_string()))
      .map_err(|_| CacheError::DispatcherUnavailable)
  }

  pub fn is_available(&self) -> bool {
    !self.tx.is_closed()
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(Command::Shutdown);
  }
}

pub struct BackgroundDispatcher {
  replayer: Replayer,
  events: broadcast::Sender<SyncEvent>,
}

impl BackgroundDispatcher {
  pub fn new(
    storage: Arc<SqliteStorage>,
    executor: Arc<dyn RemoteExecutor>,
    events: broadcast::Sender<SyncEvent>,
  ) -> Self {
    Self {
      replayer: Replayer::new(storage, executor),
      events,
    }
  }

  /// Start the dispatcher task.
  pub fn spawn(self, connectivity: Connectivity) -> (BackgroundHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(self.run(rx, connectivity));
    (BackgroundHandle { tx }, task)
  }

  /// Replay every queued operation carrying `sync_tag`.
  ///
  /// Reads only the durable log, so it can be called from any context.
  pub async fn on_trigger(&self, sync_tag: &str) -> Result<SyncReport> {
    let operations = self.replayer.log().find_by_tag(sync_tag).await?;
    Ok(self.replayer.replay_all(operations).await)
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>, connectivity: Connectivity) {
    let mut online_rx = connectivity.subscribe();
    let mut was_online = *online_rx.borrow_and_update();
    let mut registered = BTreeSet::new();

    // Registrations outlive the page: pick up whatever is still queued.
    match self.replayer.log().list().await {
      Ok(pending) => registered.extend(pending.into_iter().map(|op| op.sync_tag)),
      Err(e) => tracing::warn!(error = %e, "failed to read pending operations at startup"),
    }
    if was_online {
      self.fire(&mut registered).await;
    }

    loop {
      tokio::select! {
        command = rx.recv() => match command {
          Some(Command::Register(tag)) => {
            registered.insert(tag);
            // Batch registrations that arrived together into one cycle.
            let mut shutdown = false;
            while let Ok(command) = rx.try_recv() {
              match command {
                Command::Register(tag) => {
                  registered.insert(tag);
                }
                Command::Shutdown => shutdown = true,
              }
            }
            if connectivity.is_online() {
              self.fire(&mut registered).await;
            }
            if shutdown {
              break;
            }
          }
          Some(Command::Shutdown) | None => break,
        },
        changed = online_rx.changed() => {
          if changed.is_err() {
            break;
          }
          let online = *online_rx.borrow_and_update();
          if online && !was_online {
            self.fire(&mut registered).await;
          }
          was_online = online;
        }
      }
    }

    tracing::debug!(pending_tags = registered.len(), "background dispatcher stopped");
  }

  /// Run one cycle over every registered tag, in log order.
  async fn fire(&self, registered: &mut BTreeSet<String>) {
    if registered.is_empty() {
      return;
    }

    let pending = match self.replayer.log().list().await {
      Ok(pending) => pending,
      Err(e) => {
        tracing::warn!(error = %e, "failed to read operation log, keeping registrations");
        return;
      }
    };

    let mut order: Vec<String> = Vec::new();
    for op in &pending {
      if registered.contains(&op.sync_tag) && !order.contains(&op.sync_tag) {
        order.push(op.sync_tag.clone());
      }
    }

    let mut report = SyncReport::empty();
    for tag in &order {
      match self.on_trigger(tag).await {
        Ok(cycle) => report.merge(cycle),
        Err(e) => {
          tracing::warn!(sync_tag = %tag, error = %e, "background replay failed");
          report.deferred.extend(pending.iter().filter(|op| &op.sync_tag == tag).cloned());
        }
      }
    }

    // Tags whose operations are gone (synced, rejected, or cancelled) are consumed.
    registered.retain(|tag| report.deferred.iter().any(|op| &op.sync_tag == tag));

    tracing::info!(
      synced = report.synced.len(),
      rejected = report.rejected.len(),
      deferred = report.deferred.len(),
      "background sync cycle finished"
    );
    for event in report.events() {
      // No receivers just means no page is open.
      let _ = self.events.send(event);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ExpiryPolicy, SystemClock};
  use crate::remote::testing::{offline, ScriptedExecutor};
  use crate::remote::{Method, RemoteError};
  use crate::sync::log::OperationLog;
  use crate::sync::operation::OperationIntent;
  use std::time::Duration;

  struct Fixture {
    storage: Arc<SqliteStorage>,
    log: OperationLog,
    executor: Arc<ScriptedExecutor>,
    events: broadcast::Sender<SyncEvent>,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(
      SqliteStorage::open_in_memory(Arc::new(SystemClock), ExpiryPolicy::default()).unwrap(),
    );
    let (events, _) = broadcast::channel(16);
    Fixture {
      log: OperationLog::new(Arc::clone(&storage)),
      storage,
      executor: Arc::new(ScriptedExecutor::new()),
      events,
    }
  }

  impl Fixture {
    fn dispatcher(&self) -> BackgroundDispatcher {
      BackgroundDispatcher::new(
        Arc::clone(&self.storage),
        self.executor.clone(),
        self.events.clone(),
      )
    }
  }

  async fn next_event(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("timed out waiting for sync event")
      .unwrap()
  }

  #[tokio::test]
  async fn test_on_trigger_replays_only_matching_tag() {
    let fx = fixture();
    let a = fx
      .log
      .enqueue(OperationIntent::new(Method::Post, "/api/a"))
      .await
      .unwrap();
    fx.log
      .enqueue(OperationIntent::new(Method::Post, "/api/b"))
      .await
      .unwrap();

    let report = fx.dispatcher().on_trigger(&a.sync_tag).await.unwrap();
    assert_eq!(report.synced, vec![a]);
    assert_eq!(fx.executor.endpoints(), vec!["/api/a"]);
    assert_eq!(fx.log.len().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_restored_connectivity_replays_registered_operations() {
    let fx = fixture();
    fx.executor.script("/api/second", vec![offline()]);
    let mut ops = Vec::new();
    for endpoint in ["/api/first", "/api/second", "/api/third"] {
      ops.push(
        fx.log
          .enqueue(OperationIntent::new(Method::Post, endpoint))
          .await
          .unwrap(),
      );
    }

    let connectivity = Connectivity::new(false);
    let mut events = fx.events.subscribe();
    let (handle, task) = fx.dispatcher().spawn(connectivity.clone());
    for op in &ops {
      handle.register_trigger(&op.sync_tag).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fx.executor.calls().is_empty());

    connectivity.set_online(true);
    match next_event(&mut events).await {
      SyncEvent::SyncComplete { items } => {
        assert_eq!(items, vec![ops[0].clone(), ops[2].clone()]);
      }
      other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(fx.log.list().await.unwrap(), vec![ops[1].clone()]);

    handle.shutdown();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_registration_while_online_fires_immediately() {
    let fx = fixture();
    let op = fx
      .log
      .enqueue(OperationIntent::new(Method::Put, "/api/x"))
      .await
      .unwrap();
    let mut events = fx.events.subscribe();
    let (handle, _task) = fx.dispatcher().spawn(Connectivity::new(true));

    // Startup picks the operation up from the durable log even before registration.
    match next_event(&mut events).await {
      SyncEvent::SyncComplete { items } => assert_eq!(items, vec![op.clone()]),
      other => panic!("unexpected event {:?}", other),
    }
    handle.register_trigger(&op.sync_tag).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.executor.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_rejected_operation_is_not_retried() {
    let fx = fixture();
    fx.executor.script(
      "/api/bad",
      vec![Err(RemoteError::from_status(422, "Unprocessable Entity"))],
    );
    let op = fx
      .log
      .enqueue(OperationIntent::new(Method::Post, "/api/bad"))
      .await
      .unwrap();

    let connectivity = Connectivity::new(false);
    let mut events = fx.events.subscribe();
    let (handle, _task) = fx.dispatcher().spawn(connectivity.clone());
    handle.register_trigger(&op.sync_tag).unwrap();
    connectivity.set_online(true);

    match next_event(&mut events).await {
      SyncEvent::OperationRejected { operation, status, .. } => {
        assert_eq!(operation, op);
        assert_eq!(status, 422);
      }
      other => panic!("unexpected event {:?}", other),
    }
    assert!(fx.log.is_empty().await.unwrap());

    connectivity.set_online(false);
    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.executor.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_register_after_shutdown_is_unavailable() {
    let fx = fixture();
    let (handle, task) = fx.dispatcher().spawn(Connectivity::new(false));
    handle.shutdown();
    task.await.unwrap();
    assert!(!handle.is_available());
    assert!(matches!(
      handle.register_trigger("sync-x"),
      Err(CacheError::DispatcherUnavailable)
    ));
  }
}
