//! Page-side sync coordinator.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::background::BackgroundHandle;
use super::events::{SyncEvent, SyncPhase, SyncReport};
use super::replay::Replayer;
use crate::cache::SqliteStorage;
use crate::error::{CacheError, Result};
use crate::remote::RemoteExecutor;

/// Decides how a sync cycle runs and reports its outcome.
///
/// When the background dispatcher accepts registrations it owns replay and
/// the coordinator only registers tags. Otherwise the coordinator drains the
/// log itself. The two paths never run for the same cycle.
pub struct SyncCoordinator {
  replayer: Replayer,
  background: Option<BackgroundHandle>,
  events: broadcast::Sender<SyncEvent>,
  phase: Mutex<SyncPhase>,
  drain_lock: tokio::sync::Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(
    storage: Arc<SqliteStorage>,
    executor: Arc<dyn RemoteExecutor>,
    background: Option<BackgroundHandle>,
    events: broadcast::Sender<SyncEvent>,
  ) -> Self {
    Self {
      replayer: Replayer::new(storage, executor),
      background,
      events,
      phase: Mutex::new(SyncPhase::Idle),
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Phase of the most recent cycle.
  pub fn phase(&self) -> SyncPhase {
    self
      .phase
      .lock()
      .map(|phase| *phase)
      .unwrap_or(SyncPhase::Idle)
  }

  fn set_phase(&self, phase: SyncPhase) {
    if let Ok(mut current) = self.phase.lock() {
      *current = phase;
    }
  }

  /// Whether triggers can be handed to the background dispatcher.
  pub fn background_available(&self) -> bool {
    self
      .background
      .as_ref()
      .is_some_and(BackgroundHandle::is_available)
  }

  /// Register one operation's trigger, if the background path exists.
  pub fn register(&self, sync_tag: &str) -> Result<()> {
    match &self.background {
      Some(handle) => handle.register_trigger(sync_tag),
      None => Err(CacheError::DispatcherUnavailable),
    }
  }

  /// Run one sync cycle.
  pub async fn sync_now(&self) -> Result<SyncReport> {
    if self.background_available() {
      match self.delegate().await {
        Ok(report) => return Ok(report),
        Err(CacheError::DispatcherUnavailable) => {
          tracing::warn!("background dispatcher went away, draining manually");
        }
        Err(e) => return Err(e),
      }
    }
    self.drain().await
  }

  async fn delegate(&self) -> Result<SyncReport> {
    let pending = self.replayer.log().list().await?;
    for op in &pending {
      self.register(&op.sync_tag)?;
    }
    tracing::debug!(registered = pending.len(), "sync delegated to background dispatcher");
    self.set_phase(SyncPhase::Delegated);
    Ok(SyncReport::delegated(pending))
  }

  /// Replay every pending operation from here, in log order.
  pub async fn drain(&self) -> Result<SyncReport> {
    let _guard = self.drain_lock.lock().await;
    self.set_phase(SyncPhase::Draining);

    let pending = match self.replayer.log().list().await {
      Ok(pending) => pending,
      Err(e) => {
        self.set_phase(SyncPhase::Idle);
        return Err(e);
      }
    };
    let report = self.replayer.replay_all(pending).await;

    self.set_phase(report.phase);
    tracing::info!(
      synced = report.synced.len(),
      rejected = report.rejected.len(),
      deferred = report.deferred.len(),
      "manual sync finished"
    );
    for event in report.events() {
      let _ = self.events.send(event);
    }
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ExpiryPolicy, SystemClock};
  use crate::remote::testing::{offline, ScriptedExecutor};
  use crate::remote::{Method, RemoteError};
  use crate::sync::background::BackgroundDispatcher;
  use crate::sync::connectivity::Connectivity;
  use crate::sync::log::OperationLog;
  use crate::sync::operation::OperationIntent;
  use std::time::Duration;

  fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::open_in_memory(Arc::new(SystemClock), ExpiryPolicy::default()).unwrap())
  }

  async fn enqueue_all(log: &OperationLog, endpoints: &[&str]) -> Vec<crate::sync::PendingOperation> {
    let mut ops = Vec::new();
    for endpoint in endpoints {
      ops.push(
        log
          .enqueue(OperationIntent::new(Method::Post, *endpoint))
          .await
          .unwrap(),
      );
    }
    ops
  }

  #[tokio::test]
  async fn test_manual_drain_keeps_only_failed_operation() {
    let storage = storage();
    let log = OperationLog::new(Arc::clone(&storage));
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("/api/2", vec![offline()]);
    let (events, mut rx) = broadcast::channel(8);
    let coordinator = SyncCoordinator::new(storage, executor.clone(), None, events);

    let ops = enqueue_all(&log, &["/api/1", "/api/2", "/api/3"]).await;
    let report = coordinator.sync_now().await.unwrap();

    assert_eq!(report.synced, vec![ops[0].clone(), ops[2].clone()]);
    assert_eq!(report.deferred, vec![ops[1].clone()]);
    assert_eq!(coordinator.phase(), SyncPhase::PartiallyFailed);
    assert_eq!(log.list().await.unwrap(), vec![ops[1].clone()]);
    assert_eq!(
      rx.recv().await.unwrap(),
      SyncEvent::SyncComplete {
        items: vec![ops[0].clone(), ops[2].clone()]
      }
    );

    // The failed entry is retried on the next cycle.
    executor.script("/api/2", vec![Ok(serde_json::json!({}))]);
    let report = coordinator.sync_now().await.unwrap();
    assert_eq!(report.synced, vec![ops[1].clone()]);
    assert_eq!(coordinator.phase(), SyncPhase::Completed);
    assert!(log.is_empty().await.unwrap());
  }

  #[tokio::test]
  async fn test_rejected_operation_is_dropped_and_not_retried() {
    let storage = storage();
    let log = OperationLog::new(Arc::clone(&storage));
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script(
      "/api/repos",
      vec![Err(RemoteError::from_status(422, "name already exists"))],
    );
    let (events, mut rx) = broadcast::channel(8);
    let coordinator = SyncCoordinator::new(storage, executor.clone(), None, events);

    let ops = enqueue_all(&log, &["/api/repos"]).await;
    let report = coordinator.sync_now().await.unwrap();
    assert_eq!(report.rejected.len(), 1);
    assert!(matches!(
      rx.recv().await.unwrap(),
      SyncEvent::OperationRejected { status: 422, .. }
    ));
    assert!(log.get(&ops[0].id).await.unwrap().is_none());

    coordinator.sync_now().await.unwrap();
    assert_eq!(executor.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_available_background_takes_over_replay() {
    let storage = storage();
    let log = OperationLog::new(Arc::clone(&storage));
    let executor = Arc::new(ScriptedExecutor::new());
    let (events, mut rx) = broadcast::channel(8);
    let connectivity = Connectivity::new(false);
    let (handle, _task) = BackgroundDispatcher::new(
      Arc::clone(&storage),
      executor.clone(),
      events.clone(),
    )
    .spawn(connectivity.clone());
    let coordinator =
      SyncCoordinator::new(Arc::clone(&storage), executor.clone(), Some(handle), events);

    let ops = enqueue_all(&log, &["/api/1", "/api/2"]).await;
    let report = coordinator.sync_now().await.unwrap();
    assert_eq!(report.phase, SyncPhase::Delegated);
    assert_eq!(report.deferred, ops);
    // Nothing is replayed by the coordinator itself.
    assert!(executor.calls().is_empty());

    connectivity.set_online(true);
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(event, SyncEvent::SyncComplete { items: ops });
    assert_eq!(executor.endpoints(), vec!["/api/1", "/api/2"]);
  }

  #[tokio::test]
  async fn test_falls_back_to_drain_when_dispatcher_stopped() {
    let storage = storage();
    let log = OperationLog::new(Arc::clone(&storage));
    let executor = Arc::new(ScriptedExecutor::new());
    let (events, _rx) = broadcast::channel(8);
    let (handle, task) =
      BackgroundDispatcher::new(Arc::clone(&storage), executor.clone(), events.clone())
        .spawn(Connectivity::new(false));
    handle.shutdown();
    task.await.unwrap();

    let coordinator = SyncCoordinator::new(Arc::clone(&storage), executor.clone(), Some(handle), events);
    enqueue_all(&log, &["/api/1"]).await;
    let report = coordinator.sync_now().await.unwrap();
    assert_eq!(report.phase, SyncPhase::Completed);
    assert_eq!(report.synced.len(), 1);
  }
}
