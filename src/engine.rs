//! The cache engine: one explicit instance owning the store, the operation
//! log and the sync machinery.
//!
//! Everything the rest of the application does with cached data or queued
//! writes goes through [`CacheEngine`].

use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::cache::{CacheLayer, Clock, Collection, ExpiryPolicy, SqliteStorage, SystemClock};
use crate::error::Result;
use crate::remote::{RemoteExecutor, RemoteRequest};
use crate::sync::{
  mirror_result, restored, BackgroundDispatcher, BackgroundHandle, Connectivity, OperationIntent,
  OperationLog, PendingOperation, SyncCoordinator, SyncEvent, SyncPhase, SyncReport,
};

const EVENT_CAPACITY: usize = 64;

/// How to build a [`CacheEngine`].
#[derive(Clone)]
pub struct EngineOptions {
  /// Database file; `None` keeps the store in memory.
  pub db_path: Option<PathBuf>,
  pub expiry: ExpiryPolicy,
  /// Start the background dispatcher and register triggers with it.
  pub background_sync: bool,
  /// Connectivity assumed until the first probe answers.
  pub start_online: bool,
  /// Period of the expired-record sweep; `None` disables it.
  pub sweep_interval: Option<Duration>,
  pub clock: Arc<dyn Clock>,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      db_path: None,
      expiry: ExpiryPolicy::default(),
      background_sync: true,
      start_online: true,
      sweep_interval: Some(Duration::from_secs(60 * 60)),
      clock: Arc::new(SystemClock),
    }
  }
}

/// What happened to a [`CacheEngine::perform`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// Executed now; carries the upstream result.
  Completed(Value),
  /// Stored in the operation log for later replay.
  Queued(PendingOperation),
}

pub struct CacheEngine {
  storage: Arc<SqliteStorage>,
  log: OperationLog,
  executor: Arc<dyn RemoteExecutor>,
  connectivity: Connectivity,
  coordinator: Arc<SyncCoordinator>,
  background: Option<BackgroundHandle>,
  events: broadcast::Sender<SyncEvent>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
  /// Open the store and start the page and background tasks.
  ///
  /// Must be called from within a tokio runtime.
  pub async fn init(options: EngineOptions, executor: Arc<dyn RemoteExecutor>) -> Result<Self> {
    let EngineOptions {
      db_path,
      expiry,
      background_sync,
      start_online,
      sweep_interval,
      clock,
    } = options;

    let storage = tokio::task::spawn_blocking(move || match db_path {
      Some(path) => SqliteStorage::open(&path, clock, expiry),
      None => SqliteStorage::open_in_memory(clock, expiry),
    })
    .await??;
    let storage = Arc::new(storage);

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let connectivity = Connectivity::new(start_online);
    let mut tasks = Vec::new();

    let background = if background_sync {
      let (handle, task) = BackgroundDispatcher::new(
        Arc::clone(&storage),
        Arc::clone(&executor),
        events.clone(),
      )
      .spawn(connectivity.clone());
      tasks.push(task);
      Some(handle)
    } else {
      None
    };

    let coordinator = Arc::new(SyncCoordinator::new(
      Arc::clone(&storage),
      Arc::clone(&executor),
      background.clone(),
      events.clone(),
    ));
    tasks.push(spawn_connectivity_watcher(
      Arc::clone(&coordinator),
      connectivity.subscribe(),
    ));

    let engine = Self {
      log: OperationLog::new(Arc::clone(&storage)),
      storage,
      executor,
      connectivity,
      coordinator,
      background,
      events,
      tasks: Mutex::new(tasks),
    };
    if let Some(interval) = sweep_interval {
      engine.spawn_maintenance(interval);
    }

    tracing::info!(background_sync, start_online, "cache engine ready");
    Ok(engine)
  }

  /// Upsert records into a collection; returns their keys.
  ///
  /// Records written to `pendingOperations` must be well-formed operations
  /// with ids not yet in the log. They are queued like any other entry.
  pub async fn store_data(&self, collection: Collection, records: Vec<Value>) -> Result<Vec<String>> {
    if collection == Collection::PendingOperations {
      return self.store_operations(records).await;
    }
    self
      .storage
      .run(move |s| s.put(collection, &records))
      .await
  }

  async fn store_operations(&self, records: Vec<Value>) -> Result<Vec<String>> {
    let operations = records
      .iter()
      .map(|record| serde_json::from_value::<PendingOperation>(record.clone()))
      .collect::<std::result::Result<Vec<_>, _>>()?;
    let keys = self
      .storage
      .run(move |s| s.insert(Collection::PendingOperations, &records))
      .await?;
    for operation in &operations {
      self.register(operation);
    }
    Ok(keys)
  }

  /// A record's payload, or `None` when absent or expired.
  pub async fn retrieve_data(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
    let key = key.to_string();
    let record = self.storage.run(move |s| s.get(collection, &key)).await?;
    Ok(record.map(|r| r.data))
  }

  pub async fn retrieve_all(&self, collection: Collection) -> Result<Vec<Value>> {
    let records = self.storage.run(move |s| s.get_all(collection)).await?;
    Ok(records.into_iter().map(|r| r.data).collect())
  }

  pub async fn query_by_index(
    &self,
    collection: Collection,
    index: &str,
    value: &str,
  ) -> Result<Vec<Value>> {
    let (index, value) = (index.to_string(), value.to_string());
    let records = self
      .storage
      .run(move |s| s.query_by_index(collection, &index, &value))
      .await?;
    Ok(records.into_iter().map(|r| r.data).collect())
  }

  /// Delete one record. Returns whether it existed.
  pub async fn remove_data(&self, collection: Collection, key: &str) -> Result<bool> {
    let key = key.to_string();
    self.storage.run(move |s| s.delete(collection, &key)).await
  }

  /// Empty a collection, expired records included.
  pub async fn clear_store(&self, collection: Collection) -> Result<usize> {
    let removed = self.storage.run(move |s| s.clear(collection)).await?;
    tracing::info!(%collection, removed, "collection cleared");
    Ok(removed)
  }

  /// Queue an operation and register its trigger.
  pub async fn store_pending_operation(&self, intent: OperationIntent) -> Result<PendingOperation> {
    let operation = self.log.enqueue(intent).await?;
    self.register(&operation);
    Ok(operation)
  }

  /// Queued operations, oldest first.
  pub async fn get_pending_operations(&self) -> Result<Vec<PendingOperation>> {
    self.log.list().await
  }

  /// Cancel a queued operation. Unknown ids are not an error.
  pub async fn remove_pending_operation(&self, id: &str) -> Result<bool> {
    self.log.remove(id).await
  }

  /// Run a sync cycle now.
  pub async fn sync_now(&self) -> Result<SyncReport> {
    self.coordinator.sync_now().await
  }

  /// Phase of the coordinator's most recent cycle.
  pub fn sync_phase(&self) -> SyncPhase {
    self.coordinator.phase()
  }

  /// Execute a mutating call, or queue it when it cannot run now.
  ///
  /// Offline calls and retryable failures are queued under a single id.
  /// An upstream rejection is returned as `UpstreamRejected` and never queued.
  pub async fn perform(&self, intent: OperationIntent) -> Result<Outcome> {
    if !self.connectivity.is_online() {
      let operation = self.store_pending_operation(intent).await?;
      tracing::info!(op_id = %operation.id, endpoint = %operation.endpoint, "offline, operation queued");
      return Ok(Outcome::Queued(operation));
    }

    let operation = PendingOperation::new(intent, self.storage.now());
    let request = RemoteRequest {
      body: operation.body.clone(),
      ..RemoteRequest::new(operation.method, operation.endpoint.clone())
    };

    match self.executor.execute(&request).await {
      Ok(value) => {
        if let Some(collection) = operation.mirror {
          mirror_result(&self.storage, collection, &value).await;
        }
        Ok(Outcome::Completed(value))
      }
      Err(e) if e.is_retryable() => {
        tracing::warn!(endpoint = %operation.endpoint, error = %e, "call failed, operation queued");
        self.log.append(operation.clone()).await?;
        self.register(&operation);
        Ok(Outcome::Queued(operation))
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Run a read-only call through the executor, bypassing the queue.
  pub async fn fetch_remote(&self, endpoint: &str) -> Result<Value> {
    let value = self.executor.execute(&RemoteRequest::get(endpoint)).await?;
    Ok(value)
  }

  /// Listen for sync completions and rejections.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Read-through access for typed clients.
  pub fn cache_layer(&self) -> CacheLayer {
    CacheLayer::new(Arc::clone(&self.storage))
  }

  /// Remove every expired record now.
  pub async fn sweep_expired(&self) -> Result<usize> {
    self.storage.run(|s| s.sweep_expired()).await
  }

  /// Sweep expired records every `interval` until the engine is dropped.
  pub fn spawn_maintenance(&self, interval: Duration) {
    let storage = Arc::clone(&self.storage);
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        match storage.run(|s| s.sweep_expired()).await {
          Ok(0) => {}
          Ok(removed) => tracing::info!(removed, "expired records swept"),
          Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
        }
      }
    });
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.push(task);
    }
  }

  /// Stop the background dispatcher and every engine task.
  pub fn shutdown(&self) {
    if let Some(handle) = &self.background {
      handle.shutdown();
    }
    if let Ok(mut tasks) = self.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }

  fn register(&self, operation: &PendingOperation) {
    if self.background.is_none() {
      return;
    }
    if let Err(e) = self.coordinator.register(&operation.sync_tag) {
      tracing::debug!(
        sync_tag = %operation.sync_tag,
        error = %e,
        "trigger not registered, next sync drains manually"
      );
    }
  }
}

impl Drop for CacheEngine {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Start a sync cycle whenever connectivity comes back.
///
/// A live background dispatcher sees the same transition and replays on its
/// own, so the watcher only drains when it is gone.
fn spawn_connectivity_watcher(
  coordinator: Arc<SyncCoordinator>,
  mut rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
  let mut online = *rx.borrow_and_update();
  tokio::spawn(async move {
    while restored(&mut rx, online).await {
      online = true;
      if coordinator.background_available() {
        continue;
      }
      match coordinator.sync_now().await {
        Ok(report) => tracing::debug!(phase = ?report.phase, "sync after reconnect finished"),
        Err(e) => tracing::warn!(error = %e, "sync after reconnect failed"),
      }
    }
  })
}
