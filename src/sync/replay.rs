//! Replaying queued operations through the executor.
//!
//! Shared by the coordinator's manual drain and the background dispatcher.
//! Nothing here holds a store transaction across the network call: the log is
//! read, the executor is awaited, and the outcome is written back afterwards.

use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

use super::events::{RejectedOperation, SyncReport};
use super::log::OperationLog;
use super::operation::PendingOperation;
use crate::cache::{Collection, SqliteStorage};
use crate::error::Result;
use crate::remote::{RemoteError, RemoteExecutor};

/// Result of replaying one operation.
#[derive(Debug)]
pub enum ReplayOutcome {
  /// Confirmed; removed from the log.
  Synced(Value),
  /// Refused by the upstream; removed from the log.
  Rejected { status: u16, message: String },
  /// Transient failure; left in the log.
  Deferred(RemoteError),
}

#[derive(Clone)]
pub struct Replayer {
  storage: Arc<SqliteStorage>,
  log: OperationLog,
  executor: Arc<dyn RemoteExecutor>,
}

impl Replayer {
  pub fn new(storage: Arc<SqliteStorage>, executor: Arc<dyn RemoteExecutor>) -> Self {
    Self {
      log: OperationLog::new(Arc::clone(&storage)),
      storage,
      executor,
    }
  }

  pub fn log(&self) -> &OperationLog {
    &self.log
  }

  /// Replay a single operation and record the outcome in the log.
  pub async fn replay(&self, operation: &PendingOperation) -> Result<ReplayOutcome> {
    let span = tracing::info_span!("replay", op_id = %operation.id, sync_tag = %operation.sync_tag);
    self.replay_inner(operation).instrument(span).await
  }

  async fn replay_inner(&self, operation: &PendingOperation) -> Result<ReplayOutcome> {
    match self.executor.execute(&operation.to_request()).await {
      Ok(value) => {
        self.log.remove(&operation.id).await?;
        if let Some(collection) = operation.mirror {
          mirror_result(&self.storage, collection, &value).await;
        }
        tracing::info!(endpoint = %operation.endpoint, "operation synced");
        Ok(ReplayOutcome::Synced(value))
      }
      Err(RemoteError::Rejected { status, message }) => {
        self.log.remove(&operation.id).await?;
        tracing::warn!(
          endpoint = %operation.endpoint,
          status,
          %message,
          "operation rejected upstream, dropped from queue"
        );
        Ok(ReplayOutcome::Rejected { status, message })
      }
      Err(e) => {
        tracing::info!(endpoint = %operation.endpoint, error = %e, "operation deferred");
        Ok(ReplayOutcome::Deferred(e))
      }
    }
  }

  /// Replay operations one after another; a failure never stops the rest.
  ///
  /// An operation whose outcome cannot be written back stays in the log and
  /// is reported as deferred, so it is sent again on the next cycle.
  pub async fn replay_all(&self, operations: Vec<PendingOperation>) -> SyncReport {
    let mut report = SyncReport::empty();
    for operation in operations {
      match self.replay(&operation).await {
        Ok(ReplayOutcome::Synced(_)) => report.synced.push(operation),
        Ok(ReplayOutcome::Rejected { status, message }) => report.rejected.push(RejectedOperation {
          operation,
          status,
          message,
        }),
        Ok(ReplayOutcome::Deferred(_)) => report.deferred.push(operation),
        Err(e) => {
          tracing::warn!(
            op_id = %operation.id,
            error = %e,
            "failed to record replay outcome, keeping operation"
          );
          report.deferred.push(operation);
        }
      }
    }
    report.settle();
    report
  }
}

/// Upsert a successful result into its collection; best-effort.
pub(crate) async fn mirror_result(storage: &Arc<SqliteStorage>, collection: Collection, value: &Value) {
  let records = match value {
    Value::Array(items) => items.clone(),
    Value::Object(_) => vec![value.clone()],
    _ => return,
  };
  let records: Vec<Value> = records
    .into_iter()
    .filter(|record| collection.key_of(record).is_ok())
    .collect();
  if records.is_empty() {
    tracing::debug!(%collection, "result has no cacheable records");
    return;
  }

  if let Err(e) = storage.run(move |s| s.put(collection, &records)).await {
    tracing::warn!(%collection, error = %e, "failed to mirror result into cache");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ExpiryPolicy, SystemClock};
  use crate::remote::testing::{offline, ScriptedExecutor};
  use crate::remote::Method;
  use crate::sync::events::SyncPhase;
  use crate::sync::operation::OperationIntent;
  use serde_json::json;

  fn setup() -> (Replayer, Arc<ScriptedExecutor>, Arc<SqliteStorage>) {
    let storage = Arc::new(
      SqliteStorage::open_in_memory(Arc::new(SystemClock), ExpiryPolicy::default()).unwrap(),
    );
    let executor = Arc::new(ScriptedExecutor::new());
    let replayer = Replayer::new(Arc::clone(&storage), executor.clone());
    (replayer, executor, storage)
  }

  #[tokio::test]
  async fn test_replay_order_matches_enqueue_order() {
    let (replayer, executor, _storage) = setup();
    replayer
      .log()
      .enqueue(OperationIntent::new(Method::Post, "/api/a"))
      .await
      .unwrap();
    replayer
      .log()
      .enqueue(OperationIntent::new(Method::Post, "/api/b"))
      .await
      .unwrap();

    let pending = replayer.log().list().await.unwrap();
    let report = replayer.replay_all(pending).await;

    assert_eq!(executor.endpoints(), vec!["/api/a", "/api/b"]);
    assert_eq!(report.synced.len(), 2);
    assert_eq!(report.phase, SyncPhase::Completed);
    assert!(replayer.log().is_empty().await.unwrap());
  }

  #[tokio::test]
  async fn test_failures_do_not_stop_the_drain() {
    let (replayer, executor, _storage) = setup();
    executor.script("/api/b", vec![offline()]);
    executor.script(
      "/api/c",
      vec![Err(RemoteError::from_status(422, "Validation Failed"))],
    );
    for endpoint in ["/api/a", "/api/b", "/api/c", "/api/d"] {
      replayer
        .log()
        .enqueue(OperationIntent::new(Method::Post, endpoint))
        .await
        .unwrap();
    }

    let pending = replayer.log().list().await.unwrap();
    let report = replayer.replay_all(pending).await;

    assert_eq!(executor.endpoints().len(), 4);
    assert_eq!(report.phase, SyncPhase::PartiallyFailed);
    assert_eq!(report.synced.len(), 2);
    assert_eq!(report.rejected[0].status, 422);
    let remaining: Vec<String> = replayer
      .log()
      .list()
      .await
      .unwrap()
      .into_iter()
      .map(|op| op.endpoint)
      .collect();
    assert_eq!(remaining, vec!["/api/b"]);
  }

  #[tokio::test]
  async fn test_successful_result_is_mirrored() {
    let (replayer, executor, storage) = setup();
    executor.script(
      "/api/repos",
      vec![Ok(json!({ "id": 5, "name": "new", "owner": { "login": "octocat" } }))],
    );
    let op = replayer
      .log()
      .enqueue(
        OperationIntent::new(Method::Post, "/api/repos")
          .with_body(json!({ "name": "new" }))
          .mirror_into(Collection::Repositories),
      )
      .await
      .unwrap();

    assert!(matches!(
      replayer.replay(&op).await.unwrap(),
      ReplayOutcome::Synced(_)
    ));
    let cached = storage.get(Collection::Repositories, "5").unwrap().unwrap();
    assert_eq!(cached.data["name"], "new");
  }

  #[tokio::test]
  async fn test_store_failure_keeps_operation_and_continues() {
    let (replayer, executor, storage) = setup();
    let mut ops = Vec::new();
    for endpoint in ["/api/a", "/api/b", "/api/c"] {
      ops.push(
        replayer
          .log()
          .enqueue(OperationIntent::new(Method::Post, endpoint))
          .await
          .unwrap(),
      );
    }
    // Deleting the second entry fails after its call went through.
    storage
      .execute_batch(&format!(
        "CREATE TRIGGER keep_entry BEFORE DELETE ON records WHEN OLD.key = '{}'
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        ops[1].id
      ))
      .unwrap();

    let pending = replayer.log().list().await.unwrap();
    let report = replayer.replay_all(pending).await;

    assert_eq!(executor.endpoints(), vec!["/api/a", "/api/b", "/api/c"]);
    assert_eq!(report.synced, vec![ops[0].clone(), ops[2].clone()]);
    assert_eq!(report.deferred, vec![ops[1].clone()]);
    assert_eq!(report.phase, SyncPhase::PartiallyFailed);
    assert_eq!(
      report.events(),
      vec![crate::sync::events::SyncEvent::SyncComplete {
        items: vec![ops[0].clone(), ops[2].clone()]
      }]
    );
    assert_eq!(replayer.log().list().await.unwrap(), vec![ops[1].clone()]);
  }
}
