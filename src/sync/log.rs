//! The operation log: an ordered, durable write-ahead queue.

use std::sync::Arc;

use super::operation::{OperationIntent, PendingOperation};
use crate::cache::{CachedRecord, Collection, SqliteStorage};
use crate::error::Result;

/// Queue of pending operations, kept in the store's `pendingOperations` collection.
///
/// Holds no state of its own, so any number of handles (page or background)
/// see the same queue.
#[derive(Clone)]
pub struct OperationLog {
  storage: Arc<SqliteStorage>,
}

impl OperationLog {
  pub fn new(storage: Arc<SqliteStorage>) -> Self {
    Self { storage }
  }

  /// Store a new operation. The entry is committed before this returns.
  pub async fn enqueue(&self, intent: OperationIntent) -> Result<PendingOperation> {
    let operation = PendingOperation::new(intent, self.storage.now());
    self.append(operation.clone()).await?;
    Ok(operation)
  }

  /// Store an operation that already has its identity.
  ///
  /// Entries are never rewritten: an id already in the log is refused.
  pub async fn append(&self, operation: PendingOperation) -> Result<()> {
    let record = serde_json::to_value(&operation)?;
    self
      .storage
      .run(move |s| s.insert(Collection::PendingOperations, &[record]))
      .await?;
    tracing::debug!(
      op_id = %operation.id,
      sync_tag = %operation.sync_tag,
      endpoint = %operation.endpoint,
      "operation queued"
    );
    Ok(())
  }

  /// All queued operations, oldest first.
  pub async fn list(&self) -> Result<Vec<PendingOperation>> {
    let records = self
      .storage
      .run(|s| s.get_all(Collection::PendingOperations))
      .await?;
    decode_sorted(records)
  }

  /// Queued operations carrying a sync tag, oldest first.
  pub async fn find_by_tag(&self, sync_tag: &str) -> Result<Vec<PendingOperation>> {
    let sync_tag = sync_tag.to_string();
    let records = self
      .storage
      .run(move |s| s.query_by_index(Collection::PendingOperations, "syncTag", &sync_tag))
      .await?;
    decode_sorted(records)
  }

  pub async fn get(&self, id: &str) -> Result<Option<PendingOperation>> {
    let id = id.to_string();
    let record = self
      .storage
      .run(move |s| s.get(Collection::PendingOperations, &id))
      .await?;
    record
      .map(|r| serde_json::from_value(r.data).map_err(Into::into))
      .transpose()
  }

  /// Delete an entry. Removing an unknown id is not an error.
  pub async fn remove(&self, id: &str) -> Result<bool> {
    let id = id.to_string();
    self
      .storage
      .run(move |s| s.delete(Collection::PendingOperations, &id))
      .await
  }

  pub async fn len(&self) -> Result<usize> {
    Ok(self.list().await?.len())
  }

  pub async fn is_empty(&self) -> Result<bool> {
    Ok(self.len().await? == 0)
  }
}

/// Records come back in insertion order; the stable sort keeps it for equal stamps.
fn decode_sorted(records: Vec<CachedRecord>) -> Result<Vec<PendingOperation>> {
  let mut operations = records
    .into_iter()
    .map(|r| serde_json::from_value::<PendingOperation>(r.data))
    .collect::<Result<Vec<_>, _>>()?;
  operations.sort_by_key(|op| op.enqueued_at);
  Ok(operations)
}
