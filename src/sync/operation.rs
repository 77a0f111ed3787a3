//! Pending operations: durable records of mutating intents.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cache::Collection;
use crate::remote::{Method, RemoteRequest};

/// What the caller wants done, before it has an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationIntent {
  pub endpoint: String,
  pub method: Method,
  pub body: Option<Value>,
  /// Collection to upsert the successful result into.
  pub mirror: Option<Collection>,
}

impl OperationIntent {
  pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      method,
      body: None,
      mirror: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn mirror_into(mut self, collection: Collection) -> Self {
    self.mirror = Some(collection);
    self
  }
}

/// A queued intent awaiting successful replay.
///
/// Never modified once stored; it is only ever deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
  pub id: String,
  pub sync_tag: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub enqueued_at: DateTime<Utc>,
  pub endpoint: String,
  pub method: Method,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mirror: Option<Collection>,
}

impl PendingOperation {
  /// Give an intent its id and sync tag.
  pub fn new(intent: OperationIntent, enqueued_at: DateTime<Utc>) -> Self {
    let id = Uuid::now_v7().to_string();
    let sync_tag = sync_tag_for(&id);
    Self {
      id,
      sync_tag,
      // Stored with millisecond precision.
      enqueued_at: enqueued_at.trunc_subsecs(3),
      endpoint: intent.endpoint,
      method: intent.method,
      body: intent.body,
      mirror: intent.mirror,
    }
  }

  /// The call to send to the executor, verbatim.
  pub fn to_request(&self) -> RemoteRequest {
    RemoteRequest {
      id: Some(self.id.clone()),
      sync_tag: Some(self.sync_tag.clone()),
      timestamp: Some(self.enqueued_at.timestamp_millis()),
      endpoint: self.endpoint.clone(),
      method: self.method,
      body: self.body.clone(),
    }
  }
}

/// Trigger key for an operation id.
pub fn sync_tag_for(id: &str) -> String {
  let digest = Sha256::digest(id.as_bytes());
  format!("sync-{}", &hex::encode(digest)[..16])
}
