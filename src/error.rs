//! Error types for the cache engine.

use thiserror::Error;

/// Errors surfaced by the record store, the operation log and the engine.
#[derive(Debug, Error)]
pub enum CacheError {
  /// A collection name that the store does not know about.
  #[error("unknown collection '{0}'")]
  StoreNotFound(String),

  /// A secondary index that the collection does not declare.
  #[error("collection '{collection}' has no index '{index}'")]
  IndexNotFound { collection: String, index: String },

  /// A record whose payload lacks the collection's key field.
  #[error("record for '{collection}' has no key at '{key_path}'")]
  MissingKey {
    collection: String,
    key_path: String,
  },

  /// A record that may only be created once already exists.
  #[error("'{collection}' already holds a record with key '{key}'")]
  DuplicateKey { collection: String, key: String },

  /// The underlying store failed; the operation was rejected and may be retried.
  #[error("store transaction failed: {0}")]
  Transaction(String),

  #[error("failed to (de)serialize record: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The remote executor could not be reached.
  #[error("network unavailable: {0}")]
  Network(String),

  /// The upstream API refused the operation (4xx); it will not be retried.
  #[error("upstream rejected operation ({status}): {message}")]
  UpstreamRejected { status: u16, message: String },

  /// Background trigger registration is disabled or the dispatcher has stopped.
  #[error("background dispatcher unavailable")]
  DispatcherUnavailable,
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Transaction(e.to_string())
  }
}

impl From<tokio::task::JoinError> for CacheError {
  fn from(e: tokio::task::JoinError) -> Self {
    CacheError::Transaction(format!("store task failed: {}", e))
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
