//! Contract of the remote operation executor.
//!
//! The engine never talks to GitHub itself. It hands a [`RemoteRequest`] to a
//! [`RemoteExecutor`] and only looks at whether the answer was a value, a
//! retryable failure or a permanent rejection.

mod http;

pub use http::HttpExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::error::CacheError;

/// HTTP-style method of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[serde(alias = "get")]
  Get,
  #[serde(alias = "post")]
  Post,
  #[serde(alias = "put")]
  Put,
  #[serde(alias = "patch")]
  Patch,
  #[serde(alias = "delete")]
  Delete,
}

impl Method {
  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// One call as sent to the replay endpoint (`POST /api/sync`).
///
/// `id`, `sync_tag` and `timestamp` are present when the call replays a
/// queued operation and absent for a first, direct attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sync_tag: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<i64>,
  pub endpoint: String,
  pub method: Method,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
}

impl RemoteRequest {
  pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
    Self {
      id: None,
      sync_tag: None,
      timestamp: None,
      endpoint: endpoint.into(),
      method,
      body: None,
    }
  }

  pub fn get(endpoint: impl Into<String>) -> Self {
    Self::new(Method::Get, endpoint)
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// Failure of a remote call, classified by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// The executor or the upstream could not be reached.
  #[error("network error: {0}")]
  Network(String),
  /// The upstream failed on its side (5xx).
  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },
  /// The upstream refused the request (4xx).
  #[error("rejected ({status}): {message}")]
  Rejected { status: u16, message: String },
}

impl RemoteError {
  /// Classify an HTTP failure status: 4xx is permanent, everything else is retryable.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    if (400..500).contains(&status) {
      RemoteError::Rejected { status, message }
    } else {
      RemoteError::Server { status, message }
    }
  }

  pub fn is_retryable(&self) -> bool {
    !matches!(self, RemoteError::Rejected { .. })
  }
}

impl From<RemoteError> for CacheError {
  fn from(e: RemoteError) -> Self {
    match e {
      RemoteError::Rejected { status, message } => CacheError::UpstreamRejected { status, message },
      other => CacheError::Network(other.to_string()),
    }
  }
}

/// The authenticated network layer that actually performs a call.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
  async fn execute(&self, request: &RemoteRequest) -> Result<Value, RemoteError>;
}


#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_classification() {
    assert!(!RemoteError::from_status(422, "invalid").is_retryable());
    assert!(!RemoteError::from_status(404, "missing").is_retryable());
    assert!(RemoteError::from_status(502, "bad gateway").is_retryable());
    assert!(RemoteError::Network("timeout".into()).is_retryable());
  }

  #[test]
  fn test_request_wire_format() {
    let request = RemoteRequest::new(Method::Put, "/api/repos/o/r/contents/a.md")
      .with_body(json!({ "message": "edit" }));
    let wire = serde_json::to_value(&request).unwrap();
    assert_eq!(
      wire,
      json!({ "endpoint": "/api/repos/o/r/contents/a.md", "method": "PUT", "body": { "message": "edit" } })
    );

    let parsed: RemoteRequest = serde_json::from_value(json!({
      "id": "abc", "syncTag": "sync-1", "timestamp": 5, "endpoint": "/repos", "method": "get"
    }))
    .unwrap();
    assert_eq!(parsed.method, Method::Get);
    assert_eq!(parsed.sync_tag.as_deref(), Some("sync-1"));
    assert_eq!(parsed.body, None);
  }

  #[test]
  fn test_rejection_maps_to_upstream_rejected() {
    let err: CacheError = RemoteError::from_status(422, "bad").into();
    assert!(matches!(err, CacheError::UpstreamRejected { status: 422, .. }));
    let err: CacheError = RemoteError::Network("down".into()).into();
    assert!(matches!(err, CacheError::Network(_)));
  }
}
