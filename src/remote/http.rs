//! Executor that forwards calls to the server's replay endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{RemoteError, RemoteExecutor, RemoteRequest};

/// Error body returned by the replay endpoint.
#[derive(Debug, Deserialize)]
struct ErrorBody {
  error: String,
}

/// Sends every call to `POST {server}/api/sync`.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  sync_url: Url,
  health_url: Url,
}

impl HttpExecutor {
  pub fn new(server: &Url, timeout: Duration) -> Result<Self, RemoteError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self {
      client,
      sync_url: endpoint_url(server, "api/sync")?,
      health_url: endpoint_url(server, "api/health")?,
    })
  }

  /// Whether the server answers its health check.
  pub async fn probe(&self) -> bool {
    match self.client.get(self.health_url.clone()).send().await {
      Ok(response) => response.status().is_success(),
      Err(e) => {
        tracing::debug!(error = %e, "health probe failed");
        false
      }
    }
  }
}

/// Resolve `path` below the server URL, keeping any path prefix it carries.
fn endpoint_url(server: &Url, path: &str) -> Result<Url, RemoteError> {
  let mut base = server.clone();
  if !base.path().ends_with('/') {
    base.set_path(&format!("{}/", base.path()));
  }
  base
    .join(path)
    .map_err(|e| RemoteError::Network(format!("invalid server url {}: {}", server, e)))
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
  async fn execute(&self, request: &RemoteRequest) -> Result<Value, RemoteError> {
    let response = self
      .client
      .post(self.sync_url.clone())
      .json(request)
      .send()
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))?;

    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| RemoteError::Network(format!("failed to read response: {}", e)))?;

    if status.is_success() {
      if bytes.is_empty() {
        return Ok(Value::Null);
      }
      return serde_json::from_slice(&bytes).map_err(|e| RemoteError::Server {
        status: status.as_u16(),
        message: format!("invalid JSON in response: {}", e),
      });
    }

    let message = serde_json::from_slice::<ErrorBody>(&bytes)
      .map(|body| body.error)
      .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
    tracing::debug!(
      endpoint = %request.endpoint,
      status = status.as_u16(),
      "replay endpoint returned an error"
    );
    Err(RemoteError::from_status(status.as_u16(), message))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_url_keeps_path_prefix() {
    for server in ["https://host/dash/", "https://host/dash"] {
      let server = Url::parse(server).unwrap();
      assert_eq!(
        endpoint_url(&server, "api/sync").unwrap().as_str(),
        "https://host/dash/api/sync"
      );
    }
  }

  #[test]
  fn test_endpoint_url_at_server_root() {
    let server = Url::parse("http://127.0.0.1:8787").unwrap();
    let executor = HttpExecutor::new(&server, Duration::from_secs(1)).unwrap();
    assert_eq!(executor.sync_url.as_str(), "http://127.0.0.1:8787/api/sync");
    assert_eq!(executor.health_url.as_str(), "http://127.0.0.1:8787/api/health");
  }
}
