//! The GitHub REST API as seen by the replay endpoint.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::routes::UpstreamCall;
use crate::remote::RemoteError;

/// Executes allow-listed calls against the upstream API.
#[async_trait]
pub trait Upstream: Send + Sync {
  async fn call(&self, call: &UpstreamCall) -> Result<Value, RemoteError>;
}

/// Error body returned by the GitHub API.
#[derive(Debug, Deserialize)]
struct GithubError {
  message: String,
}

pub struct GithubUpstream {
  client: reqwest::Client,
  api_url: String,
}

impl GithubUpstream {
  pub fn new(api_url: &Url, token: Option<&str>, timeout: Duration) -> Result<Self, RemoteError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
    headers.insert(
      USER_AGENT,
      HeaderValue::from_static(concat!("hubsync/", env!("CARGO_PKG_VERSION"))),
    );
    if let Some(token) = token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| RemoteError::Network(format!("invalid GitHub token: {}", e)))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()
      .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      api_url: api_url.as_str().trim_end_matches('/').to_string(),
    })
  }
}

#[async_trait]
impl Upstream for GithubUpstream {
  async fn call(&self, call: &UpstreamCall) -> Result<Value, RemoteError> {
    let url = format!("{}{}", self.api_url, call.path);
    let mut request = self.client.request(call.method.into(), url.as_str());
    if let Some(body) = &call.body {
      request = request.json(body);
    }

    let response = request
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
        message: format!("invalid JSON from GitHub: {}", e),
      });
    }

    let message = serde_json::from_slice::<GithubError>(&bytes)
      .map(|body| body.message)
      .unwrap_or_else(|_| {
        status
          .canonical_reason()
          .unwrap_or("unknown error")
          .to_string()
      });
    tracing::debug!(%url, status = status.as_u16(), %message, "GitHub call failed");
    Err(RemoteError::from_status(status.as_u16(), message))
  }
}
