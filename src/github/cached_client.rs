//! GitHub client with read-through caching and queued writes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

use super::types::{ContentEntry, PullRequest, Repository, UserProfile};
use crate::cache::{CacheLayer, Collection};
use crate::engine::{CacheEngine, Outcome};
use crate::error::{CacheError, Result};
use crate::remote::Method;
use crate::sync::OperationIntent;

/// GitHub access for the dashboard.
///
/// Reads are served from the store while fresh and fetched through the
/// replay endpoint otherwise. Writes go through [`CacheEngine::perform`], so
/// they run now when online and are queued when not.
#[derive(Clone)]
pub struct CachedGithubClient {
  engine: Arc<CacheEngine>,
  cache: CacheLayer,
}

impl CachedGithubClient {
  pub fn new(engine: Arc<CacheEngine>) -> Self {
    let cache = engine.cache_layer();
    Self { engine, cache }
  }

  async fn fetch<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
    let value = self.engine.fetch_remote(endpoint).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Repositories of the authenticated user.
  pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
    let result = self
      .cache
      .fetch_all(|| self.fetch("/api/repos"))
      .await?;
    Ok(result.data)
  }

  /// Pull requests whose base is `owner/repo`.
  pub async fn list_pulls(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>> {
    let full_name = format!("{}/{}", owner, repo);
    let endpoint = format!("/api/repos/{}/pulls", full_name);
    let result = self
      .cache
      .fetch_indexed("repository", &full_name, || self.fetch(&endpoint))
      .await?;
    Ok(result.data)
  }

  /// A file's metadata and content.
  pub async fn get_file(&self, owner: &str, repo: &str, path: &str) -> Result<ContentEntry> {
    let full_name = format!("{}/{}", owner, repo);
    let result = self
      .cache
      .fetch_one(path, || self.fetch_file(&full_name, path))
      .await?;
    if result.data.repo.as_deref() == Some(full_name.as_str()) {
      return Ok(result.data);
    }

    // The same path was cached for another repository; replace it.
    let entry = self.fetch_file(&full_name, path).await?;
    self
      .engine
      .store_data(Collection::Files, vec![serde_json::to_value(&entry)?])
      .await?;
    Ok(entry)
  }

  async fn fetch_file(&self, full_name: &str, path: &str) -> Result<ContentEntry> {
    let mut entry: ContentEntry = self
      .fetch(&format!("/api/repos/{}/contents/{}", full_name, path))
      .await?;
    entry.repo = Some(full_name.to_string());
    Ok(entry)
  }

  /// The authenticated user's profile.
  pub async fn get_user(&self) -> Result<UserProfile> {
    // The profile is the only record in its collection.
    let result = self
      .cache
      .fetch_all(|| async {
        self
          .fetch::<UserProfile>("/api/user")
          .await
          .map(|user| vec![user])
      })
      .await?;
    result
      .data
      .into_iter()
      .next()
      .ok_or_else(|| CacheError::Network("empty user profile response".to_string()))
  }

  /// Branches of a repository (not cached - only needed when creating one).
  pub async fn list_branches(&self, owner: &str, repo: &str) -> Result<Value> {
    self
      .engine
      .fetch_remote(&format!("/api/repos/{}/{}/branches", owner, repo))
      .await
  }

  pub async fn create_repository(&self, name: &str, private: bool) -> Result<Outcome> {
    self
      .engine
      .perform(
        OperationIntent::new(Method::Post, "/api/repos")
          .with_body(json!({ "name": name, "private": private }))
          .mirror_into(Collection::Repositories),
      )
      .await
  }

  /// Create `name` pointing at commit `sha`.
  pub async fn create_branch(
    &self,
    owner: &str,
    repo: &str,
    name: &str,
    sha: &str,
  ) -> Result<Outcome> {
    self
      .engine
      .perform(
        OperationIntent::new(Method::Post, format!("/api/repos/{}/{}/branches", owner, repo))
          .with_body(json!({ "name": name, "sha": sha })),
      )
      .await
  }

  /// Create or update a file. `sha` is the blob being replaced, if any.
  pub async fn write_file(
    &self,
    owner: &str,
    repo: &str,
    path: &str,
    message: &str,
    content: &[u8],
    sha: Option<&str>,
  ) -> Result<Outcome> {
    let mut body = json!({ "message": message, "content": STANDARD.encode(content) });
    if let Some(sha) = sha {
      body["sha"] = json!(sha);
    }
    self
      .engine
      .perform(
        OperationIntent::new(
          Method::Put,
          format!("/api/repos/{}/{}/contents/{}", owner, repo, path),
        )
        .with_body(body),
      )
      .await
  }

  pub async fn create_pull(
    &self,
    owner: &str,
    repo: &str,
    title: &str,
    head: &str,
    base: &str,
  ) -> Result<Outcome> {
    self
      .engine
      .perform(
        OperationIntent::new(Method::Post, format!("/api/repos/{}/{}/pulls", owner, repo))
          .with_body(json!({ "title": title, "head": head, "base": base }))
          .mirror_into(Collection::PullRequests),
      )
      .await
  }
}
