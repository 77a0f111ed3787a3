//! GitHub records as cached by the dashboard.
//!
//! Only the fields the dashboard reads are typed; everything else the API
//! returns is kept in `extra` so a cached record round-trips unchanged.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{Cacheable, Collection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
  pub login: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Repository summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
  pub id: u64,
  pub name: String,
  pub full_name: String,
  pub owner: Account,
  #[serde(default)]
  pub private: bool,
  #[serde(default)]
  pub default_branch: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Cacheable for Repository {
  fn collection() -> Collection {
    Collection::Repositories
  }
}

/// Repository reference inside a pull request's base or head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoRef {
  pub full_name: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullBranch {
  #[serde(rename = "ref")]
  pub ref_name: String,
  #[serde(default)]
  pub sha: Option<String>,
  pub repo: RepoRef,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Pull request summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
  pub id: u64,
  pub number: u64,
  pub title: String,
  pub state: String, // "open" or "closed"
  pub base: PullBranch,
  #[serde(default)]
  pub user: Option<Account>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Cacheable for PullRequest {
  fn collection() -> Collection {
    Collection::PullRequests
  }
}

/// A file or directory entry from the contents API.
///
/// `repo` is not part of the API response; the client fills it in with the
/// repository's full name so entries can be queried per repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
  pub path: String,
  pub name: String,
  pub sha: String,
  #[serde(rename = "type")]
  pub kind: String, // "file", "dir", "symlink" or "submodule"
  #[serde(default)]
  pub repo: Option<String>,
  #[serde(default)]
  pub content: Option<String>,
  #[serde(default)]
  pub encoding: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ContentEntry {
  /// Decoded file body, when the entry carries base64 content.
  pub fn decoded(&self) -> Option<Vec<u8>> {
    if self.encoding.as_deref() != Some("base64") {
      return None;
    }
    // The API wraps base64 at 60 columns.
    let compact: String = self
      .content
      .as_deref()?
      .chars()
      .filter(|c| !c.is_whitespace())
      .collect();
    STANDARD.decode(compact).ok()
  }
}

impl Cacheable for ContentEntry {
  fn collection() -> Collection {
    Collection::Files
  }
}

/// The authenticated user's profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: u64,
  pub login: String,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Cacheable for UserProfile {
  fn collection() -> Collection {
    Collection::UserData
  }
}
