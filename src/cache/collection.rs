//! Named collections, their key paths and secondary indexes, and the expiry policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;

/// A named partition of the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
  Repositories,
  PullRequests,
  Files,
  UserData,
  PendingOperations,
}

/// A secondary index: the name callers query by and the dotted path into the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
  pub name: &'static str,
  pub path: &'static str,
}

const REPOSITORY_INDEXES: &[IndexSpec] = &[
  IndexSpec {
    name: "owner",
    path: "owner.login",
  },
  IndexSpec {
    name: "updatedAt",
    path: "updated_at",
  },
];

const PULL_REQUEST_INDEXES: &[IndexSpec] = &[
  IndexSpec {
    name: "repository",
    path: "base.repo.full_name",
  },
  IndexSpec {
    name: "state",
    path: "state",
  },
];

const FILE_INDEXES: &[IndexSpec] = &[
  IndexSpec {
    name: "repo",
    path: "repo",
  },
  IndexSpec {
    name: "type",
    path: "type",
  },
];

const PENDING_OPERATION_INDEXES: &[IndexSpec] = &[
  IndexSpec {
    name: "timestamp",
    path: "enqueuedAt",
  },
  IndexSpec {
    name: "syncTag",
    path: "syncTag",
  },
];

impl Collection {
  pub const ALL: [Collection; 5] = [
    Collection::Repositories,
    Collection::PullRequests,
    Collection::Files,
    Collection::UserData,
    Collection::PendingOperations,
  ];

  /// Name used in storage and in configuration.
  pub fn name(self) -> &'static str {
    match self {
      Collection::Repositories => "repositories",
      Collection::PullRequests => "pullRequests",
      Collection::Files => "files",
      Collection::UserData => "userData",
      Collection::PendingOperations => "pendingOperations",
    }
  }

  /// Path of the identity key inside a record payload.
  pub fn key_path(self) -> &'static str {
    match self {
      Collection::Files => "path",
      _ => "id",
    }
  }

  pub fn indexes(self) -> &'static [IndexSpec] {
    match self {
      Collection::Repositories => REPOSITORY_INDEXES,
      Collection::PullRequests => PULL_REQUEST_INDEXES,
      Collection::Files => FILE_INDEXES,
      Collection::UserData => &[],
      Collection::PendingOperations => PENDING_OPERATION_INDEXES,
    }
  }

  /// Look up an index by name.
  pub fn index(self, name: &str) -> Result<&'static IndexSpec, CacheError> {
    self
      .indexes()
      .iter()
      .find(|spec| spec.name == name)
      .ok_or_else(|| CacheError::IndexNotFound {
        collection: self.name().to_string(),
        index: name.to_string(),
      })
  }

  /// Extract the identity key of a payload.
  pub fn key_of(self, payload: &Value) -> Result<String, CacheError> {
    lookup(payload, self.key_path())
      .and_then(scalar_to_string)
      .ok_or_else(|| CacheError::MissingKey {
        collection: self.name().to_string(),
        key_path: self.key_path().to_string(),
      })
  }

  /// Extract every index value present in a payload.
  pub fn index_values(self, payload: &Value) -> Vec<(&'static str, String)> {
    self
      .indexes()
      .iter()
      .filter_map(|spec| {
        lookup(payload, spec.path)
          .and_then(scalar_to_string)
          .map(|value| (spec.name, value))
      })
      .collect()
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Collection {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Collection::ALL
      .into_iter()
      .find(|c| c.name() == s)
      .ok_or_else(|| CacheError::StoreNotFound(s.to_string()))
  }
}

/// Follow a dotted path through nested objects.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
  path
    .split('.')
    .try_fold(value, |current, segment| current.get(segment))
}

fn scalar_to_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Maximum age per collection. A collection without an entry never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryPolicy {
  max_age: BTreeMap<Collection, Duration>,
}

impl ExpiryPolicy {
  /// A policy under which nothing expires.
  pub fn never() -> Self {
    Self {
      max_age: BTreeMap::new(),
    }
  }

  /// Set or clear the maximum age of one collection.
  pub fn with(mut self, collection: Collection, max_age: Option<Duration>) -> Self {
    match max_age {
      Some(age) => self.max_age.insert(collection, age),
      None => self.max_age.remove(&collection),
    };
    self
  }

  pub fn max_age(&self, collection: Collection) -> Option<Duration> {
    self.max_age.get(&collection).copied()
  }

  /// Oldest write time that is still valid, if the collection expires at all.
  ///
  /// A record is expired once `now - written_at > max_age`, that is when it
  /// was written before the cutoff.
  pub fn cutoff(&self, collection: Collection, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.max_age(collection).map(|max_age| now - max_age)
  }
}

impl Default for ExpiryPolicy {
  fn default() -> Self {
    Self::never()
      .with(Collection::Repositories, Some(Duration::hours(24)))
      .with(Collection::PullRequests, Some(Duration::minutes(15)))
      .with(Collection::Files, Some(Duration::hours(12)))
      .with(Collection::UserData, Some(Duration::hours(24)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_collection_names_round_trip() {
    for collection in Collection::ALL {
      assert_eq!(collection.name().parse::<Collection>().ok(), Some(collection));
    }
  }

  #[test]
  fn test_unknown_collection_is_store_not_found() {
    let err = "gists".parse::<Collection>().unwrap_err();
    assert!(matches!(err, CacheError::StoreNotFound(name) if name == "gists"));
  }

  #[test]
  fn test_key_and_nested_index_extraction() {
    let repo = json!({
      "id": 42,
      "owner": { "login": "octocat" },
      "updated_at": "2024-01-01T00:00:00Z"
    });
    assert_eq!(Collection::Repositories.key_of(&repo).unwrap(), "42");
    let values = Collection::Repositories.index_values(&repo);
    assert!(values.contains(&("owner", "octocat".to_string())));
    assert!(values.contains(&("updatedAt", "2024-01-01T00:00:00Z".to_string())));
  }

  #[test]
  fn test_missing_key_is_an_error() {
    let err = Collection::Files.key_of(&json!({ "name": "README.md" })).unwrap_err();
    assert!(matches!(err, CacheError::MissingKey { .. }));
  }

  #[test]
  fn test_unknown_index() {
    assert!(Collection::UserData.index("owner").is_err());
    assert_eq!(Collection::Files.index("type").unwrap().path, "type");
  }

  #[test]
  fn test_default_expiry_table() {
    let policy = ExpiryPolicy::default();
    assert_eq!(policy.max_age(Collection::Repositories), Some(Duration::hours(24)));
    assert_eq!(policy.max_age(Collection::PullRequests), Some(Duration::minutes(15)));
    assert_eq!(policy.max_age(Collection::Files), Some(Duration::hours(12)));
    assert_eq!(policy.max_age(Collection::UserData), Some(Duration::hours(24)));
    assert_eq!(policy.max_age(Collection::PendingOperations), None);
  }

  #[test]
  fn test_expiry_boundary() {
    let policy = ExpiryPolicy::default();
    let written = Utc::now();
    let max_age = Duration::minutes(15);
    let eps = Duration::milliseconds(1);
    let valid_at = |now: DateTime<Utc>| {
      policy
        .cutoff(Collection::PullRequests, now)
        .map_or(true, |cutoff| written >= cutoff)
    };
    assert!(valid_at(written + max_age - eps));
    assert!(valid_at(written + max_age));
    assert!(!valid_at(written + max_age + eps));
    assert_eq!(
      policy.cutoff(Collection::PendingOperations, written + Duration::days(365)),
      None
    );
  }
}
