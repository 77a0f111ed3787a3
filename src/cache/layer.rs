//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::sync::Arc;

use super::storage::{CachedRecord, SqliteStorage};
use super::traits::{CacheResult, Cacheable};
use crate::error::Result;

/// Read-through cache in front of the network.
///
/// Records inside their validity window are served from the store; anything
/// else is fetched and written back. Expired data is never served, even when
/// the network is down.
#[derive(Clone)]
pub struct CacheLayer {
  storage: Arc<SqliteStorage>,
}

impl CacheLayer {
  pub fn new(storage: Arc<SqliteStorage>) -> Self {
    Self { storage }
  }

  /// Fetch a single entity by key.
  pub async fn fetch_one<T, F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let lookup_key = key.to_string();
    let cached = self
      .storage
      .run(move |s| s.get(T::collection(), &lookup_key))
      .await?;

    if let Some(record) = cached {
      let written_at = record.written_at;
      return Ok(CacheResult::from_cache(
        serde_json::from_value(record.data)?,
        written_at,
      ));
    }

    let data = fetcher().await?;
    self.store(std::slice::from_ref(&data)).await?;
    Ok(CacheResult::from_network(data))
  }

  /// Fetch the entities whose secondary index matches `value`.
  ///
  /// Served from the store only while the last complete fetch of this query
  /// is valid; records written one at a time never make up a list.
  pub async fn fetch_indexed<T, F, Fut>(
    &self,
    index: &str,
    value: &str,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let (index, value) = (index.to_string(), value.to_string());
    let query = format!("{}={}", index, value);
    self
      .list_or_fetch(
        query,
        move |s| s.query_by_index(T::collection(), &index, &value),
        fetcher,
      )
      .await
  }

  /// Fetch every entity of the collection.
  pub async fn fetch_all<T, F, Fut>(&self, fetcher: F) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    self
      .list_or_fetch(ALL_RECORDS.to_string(), |s| s.get_all(T::collection()), fetcher)
      .await
  }

  async fn list_or_fetch<T, R, F, Fut>(
    &self,
    query: String,
    read: R,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    R: FnOnce(&SqliteStorage) -> Result<Vec<CachedRecord>> + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let marker = query.clone();
    let cached = self
      .storage
      .run(move |s| match s.list_fetched_at(T::collection(), &marker)? {
        Some(fetched_at) => Ok(Some((fetched_at, read(s)?))),
        None => Ok(None),
      })
      .await?;

    if let Some((fetched_at, records)) = cached {
      let data = records
        .into_iter()
        .map(|record| serde_json::from_value(record.data))
        .collect::<std::result::Result<Vec<T>, _>>()?;
      return Ok(CacheResult::from_cache(data, fetched_at));
    }

    let data = fetcher().await?;
    let records = to_values(&data)?;
    self
      .storage
      .run(move |s| s.put_list(T::collection(), &query, &records))
      .await?;
    Ok(CacheResult::from_network(data))
  }

  async fn store<T: Cacheable>(&self, items: &[T]) -> Result<()> {
    let records = to_values(items)?;
    self
      .storage
      .run(move |s| s.put(T::collection(), &records))
      .await?;
    Ok(())
  }
}

/// List query covering a whole collection.
const ALL_RECORDS: &str = "*";

fn to_values<T: Cacheable>(items: &[T]) -> Result<Vec<serde_json::Value>> {
  Ok(
    items
      .iter()
      .map(serde_json::to_value)
      .collect::<std::result::Result<Vec<_>, _>>()?,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, Collection, ExpiryPolicy, ManualClock};
  use chrono::Utc;
  use crate::error::CacheError;
  use chrono::Duration;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Pull {
    id: u64,
    state: String,
  }

  impl Cacheable for Pull {
    fn collection() -> Collection {
      Collection::PullRequests
    }
  }

  fn layer() -> (CacheLayer, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let storage =
      SqliteStorage::open_in_memory(Arc::new(clock.clone()), ExpiryPolicy::default()).unwrap();
    (CacheLayer::new(Arc::new(storage)), clock)
  }

  fn pull(id: u64) -> Pull {
    Pull {
      id,
      state: "open".to_string(),
    }
  }

  #[tokio::test]
  async fn test_fetch_one_reads_through_then_serves_cache() {
    let (layer, _clock) = layer();
    let counter = AtomicUsize::new(0);
    let calls = &counter;

    for expected in [CacheSource::Network, CacheSource::Cache] {
      let result = layer
        .fetch_one::<Pull, _, _>("1", move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(pull(1))
        })
        .await
        .unwrap();
      assert_eq!(result.source, expected);
      assert_eq!(result.data, pull(1));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_expired_entry_is_refetched() {
    let (layer, clock) = layer();
    layer
      .fetch_one::<Pull, _, _>("1", || async { Ok(pull(1)) })
      .await
      .unwrap();
    clock.advance(Duration::minutes(16));

    let result = layer
      .fetch_one::<Pull, _, _>("1", || async { Ok(pull(1)) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_expired_entry_is_not_served_when_offline() {
    let (layer, clock) = layer();
    layer
      .fetch_one::<Pull, _, _>("1", || async { Ok(pull(1)) })
      .await
      .unwrap();
    clock.advance(Duration::minutes(16));

    let err = layer
      .fetch_one::<Pull, _, _>("1", || async {
        Err(CacheError::Network("offline".to_string()))
      })
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Network(_)));
  }

  #[tokio::test]
  async fn test_fetch_indexed_uses_cached_matches() {
    let (layer, _clock) = layer();
    let first = layer
      .fetch_indexed::<Pull, _, _>("state", "open", || async { Ok(vec![pull(1), pull(2)]) })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = layer
      .fetch_indexed::<Pull, _, _>("state", "open", || async {
        Err(CacheError::Network("network should not be hit".to_string()))
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, vec![pull(1), pull(2)]);
  }

  #[tokio::test]
  async fn test_single_record_does_not_stand_in_for_the_list() {
    let (layer, _clock) = layer();
    layer
      .fetch_one::<Pull, _, _>("7", || async { Ok(pull(7)) })
      .await
      .unwrap();

    let result = layer
      .fetch_indexed::<Pull, _, _>("state", "open", || async {
        Ok(vec![pull(1), pull(2), pull(7)])
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 3);
  }

  #[tokio::test]
  async fn test_list_is_refetched_once_its_fetch_expires() {
    let (layer, clock) = layer();
    layer
      .fetch_indexed::<Pull, _, _>("state", "open", || async { Ok(vec![pull(1), pull(2)]) })
      .await
      .unwrap();
    clock.advance(Duration::minutes(10));
    // A later write keeps one member fresh past the list's own expiry.
    layer
      .fetch_one::<Pull, _, _>("3", || async { Ok(pull(3)) })
      .await
      .unwrap();
    clock.advance(Duration::minutes(6));

    let result = layer
      .fetch_indexed::<Pull, _, _>("state", "open", || async {
        Ok(vec![pull(1), pull(2), pull(3)])
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, vec![pull(1), pull(2), pull(3)]);
  }

  #[tokio::test]
  async fn test_empty_list_is_remembered() {
    let (layer, _clock) = layer();
    let counter = AtomicUsize::new(0);
    let calls = &counter;

    for _ in 0..2 {
      let result = layer
        .fetch_all::<Pull, _, _>(move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(Vec::new())
        })
        .await
        .unwrap();
      assert!(result.data.is_empty());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}
