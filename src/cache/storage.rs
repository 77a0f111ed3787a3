//! SQLite-backed record store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::clock::Clock;
use super::collection::{Collection, ExpiryPolicy};
use crate::error::{CacheError, Result};

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
  pub collection: Collection,
  pub key: String,
  pub data: Value,
  pub written_at: DateTime<Utc>,
}

/// SQLite-based record store.
///
/// Every mutation runs in its own transaction. Reads filter out records that
/// are expired under the store's [`ExpiryPolicy`].
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
  policy: ExpiryPolicy,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    data TEXT NOT NULL,
    written_at INTEGER NOT NULL,
    UNIQUE (collection, key)
);

CREATE INDEX IF NOT EXISTS idx_records_written
    ON records(collection, written_at);

-- Secondary index entries, one row per (record, index)
CREATE TABLE IF NOT EXISTS record_index (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    index_name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (collection, key, index_name)
);

CREATE INDEX IF NOT EXISTS idx_record_index_lookup
    ON record_index(collection, index_name, value);

-- When a complete list query was last written, e.g. ("pullRequests", "repository=octocat/a")
CREATE TABLE IF NOT EXISTS list_fetches (
    collection TEXT NOT NULL,
    query TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    PRIMARY KEY (collection, query)
);
"#;

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path, clock: Arc<dyn Clock>, policy: ExpiryPolicy) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Transaction(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Transaction(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    // Enqueued operations must survive a crash right after commit.
    let _mode: String =
      conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    Self::with_connection(conn, clock, policy)
  }

  /// A throwaway store, mostly for tests.
  pub fn open_in_memory(clock: Arc<dyn Clock>, policy: ExpiryPolicy) -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?, clock, policy)
  }

  fn with_connection(conn: Connection, clock: Arc<dyn Clock>, policy: ExpiryPolicy) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      clock,
      policy,
    })
  }

  /// Default database location under the user's data directory.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("hubsync").join("cache.db"))
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  #[cfg(test)]
  pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
    self.conn()?.execute_batch(sql)?;
    Ok(())
  }

  /// Run a store operation on the blocking pool so async callers never block.
  pub async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&SqliteStorage) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(self);
    tokio::task::spawn_blocking(move || f(&storage)).await?
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Transaction(format!("lock poisoned: {}", e)))
  }

  fn cutoff_millis(&self, collection: Collection) -> Option<i64> {
    self
      .policy
      .cutoff(collection, self.clock.now())
      .map(|cutoff| cutoff.timestamp_millis())
  }

  /// Upsert records by key, stamping them with the current time.
  ///
  /// Returns the keys written, in input order.
  pub fn put(&self, collection: Collection, records: &[Value]) -> Result<Vec<String>> {
    let keyed = keyed_records(collection, records)?;
    let written_at = self.clock.now().timestamp_millis();

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    write_records(&tx, collection, &keyed, written_at)?;
    tx.commit()?;

    Ok(keyed.into_iter().map(|(key, _)| key).collect())
  }

  /// Insert records whose keys must not exist yet.
  ///
  /// Nothing is written when any key is already taken, including by an
  /// earlier record of the same batch.
  pub fn insert(&self, collection: Collection, records: &[Value]) -> Result<Vec<String>> {
    let keyed = keyed_records(collection, records)?;
    let written_at = self.clock.now().timestamp_millis();

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    for entry in &keyed {
      let taken = tx
        .query_row(
          "SELECT 1 FROM records WHERE collection = ?1 AND key = ?2",
          params![collection.name(), entry.0],
          |_| Ok(()),
        )
        .optional()?
        .is_some();
      if taken {
        return Err(CacheError::DuplicateKey {
          collection: collection.name().to_string(),
          key: entry.0.clone(),
        });
      }
      write_records(&tx, collection, std::slice::from_ref(entry), written_at)?;
    }
    tx.commit()?;

    Ok(keyed.into_iter().map(|(key, _)| key).collect())
  }

  /// Write the complete result of a list query.
  ///
  /// The records are upserted like [`put`](Self::put) and `query` is marked as
  /// fetched at the same instant, in one transaction. Only a marked query may
  /// be answered from the store as a whole list.
  pub fn put_list(
    &self,
    collection: Collection,
    query: &str,
    records: &[Value],
  ) -> Result<Vec<String>> {
    let keyed = keyed_records(collection, records)?;
    let written_at = self.clock.now().timestamp_millis();

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    write_records(&tx, collection, &keyed, written_at)?;
    tx.execute(
      "INSERT INTO list_fetches (collection, query, fetched_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(collection, query) DO UPDATE SET fetched_at = excluded.fetched_at",
      params![collection.name(), query, written_at],
    )?;
    tx.commit()?;

    Ok(keyed.into_iter().map(|(key, _)| key).collect())
  }

  /// When `query` was last fetched as a complete list, unless that has expired.
  pub fn list_fetched_at(
    &self,
    collection: Collection,
    query: &str,
  ) -> Result<Option<DateTime<Utc>>> {
    let conn = self.conn()?;
    let fetched_at: Option<i64> = conn
      .query_row(
        "SELECT fetched_at FROM list_fetches
         WHERE collection = ?1 AND query = ?2 AND (?3 IS NULL OR fetched_at >= ?3)",
        params![collection.name(), query, self.cutoff_millis(collection)],
        |row| row.get(0),
      )
      .optional()?;

    fetched_at.map(millis_to_datetime).transpose()
  }

  /// Fetch one record; expired or absent records are `None`.
  pub fn get(&self, collection: Collection, key: &str) -> Result<Option<CachedRecord>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT key, data, written_at FROM records
         WHERE collection = ?1 AND key = ?2 AND (?3 IS NULL OR written_at >= ?3)",
        params![collection.name(), key, self.cutoff_millis(collection)],
        raw_record,
      )
      .optional()?;

    row.map(|raw| decode(collection, raw)).transpose()
  }

  /// All non-expired records of a collection, in first-insertion order.
  pub fn get_all(&self, collection: Collection) -> Result<Vec<CachedRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT key, data, written_at FROM records
       WHERE collection = ?1 AND (?2 IS NULL OR written_at >= ?2)
       ORDER BY seq",
    )?;
    let rows = stmt
      .query_map(
        params![collection.name(), self.cutoff_millis(collection)],
        raw_record,
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(|raw| decode(collection, raw)).collect()
  }

  /// Non-expired records whose secondary index `index` equals `value`.
  pub fn query_by_index(
    &self,
    collection: Collection,
    index: &str,
    value: &str,
  ) -> Result<Vec<CachedRecord>> {
    let spec = collection.index(index)?;

    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT r.key, r.data, r.written_at FROM records r
       INNER JOIN record_index i ON i.collection = r.collection AND i.key = r.key
       WHERE r.collection = ?1 AND i.index_name = ?2 AND i.value = ?3
         AND (?4 IS NULL OR r.written_at >= ?4)
       ORDER BY r.seq",
    )?;
    let rows = stmt
      .query_map(
        params![
          collection.name(),
          spec.name,
          value,
          self.cutoff_millis(collection)
        ],
        raw_record,
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(|raw| decode(collection, raw)).collect()
  }

  /// Delete one record. Deleting a missing key is not an error.
  pub fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM record_index WHERE collection = ?1 AND key = ?2",
      params![collection.name(), key],
    )?;
    let removed = tx.execute(
      "DELETE FROM records WHERE collection = ?1 AND key = ?2",
      params![collection.name(), key],
    )?;
    tx.commit()?;
    Ok(removed > 0)
  }

  /// Remove every record in a collection, expired ones included.
  pub fn clear(&self, collection: Collection) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM record_index WHERE collection = ?1",
      params![collection.name()],
    )?;
    tx.execute(
      "DELETE FROM list_fetches WHERE collection = ?1",
      params![collection.name()],
    )?;
    let removed = tx.execute(
      "DELETE FROM records WHERE collection = ?1",
      params![collection.name()],
    )?;
    tx.commit()?;
    Ok(removed)
  }

  /// Physically remove expired records from every collection.
  pub fn sweep_expired(&self) -> Result<usize> {
    let cutoffs: Vec<(Collection, i64)> = Collection::ALL
      .into_iter()
      .filter_map(|c| self.cutoff_millis(c).map(|cutoff| (c, cutoff)))
      .collect();

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let mut removed = 0;
    for (collection, cutoff) in cutoffs {
      tx.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND key IN
           (SELECT key FROM records WHERE collection = ?1 AND written_at < ?2)",
        params![collection.name(), cutoff],
      )?;
      tx.execute(
        "DELETE FROM list_fetches WHERE collection = ?1 AND fetched_at < ?2",
        params![collection.name(), cutoff],
      )?;
      removed += tx.execute(
        "DELETE FROM records WHERE collection = ?1 AND written_at < ?2",
        params![collection.name(), cutoff],
      )?;
    }
    tx.commit()?;
    Ok(removed)
  }
}

fn keyed_records(collection: Collection, records: &[Value]) -> Result<Vec<(String, &Value)>> {
  records
    .iter()
    .map(|record| Ok((collection.key_of(record)?, record)))
    .collect()
}

fn write_records(
  tx: &Transaction<'_>,
  collection: Collection,
  keyed: &[(String, &Value)],
  written_at: i64,
) -> Result<()> {
  for (key, record) in keyed {
    let data = serde_json::to_string(record)?;
    tx.execute(
      "INSERT INTO records (collection, key, data, written_at) VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT(collection, key) DO UPDATE SET data = excluded.data, written_at = excluded.written_at",
      params![collection.name(), key, data, written_at],
    )?;
    tx.execute(
      "DELETE FROM record_index WHERE collection = ?1 AND key = ?2",
      params![collection.name(), key],
    )?;
    for (index_name, value) in collection.index_values(record) {
      tx.execute(
        "INSERT INTO record_index (collection, key, index_name, value) VALUES (?1, ?2, ?3, ?4)",
        params![collection.name(), key, index_name, value],
      )?;
    }
  }
  Ok(())
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(millis)
    .ok_or_else(|| CacheError::Transaction(format!("invalid write stamp {}", millis)))
}

type RawRecord = (String, String, i64);

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode(collection: Collection, (key, data, written_at): RawRecord) -> Result<CachedRecord> {
  let written_at = millis_to_datetime(written_at)?;
  Ok(CachedRecord {
    collection,
    key,
    data: serde_json::from_str(&data)?,
    written_at,
  })
}
