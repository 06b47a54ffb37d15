//! SQLite-backed snapshot storage.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{PersistedFilter, PersistedQuery, Persister};
use crate::key::digest_hash;
use crate::state::QueryStatus;

/// Stores one row per persisted query.
pub struct SqlitePersister {
  conn: Mutex<Option<Connection>>,
}

impl SqlitePersister {
  /// Open the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create persistence directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open persistence database at {}: {}", path.display(), e))?;
    Self::from_connection(conn)
  }

  /// A private in-memory database, gone once the persister is dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let persister = Self {
      conn: Mutex::new(Some(conn)),
    };
    persister.run_migrations()?;
    Ok(persister)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("query-sync").join("queries.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute_batch(PERSIST_SCHEMA)
        .map_err(|e| eyre!("Failed to run persistence migrations: {}", e))
    })
  }

  fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
    let guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let conn = guard
      .as_ref()
      .ok_or_else(|| eyre!("Persistence database is closed"))?;
    f(conn)
  }
}

/// Schema for the snapshot table.
const PERSIST_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS persisted_queries (
    id TEXT PRIMARY KEY,
    key_hash TEXT NOT NULL,
    query_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    data_updated_at TEXT NOT NULL,
    persisted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_persisted_queries_persisted
    ON persisted_queries(persisted_at);
"#;

const SELECT_COLUMNS: &str =
  "SELECT key_hash, query_key, payload, status, data_updated_at, persisted_at FROM persisted_queries";

/// Raw column values, decoded outside the rusqlite row callback.
struct RawRow {
  key_hash: String,
  query_key: String,
  payload: String,
  status: String,
  data_updated_at: String,
  persisted_at: String,
}

impl RawRow {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key_hash: row.get(0)?,
      query_key: row.get(1)?,
      payload: row.get(2)?,
      status: row.get(3)?,
      data_updated_at: row.get(4)?,
      persisted_at: row.get(5)?,
    })
  }

  fn decode(self) -> Result<PersistedQuery> {
    let key = serde_json::from_str(&self.query_key)
      .map_err(|e| eyre!("Failed to decode query key '{}': {}", self.query_key, e))?;
    Ok(PersistedQuery {
      key,
      key_hash: self.key_hash,
      payload: self.payload,
      status: parse_status(&self.status)?,
      data_updated_at: parse_datetime(&self.data_updated_at)?,
      persisted_at: parse_datetime(&self.persisted_at)?,
    })
  }
}

fn load_all(conn: &Connection) -> Result<Vec<PersistedQuery>> {
  let mut stmt = conn
    .prepare(SELECT_COLUMNS)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows: Vec<RawRow> = stmt
    .query_map([], RawRow::read)
    .map_err(|e| eyre!("Failed to query persisted entries: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read persisted entry: {}", e))?;

  let mut entries = Vec::with_capacity(rows.len());
  for row in rows {
    match row.decode() {
      Ok(entry) => entries.push(entry),
      // One unreadable row must not hide the rest
      Err(e) => tracing::warn!("skipping persisted entry: {}", e),
    }
  }
  Ok(entries)
}

#[async_trait]
impl Persister for SqlitePersister {
  async fn persist_query(&self, entry: PersistedQuery) -> Result<()> {
    let query_key =
      serde_json::to_string(&entry.key).map_err(|e| eyre!("Failed to encode query key: {}", e))?;

    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO persisted_queries
             (id, key_hash, query_key, payload, status, data_updated_at, persisted_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
          params![
            digest_hash(&entry.key_hash),
            entry.key_hash,
            query_key,
            entry.payload,
            entry.status.as_str(),
            format_datetime(entry.data_updated_at),
            format_datetime(entry.persisted_at),
          ],
        )
        .map_err(|e| eyre!("Failed to persist query {}: {}", entry.key_hash, e))?;
      Ok(())
    })
  }

  async fn restore_query(&self, key_hash: &str) -> Result<Option<PersistedQuery>> {
    self.with_conn(|conn| {
      let row = conn
        .query_row(
          &format!("{} WHERE id = ?", SELECT_COLUMNS),
          params![digest_hash(key_hash)],
          RawRow::read,
        )
        .optional()
        .map_err(|e| eyre!("Failed to restore query {}: {}", key_hash, e))?;
      row.map(RawRow::decode).transpose()
    })
  }

  async fn restore_all(&self) -> Result<Vec<PersistedQuery>> {
    self.with_conn(load_all)
  }

  async fn remove_query(&self, key_hash: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM persisted_queries WHERE id = ?",
          params![digest_hash(key_hash)],
        )
        .map_err(|e| eyre!("Failed to remove query {}: {}", key_hash, e))?;
      Ok(())
    })
  }

  async fn remove_queries(&self, filter: PersistedFilter<'_>) -> Result<usize> {
    self.with_conn(|conn| {
      let doomed: Vec<String> = load_all(conn)?
        .into_iter()
        .filter(|entry| filter(entry))
        .map(|entry| digest_hash(&entry.key_hash))
        .collect();

      for id in &doomed {
        conn
          .execute("DELETE FROM persisted_queries WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to remove persisted entry: {}", e))?;
      }
      Ok(doomed.len())
    })
  }

  async fn clear(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute("DELETE FROM persisted_queries", [])
        .map_err(|e| eyre!("Failed to clear persisted queries: {}", e))?;
      Ok(())
    })
  }

  async fn close(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .take();
    if let Some(conn) = conn {
      conn
        .close()
        .map_err(|(_, e)| eyre!("Failed to close persistence database: {}", e))?;
    }
    Ok(())
  }
}

impl std::fmt::Debug for SqlitePersister {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SqlitePersister").finish_non_exhaustive()
  }
}

fn format_datetime(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

fn parse_status(s: &str) -> Result<QueryStatus> {
  match s {
    "pending" => Ok(QueryStatus::Pending),
    "error" => Ok(QueryStatus::Error),
    "success" => Ok(QueryStatus::Success),
    other => Err(eyre!("Unknown query status '{}'", other)),
  }
}
