//! Partition store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::types::RequestKey;
use crate::net::Snapshot;

/// A snapshot as it came out of a partition.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
  /// The stored response copy
  pub snapshot: Snapshot,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for partition storage backends.
///
/// Partitions are named, durable key-value stores. Writers to the same key
/// race and the last write wins; entries are re-derivable from the network,
/// so no locking beyond per-call consistency is provided.
pub trait PartitionStore: Send + Sync {
  /// Open a partition, creating it if it does not exist.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Names of every existing partition, in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and every snapshot in it.
  fn delete_partition(&self, name: &str) -> Result<()>;

  /// Look up a key in one partition.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<StoredSnapshot>>;

  /// Look up a key across every partition, oldest partition first.
  fn get_any(&self, key: &RequestKey) -> Result<Option<StoredSnapshot>>;

  /// Store one snapshot, creating the partition if needed.
  fn put(&self, partition: &str, key: &RequestKey, snapshot: &Snapshot) -> Result<()>;

  /// Store a batch of snapshots in one transaction. Either every entry
  /// commits or none do.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, Snapshot)]) -> Result<()>;

  /// Remove one key from one partition.
  fn delete(&self, partition: &str, key: &RequestKey) -> Result<()>;
}

/// SQLite-based partition store.
pub struct SqlitePartitions {
  conn: Mutex<Connection>,
}

impl SqlitePartitions {
  /// Open or create the store at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store. Nothing survives the process.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachegate").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(PARTITION_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for partition tables.
const PARTITION_SCHEMA: &str = r#"
-- Named cache partitions; rowid order is creation order
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, keyed by partition + hashed request key
CREATE TABLE IF NOT EXISTS snapshots (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    final_url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_snapshots_key ON snapshots(key_hash);
"#;

impl PartitionStore for SqlitePartitions {
  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM snapshots WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete snapshots of {}: {}", name, e))?;
    conn
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    Ok(())
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<StoredSnapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, final_url, headers, body, cached_at FROM snapshots
         WHERE partition = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![partition, key.storage_hash()], snapshot_columns)
      .optional()
      .map_err(|e| eyre!("Failed to query snapshot: {}", e))?;

    row.map(into_stored_snapshot).transpose()
  }

  fn get_any(&self, key: &RequestKey) -> Result<Option<StoredSnapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT s.status, s.final_url, s.headers, s.body, s.cached_at
         FROM snapshots s
         INNER JOIN partitions p ON s.partition = p.name
         WHERE s.key_hash = ?
         ORDER BY p.rowid
         LIMIT 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![key.storage_hash()], snapshot_columns)
      .optional()
      .map_err(|e| eyre!("Failed to query snapshot: {}", e))?;

    row.map(into_stored_snapshot).transpose()
  }

  fn put(&self, partition: &str, key: &RequestKey, snapshot: &Snapshot) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_partition(&conn, partition)?;
    insert_snapshot(&conn, partition, key, snapshot)?;

    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Snapshot)]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = (|| -> Result<()> {
      insert_partition(&conn, partition)?;
      for (key, snapshot) in entries {
        insert_snapshot(&conn, partition, key, snapshot)?;
      }
      Ok(())
    })();

    match result {
      Ok(()) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      }
      Err(err) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(err)
      }
    }
  }

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM snapshots WHERE partition = ? AND key_hash = ?",
        params![partition, key.storage_hash()],
      )
      .map_err(|e| eyre!("Failed to delete snapshot: {}", e))?;

    Ok(())
  }
}

fn insert_partition(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;
  Ok(())
}

fn insert_snapshot(
  conn: &Connection,
  partition: &str,
  key: &RequestKey,
  snapshot: &Snapshot,
) -> Result<()> {
  let headers = serde_json::to_string(&snapshot.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO snapshots
         (partition, key_hash, method, url, status, final_url, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.storage_hash(),
        key.method(),
        key.url(),
        snapshot.status,
        snapshot.url.as_str(),
        headers,
        snapshot.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store snapshot for {}: {}", key.url(), e))?;

  Ok(())
}

type SnapshotRow = (u16, String, String, Vec<u8>, String);

fn snapshot_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn into_stored_snapshot(row: SnapshotRow) -> Result<StoredSnapshot> {
  let (status, final_url, headers, body, cached_at) = row;

  let url = url::Url::parse(&final_url)
    .map_err(|e| eyre!("Corrupt snapshot URL '{}': {}", final_url, e))?;
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Corrupt snapshot headers: {}", e))?;

  Ok(StoredSnapshot {
    snapshot: Snapshot {
      status,
      url,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
