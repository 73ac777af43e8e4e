//! Durable cache tier backed by SQLite.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

/// One logical durable store: a byte budget, a schema version, LRU eviction.
pub struct DurableStore {
  name: String,
  path: Option<PathBuf>,
  budget: u64,
  version: u32,
  inner: Mutex<Inner>,
}

struct Inner {
  conn: Connection,
  /// Strictly increasing access clock (millis, bumped on collisions)
  clock: i64,
}

/// Summary of a store, for administration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
  pub name: String,
  pub entries: u64,
  pub bytes: u64,
  pub version: Option<u32>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    key_hash TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    data BLOB NOT NULL,
    size INTEGER NOT NULL,
    version INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_accessed ON entries(accessed_at);

CREATE TABLE IF NOT EXISTS meta (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl DurableStore {
  /// Open (or create) `<dir>/<name>.db`.
  ///
  /// A store last written under another schema version is purged on open.
  pub fn open(dir: &Path, name: &str, budget: u64, version: u32) -> Result<Self> {
    std::fs::create_dir_all(dir)?;
    let path = Self::path_for(dir, name);
    let conn = Connection::open(&path)?;
    Self::init(conn, name, Some(path), budget, version)
  }

  /// A store that lives and dies with the process.
  pub fn in_memory(name: &str, budget: u64, version: u32) -> Result<Self> {
    Self::init(Connection::open_in_memory()?, name, None, budget, version)
  }

  /// Location of the store called `name` under `dir`.
  pub fn path_for(dir: &Path, name: &str) -> PathBuf {
    let file: String = name
      .chars()
      .map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
          c
        } else {
          '_'
        }
      })
      .collect();
    dir.join(format!("{}.db", file))
  }

  fn init(
    conn: Connection,
    name: &str,
    path: Option<PathBuf>,
    budget: u64,
    version: u32,
  ) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;

    let stored: Option<String> = conn
      .query_row("SELECT value FROM meta WHERE name = 'version'", [], |row| {
        row.get(0)
      })
      .optional()?;

    if stored.as_deref() != Some(version.to_string().as_str()) {
      if let Some(previous) = stored {
        tracing::info!(store = name, %previous, version, "schema version changed, purging store");
      }
      conn.execute("DELETE FROM entries", [])?;
      conn.execute(
        "INSERT OR REPLACE INTO meta (name, value) VALUES ('version', ?)",
        params![version.to_string()],
      )?;
    }

    let clock: i64 = conn.query_row(
      "SELECT COALESCE(MAX(accessed_at), 0) FROM entries",
      [],
      |row| row.get(0),
    )?;

    Ok(Self {
      name: name.to_string(),
      path,
      budget,
      version,
      inner: Mutex::new(Inner { conn, clock }),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Read an entry, refreshing its access time.
  ///
  /// Entries stamped with another schema version are dropped and reported absent.
  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let hash = hash_key(key);
    let mut inner = self.lock();

    let row: Option<(Vec<u8>, u32)> = inner
      .conn
      .query_row(
        "SELECT data, version FROM entries WHERE key_hash = ?",
        params![hash],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, version)) if version == self.version => {
        let now = inner.tick();
        inner.conn.execute(
          "UPDATE entries SET accessed_at = ? WHERE key_hash = ?",
          params![now, hash],
        )?;
        Ok(Some(data))
      }
      Some((_, version)) => {
        tracing::debug!(store = %self.name, key, version, "dropping entry from another schema version");
        inner
          .conn
          .execute("DELETE FROM entries WHERE key_hash = ?", params![hash])?;
        Ok(None)
      }
      None => Ok(None),
    }
  }

  /// Write an entry, then evict least recently used entries over the budget.
  pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
    let mut inner = self.lock();
    let now = inner.tick();

    inner.conn.execute(
      "INSERT OR REPLACE INTO entries (key_hash, cache_key, data, size, version, accessed_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![hash_key(key), key, data, data.len() as i64, self.version, now],
    )?;

    self.evict(&inner.conn)
  }

  fn evict(&self, conn: &Connection) -> Result<()> {
    let mut total: i64 =
      conn.query_row("SELECT COALESCE(SUM(size), 0) FROM entries", [], |row| {
        row.get(0)
      })?;
    let budget = self.budget as i64;
    if total <= budget {
      return Ok(());
    }

    let victims: Vec<(String, i64)> = {
      let mut stmt = conn.prepare("SELECT key_hash, size FROM entries ORDER BY accessed_at ASC")?;
      let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
      let mut victims = Vec::new();
      for row in rows {
        if total <= budget {
          break;
        }
        let (hash, size): (String, i64) = row?;
        total -= size;
        victims.push((hash, size));
      }
      victims
    };

    for (hash, _) in &victims {
      conn.execute("DELETE FROM entries WHERE key_hash = ?", params![hash])?;
    }
    tracing::debug!(store = %self.name, evicted = victims.len(), "evicted entries over budget");

    Ok(())
  }

  pub fn remove(&self, key: &str) -> Result<bool> {
    let removed = self
      .lock()
      .conn
      .execute("DELETE FROM entries WHERE key_hash = ?", params![hash_key(key)])?;
    Ok(removed > 0)
  }

  pub fn exists(&self, key: &str) -> Result<bool> {
    let found: Option<i64> = self
      .lock()
      .conn
      .query_row(
        "SELECT 1 FROM entries WHERE key_hash = ? AND version = ?",
        params![hash_key(key), self.version],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  pub fn clear(&self) -> Result<()> {
    self.lock().conn.execute("DELETE FROM entries", [])?;
    Ok(())
  }

  pub fn stats(&self) -> Result<StoreStats> {
    stats_for(&self.lock().conn, &self.name)
  }

  /// Stats of the store at `path` without touching its contents or version.
  pub fn inspect(path: &Path) -> Result<StoreStats> {
    let conn = Connection::open(path)?;
    conn.execute_batch(CACHE_SCHEMA)?;
    let name = path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_default();
    stats_for(&conn, &name)
  }

  /// Delete every entry of the store at `path`, returning how many were removed.
  pub fn purge(path: &Path) -> Result<u64> {
    let conn = Connection::open(path)?;
    conn.execute_batch(CACHE_SCHEMA)?;
    let removed = conn.execute("DELETE FROM entries", [])?;
    Ok(removed as u64)
  }

  /// Every store file under `dir`, sorted by name.
  pub fn list(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
      return Ok(Vec::new());
    }

    let mut stores: Vec<PathBuf> = std::fs::read_dir(dir)?
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| path.extension().is_some_and(|ext| ext == "db"))
      .collect();
    stores.sort();
    Ok(stores)
  }
}

impl Inner {
  fn tick(&mut self) -> i64 {
    self.clock = Utc::now().timestamp_millis().max(self.clock + 1);
    self.clock
  }
}

fn stats_for(conn: &Connection, name: &str) -> Result<StoreStats> {
  let (entries, bytes): (i64, i64) = conn.query_row(
    "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM entries",
    [],
    |row| Ok((row.get(0)?, row.get(1)?)),
  )?;

  let version: Option<String> = conn
    .query_row("SELECT value FROM meta WHERE name = 'version'", [], |row| {
      row.get(0)
    })
    .optional()?;

  Ok(StoreStats {
    name: name.to_string(),
    entries: entries as u64,
    bytes: bytes as u64,
    version: version.and_then(|v| v.parse().ok()),
  })
}

/// SHA256 hash for stable, fixed-length keys
fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}
