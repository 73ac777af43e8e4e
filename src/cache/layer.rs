//! Two-tier cache: bounded in-memory LRU in front of a durable store.

use moka::policy::EvictionPolicy;
use std::marker::PhantomData;

use super::storage::DurableStore;
use super::traits::CacheValue;
use crate::config::CacheConfig;

/// Fast tier first, durable tier second.
///
/// Durable failures are logged and otherwise ignored: the fast tier stays
/// authoritative for the lifetime of the process.
pub struct Cache<T> {
  name: String,
  fast: moka::sync::Cache<String, T>,
  durable: Option<DurableStore>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: CacheValue> Cache<T> {
  /// Open the cache called `name` with the given durable byte budget.
  ///
  /// If the durable store cannot be opened the cache runs in memory only.
  pub fn open(config: &CacheConfig, name: &str, budget: u64) -> Self {
    let durable = if config.durable {
      let opened = config
        .resolved_dir()
        .map_err(|e| e.to_string())
        .and_then(|dir| {
          DurableStore::open(&dir, name, budget, config.schema_version).map_err(|e| e.to_string())
        });

      match opened {
        Ok(store) => Some(store),
        Err(e) => {
          tracing::warn!(cache = name, error = %e, "could not open durable store, using memory only");
          None
        }
      }
    } else {
      None
    };

    Self::build(name, config.fast_entries, durable)
  }

  /// A cache over an already opened durable store.
  pub fn with_store(name: &str, fast_entries: u64, store: DurableStore) -> Self {
    Self::build(name, fast_entries, Some(store))
  }

  /// A cache without durable tier.
  pub fn memory_only(name: &str, fast_entries: u64) -> Self {
    Self::build(name, fast_entries, None)
  }

  fn build(name: &str, fast_entries: u64, durable: Option<DurableStore>) -> Self {
    let fast = moka::sync::Cache::builder()
      .name(name)
      .max_capacity(fast_entries)
      .eviction_policy(EvictionPolicy::lru())
      .build();

    Self {
      name: name.to_string(),
      fast,
      durable,
      _marker: PhantomData,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_durable(&self) -> bool {
    self.durable.is_some()
  }

  /// Look `key` up in the fast tier, then the durable one (backfilling on a hit).
  pub fn get(&self, key: &str) -> Option<T> {
    if let Some(value) = self.fast.get(key) {
      return Some(value);
    }

    // Concurrent misses on one key share a single durable read and backfill
    self
      .fast
      .optionally_get_with(key.to_string(), || self.load_durable(key))
  }

  fn load_durable(&self, key: &str) -> Option<T> {
    let store = self.durable.as_ref()?;

    let data = match store.get(key) {
      Ok(Some(data)) => data,
      Ok(None) => return None,
      Err(e) => {
        tracing::warn!(cache = %self.name, key, error = %e, "durable read failed");
        return None;
      }
    };

    match serde_json::from_slice(&data) {
      Ok(value) => Some(value),
      Err(e) => {
        // Undecodable entries are stale shapes; drop them and report a miss
        tracing::debug!(cache = %self.name, key, error = %e, "durable entry undecodable");
        if let Err(e) = store.remove(key) {
          tracing::warn!(cache = %self.name, key, error = %e, "durable remove failed");
        }
        None
      }
    }
  }

  /// Write to both tiers.
  pub fn put(&self, key: &str, value: &T) {
    self.fast.insert(key.to_string(), value.clone());

    let Some(store) = &self.durable else {
      return;
    };

    let written = serde_json::to_vec(value)
      .map_err(crate::error::ResolverError::from)
      .and_then(|data| store.put(key, &data));
    if let Err(e) = written {
      tracing::warn!(cache = %self.name, key, error = %e, "durable write failed");
    }
  }

  pub fn remove(&self, key: &str) {
    self.fast.invalidate(key);

    if let Some(store) = &self.durable {
      if let Err(e) = store.remove(key) {
        tracing::warn!(cache = %self.name, key, error = %e, "durable remove failed");
      }
    }
  }

  pub fn exists(&self, key: &str) -> bool {
    if self.fast.contains_key(key) {
      return true;
    }

    match &self.durable {
      Some(store) => store.exists(key).unwrap_or_else(|e| {
        tracing::warn!(cache = %self.name, key, error = %e, "durable lookup failed");
        false
      }),
      None => false,
    }
  }

  /// Drop everything; the durable tier is kept when `fast_only` is set.
  pub fn clear(&self, fast_only: bool) {
    self.fast.invalidate_all();

    if fast_only {
      return;
    }
    if let Some(store) = &self.durable {
      if let Err(e) = store.clear() {
        tracing::warn!(cache = %self.name, error = %e, "durable clear failed");
      }
    }
  }

  /// Entries currently held by the fast tier, after pending evictions ran.
  pub fn fast_len(&self) -> u64 {
    self.fast.run_pending_tasks();
    self.fast.entry_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Shape {
    sides: u32,
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Renamed {
    corners: u32,
  }

  fn durable_cache<T: CacheValue>(fast_entries: u64) -> Cache<T> {
    let store = DurableStore::in_memory("shape", 1_000_000, 1).unwrap();
    Cache::with_store("shape", fast_entries, store)
  }

  #[test]
  fn test_read_after_write() {
    let cache = durable_cache::<Shape>(10);
    cache.put("k", &Shape { sides: 3 });
    assert_eq!(cache.get("k"), Some(Shape { sides: 3 }));

    cache.put("k", &Shape { sides: 4 });
    assert_eq!(cache.get("k"), Some(Shape { sides: 4 }));

    cache.remove("k");
    assert_eq!(cache.get("k"), None);
    assert!(!cache.exists("k"));
  }

  #[test]
  fn test_fast_tier_is_bounded() {
    let cache = Cache::<u32>::memory_only("numbers", 2);
    for i in 0..10 {
      cache.put(&i.to_string(), &i);
    }
    assert!(cache.fast_len() <= 2);
  }

  #[test]
  fn test_durable_hit_backfills_fast_tier() {
    let cache = durable_cache::<Shape>(10);
    cache.put("k", &Shape { sides: 5 });
    cache.clear(true);
    assert_eq!(cache.fast_len(), 0);

    assert!(cache.exists("k"));
    assert_eq!(cache.get("k"), Some(Shape { sides: 5 }));
    assert_eq!(cache.fast_len(), 1);
  }

  #[test]
  fn test_full_clear_empties_durable_tier() {
    let cache = durable_cache::<Shape>(10);
    cache.put("k", &Shape { sides: 5 });
    cache.clear(false);
    assert_eq!(cache.get("k"), None);
  }

  #[test]
  fn test_undecodable_entry_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    {
      let store = DurableStore::open(dir.path(), "shape", 1_000, 1).unwrap();
      let cache = Cache::with_store("shape", 10, store);
      cache.put("k", &Shape { sides: 6 });
    }

    let store = DurableStore::open(dir.path(), "shape", 1_000, 1).unwrap();
    let cache = Cache::<Renamed>::with_store("shape", 10, store);
    assert_eq!(cache.get("k"), None);
    assert!(!cache.exists("k"));
  }

  #[test]
  fn test_schema_version_bump_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let config = |version| CacheConfig {
      dir: Some(dir.path().to_path_buf()),
      schema_version: version,
      ..CacheConfig::default()
    };

    {
      let cache = Cache::<Shape>::open(&config(1), "shape", 1_000);
      assert!(cache.is_durable());
      cache.put("k", &Shape { sides: 8 });
    }

    let reopened = Cache::<Shape>::open(&config(1), "shape", 1_000);
    assert_eq!(reopened.get("k"), Some(Shape { sides: 8 }));
    drop(reopened);

    let upgraded = Cache::<Shape>::open(&config(2), "shape", 1_000);
    assert_eq!(upgraded.get("k"), None);
  }

  #[test]
  fn test_disabled_durable_tier() {
    let config = CacheConfig {
      durable: false,
      ..CacheConfig::default()
    };
    let cache = Cache::<Shape>::open(&config, "shape", 1_000);
    assert!(!cache.is_durable());
    cache.put("k", &Shape { sides: 1 });
    assert_eq!(cache.get("k"), Some(Shape { sides: 1 }));
  }
}
