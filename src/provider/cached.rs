//! Caching provider that wraps an observable provider with transparent caching.

use std::sync::{Arc, Mutex};

use super::{ObservableProvider, Provider};
use crate::cache::{Cache, Cacheable};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::promise::{Dispatch, Executor, ObservablePromise};
use crate::resource::{KeyPolicy, ResourceRef};

/// Object cache and collection cache of one entity type.
struct Caches<T> {
  objects: Cache<T>,
  collections: Cache<Vec<T>>,
  keys: KeyPolicy,
  // Serializes read-modify-write cycles on cached collections
  merge: Mutex<()>,
}

/// Entries written optimistically, dropped again if the write fails.
#[derive(Debug, Default)]
struct Touched {
  objects: Vec<String>,
  collections: Vec<String>,
}

impl<T: Cacheable> Caches<T> {
  fn lock_merge(&self) -> std::sync::MutexGuard<'_, ()> {
    self.merge.lock().unwrap_or_else(|p| p.into_inner())
  }

  /// Cache one fetched page of the collection at `resource`.
  fn store_page(&self, resource: &ResourceRef, page: &[T]) {
    let collection = resource.without_params();
    for object in page {
      self
        .objects
        .put(&self.keys.member_key(&collection, &object.id()), object);
    }

    let key = self.keys.collection_key(resource);
    let _merge = self.lock_merge();
    let merged = if resource.is_first_page() {
      page.to_vec()
    } else {
      let mut existing = self.collections.get(&key).unwrap_or_default();
      upsert(&mut existing, page.iter().cloned());
      existing
    };

    tracing::debug!(
      key = %key,
      page = page.len(),
      total = merged.len(),
      "cached collection page"
    );
    self.collections.put(&key, &merged);
  }

  /// Optimistically add `object` to the collection at `resource`.
  fn inject_created(&self, resource: &ResourceRef, object: &T, touched: &mut Touched) {
    let object_key = self.keys.member_key(resource, &object.id());
    self.objects.put(&object_key, object);
    touched.objects.push(object_key);

    let key = self.keys.collection_key(resource);
    let _merge = self.lock_merge();
    if let Some(mut existing) = self.collections.get(&key) {
      upsert(&mut existing, std::iter::once(object.clone()));
      self.collections.put(&key, &existing);
      touched.collections.push(key);
    }
  }

  /// Optimistically replace the object at `resource`, in its parent collection too.
  fn inject_updated(&self, resource: &ResourceRef, object: &T, touched: &mut Touched) {
    let object_key = self.keys.request_key(resource);
    self.objects.put(&object_key, object);
    touched.objects.push(object_key);

    let key = self.keys.collection_key(&resource.parent());
    let _merge = self.lock_merge();
    let Some(mut existing) = self.collections.get(&key) else {
      return;
    };

    let id = object.id();
    if let Some(slot) = existing.iter_mut().find(|o| o.id() == id) {
      *slot = object.clone();
      self.collections.put(&key, &existing);
      touched.collections.push(key);
    }
  }

  fn rollback(&self, touched: &Touched) {
    for key in &touched.objects {
      self.objects.remove(key);
    }
    for key in &touched.collections {
      self.collections.remove(key);
    }
  }

  fn clear(&self, resource: &ResourceRef) {
    let key = self.keys.request_key(resource);
    self.objects.remove(&key);
    self.collections.remove(&key);

    let collection_key = self.keys.collection_key(resource);
    if collection_key != key {
      self.collections.remove(&collection_key);
    }
  }
}

/// Replace same-id elements with `incoming`, append the rest, then sort by id.
///
/// The sort is stable, so elements sharing an id keep their relative order.
fn upsert<T: Cacheable>(existing: &mut Vec<T>, incoming: impl IntoIterator<Item = T>) {
  for object in incoming {
    let id = object.id();
    existing.retain(|o| o.id() != id);
    existing.push(object);
  }
  existing.sort_by_key(|o| o.id());
}

/// Provider with transparent caching support.
///
/// Wraps an observable provider and keeps two caches per entity type: single objects
/// (keyed by their reference) and collections (keyed by the collection reference,
/// with every page merged into one entry). Writes are applied to the caches before
/// they are handed to the wrapped provider and rolled back if they fail.
pub struct CachingProvider<T> {
  inner: ObservableProvider<T>,
  caches: Arc<Caches<T>>,
  executor: Executor,
}

impl<T: Cacheable> CachingProvider<T> {
  /// Create the provider, opening the `<entity>` and `<entity>_fetchAll` stores.
  pub fn new(inner: ObservableProvider<T>, config: &CacheConfig, executor: Executor) -> Self {
    let name = T::entity_type();
    let objects = Cache::open(config, name, config.object_budget_bytes);
    let collections = Cache::open(
      config,
      &format!("{}_fetchAll", name),
      config.collection_budget_bytes,
    );
    let keys = KeyPolicy::new(config.ignored_params.iter().cloned());

    Self::with_caches(inner, objects, collections, keys, executor)
  }

  pub fn with_caches(
    inner: ObservableProvider<T>,
    objects: Cache<T>,
    collections: Cache<Vec<T>>,
    keys: KeyPolicy,
    executor: Executor,
  ) -> Self {
    Self {
      inner,
      caches: Arc::new(Caches {
        objects,
        collections,
        keys,
        merge: Mutex::new(()),
      }),
      executor,
    }
  }

  /// The object currently cached for `resource`, without touching the provider.
  pub fn cached(&self, resource: &ResourceRef) -> Option<T> {
    self.caches.objects.get(&self.caches.keys.request_key(resource))
  }

  /// The collection currently cached for `resource`, without touching the provider.
  pub fn cached_collection(&self, resource: &ResourceRef) -> Option<Vec<T>> {
    self
      .caches
      .collections
      .get(&self.caches.keys.collection_key(resource))
  }

  /// Drop the optimistic entries again if `promise` fails, and tell readers.
  fn roll_back_on_error<V>(&self, promise: &ObservablePromise<V>, touched: Touched)
  where
    V: Clone + Send + 'static,
  {
    if touched.objects.is_empty() && touched.collections.is_empty() {
      return;
    }

    let caches = Arc::clone(&self.caches);
    let inner = self.inner.clone();
    let resource = promise.resource().clone();
    promise.on_error(Dispatch::Inline, move |error| {
      tracing::warn!(%resource, %error, "write failed, rolling back cached entries");
      caches.rollback(&touched);
      inner.invalidate(&resource);
    });
  }

  fn write<V, F>(
    &self,
    resource: &ResourceRef,
    touched: Touched,
    write: F,
  ) -> Result<ObservablePromise<V>>
  where
    V: Clone + Send + 'static,
    F: FnOnce() -> Result<ObservablePromise<V>>,
  {
    match write() {
      Ok(promise) => {
        self.roll_back_on_error(&promise, touched);
        Ok(promise)
      }
      Err(e) => {
        self.caches.rollback(&touched);
        self.inner.invalidate(resource);
        Err(e)
      }
    }
  }
}

impl<T: Cacheable> Provider<T> for CachingProvider<T> {
  fn fetch(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    if resource.no_cache() {
      return self.inner.fetch(resource);
    }

    let key = self.caches.keys.request_key(resource);
    if let Some(hit) = self.caches.objects.get(&key) {
      tracing::debug!(%resource, "[cached] fetch");
      return Ok(self.executor.observe_resolved(resource.clone(), hit));
    }

    tracing::debug!(%resource, "fetch");
    let promise = self.inner.fetch(resource)?;
    let caches = Arc::clone(&self.caches);
    promise.on_ready(Dispatch::Inline, move |object| {
      caches.objects.put(&key, &object);
    });
    Ok(promise)
  }

  fn fetch_all(&self, resource: &ResourceRef) -> Result<ObservablePromise<Vec<T>>> {
    if resource.no_cache() {
      tracing::debug!(%resource, "fetch all, cache bypassed");
      return self.inner.fetch_all(resource);
    }

    if resource.is_first_page() {
      let key = self.caches.keys.collection_key(resource);
      if let Some(hit) = self.caches.collections.get(&key) {
        tracing::debug!(%resource, "[cached] fetch all");
        return Ok(self.executor.observe_resolved(resource.clone(), hit));
      }
    }

    tracing::debug!(%resource, "fetch all");
    let promise = self.inner.fetch_all(resource)?;
    let caches = Arc::clone(&self.caches);
    let page_of = resource.clone();
    promise.on_ready(Dispatch::Inline, move |page| {
      caches.store_page(&page_of, &page);
    });
    Ok(promise)
  }

  fn insert(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>> {
    let mut touched = Touched::default();
    self.caches.inject_created(resource, &object, &mut touched);
    self.write(resource, touched, || self.inner.insert(resource, object))
  }

  fn insert_many(
    &self,
    resource: &ResourceRef,
    objects: Vec<T>,
  ) -> Result<ObservablePromise<Vec<T>>> {
    let mut touched = Touched::default();
    for object in &objects {
      self.caches.inject_created(resource, object, &mut touched);
    }
    self.write(resource, touched, || self.inner.insert_many(resource, objects))
  }

  fn update(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>> {
    let mut touched = Touched::default();
    self.caches.inject_updated(resource, &object, &mut touched);
    self.write(resource, touched, || self.inner.update(resource, object))
  }

  fn delete(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    // Removing one element from a partially cached listing is not safe; drop it
    let parent = resource.parent();
    self.caches.clear(resource);
    self.caches.clear(&parent);

    let promise = self.inner.delete(resource)?;
    // Reads racing the backend may have cached the object again meanwhile
    let caches = Arc::clone(&self.caches);
    let deleted = resource.clone();
    promise.on_ready(Dispatch::Inline, move |_| {
      caches.clear(&deleted);
      caches.clear(&parent);
    });
    Ok(promise)
  }

  fn clear(&self, resource: &ResourceRef) {
    tracing::debug!(%resource, "clearing cached entries");
    self.caches.clear(resource);
  }

  fn invalidate(&self, resource: &ResourceRef) {
    self.inner.invalidate(resource);
  }

  fn clear_all(&self) {
    tracing::info!(entity = T::entity_type(), "clearing all cached entries");
    self.caches.objects.clear(false);
    self.caches.collections.clear(false);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::{ChangeNotifier, Scope};
  use crate::promise::ForegroundReceiver;
  use crate::testing::{self, note, Note, NoteBackend};
  use std::sync::mpsc;
  use std::time::Duration;

  fn r(s: &str) -> ResourceRef {
    ResourceRef::parse(s).unwrap()
  }

  struct Fixture {
    provider: CachingProvider<Note>,
    backend: Arc<NoteBackend>,
    notifier: ChangeNotifier,
    _foreground: ForegroundReceiver,
  }

  fn fixture(notes: &[(&str, &str)]) -> Fixture {
    let (executor, foreground) = testing::executor();
    let notifier = ChangeNotifier::new(executor.clone());
    let backend = NoteBackend::with_notes(notes);
    Fixture {
      provider: testing::caching_notes(executor, notifier.clone(), backend.clone()),
      backend,
      notifier,
      _foreground: foreground,
    }
  }

  fn ids(notes: &[Note]) -> Vec<&str> {
    notes.iter().map(|n| n.id.as_str()).collect()
  }

  #[test]
  fn test_fetch_is_cached_after_first_read() {
    let f = fixture(&[("1", "first")]);
    let item = r("app://notes/items/1");

    assert_eq!(f.provider.fetch(&item).unwrap().get(), Some(note("1", "first")));
    assert_eq!(f.backend.reads(), 1);

    let again = f.provider.fetch(&item).unwrap();
    assert!(again.is_done());
    assert_eq!(again.get(), Some(note("1", "first")));
    assert_eq!(f.backend.reads(), 1);
  }

  #[test]
  fn test_page_size_does_not_split_the_cache() {
    let f = fixture(&[("1", "a"), ("2", "b")]);
    f.provider
      .fetch_all(&r("app://notes/items?pageSize=10"))
      .unwrap()
      .wait_for_completion();

    let hit = f.provider.fetch_all(&r("app://notes/items?pageSize=50")).unwrap();
    assert_eq!(ids(&hit.get().unwrap()), vec!["1", "2"]);
    assert_eq!(f.backend.reads(), 1);
  }

  #[test]
  fn test_pages_merge_into_one_collection() {
    let f = fixture(&[("1", "a"), ("2", "b"), ("3", "c"), ("4", "d")]);

    let first = f.provider.fetch_all(&r("app://notes/items?pageSize=2")).unwrap();
    assert_eq!(ids(&first.get().unwrap()), vec!["1", "2"]);

    let second = f
      .provider
      .fetch_all(&r("app://notes/items?pageSize=2&beginMarker=2"))
      .unwrap();
    assert_eq!(ids(&second.get().unwrap()), vec!["3", "4"]);

    let cached = f.provider.cached_collection(&r("app://notes/items")).unwrap();
    assert_eq!(ids(&cached), vec!["1", "2", "3", "4"]);

    // Every listed object is reachable by its own reference
    assert_eq!(f.provider.cached(&r("app://notes/items/3")), Some(note("3", "c")));
  }

  #[test]
  fn test_continuation_page_replaces_same_id() {
    let f = fixture(&[("1", "a"), ("2", "b")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();

    // Note 2 changed on the backend after the first page was cached
    f.backend.store(note("2", "B"));
    f.provider
      .fetch_all(&r("app://notes/items?beginMarker=1"))
      .unwrap()
      .wait_for_completion();

    let cached = f.provider.cached_collection(&r("app://notes/items")).unwrap();
    assert_eq!(cached, vec![note("1", "a"), note("2", "B")]);
  }

  #[test]
  fn test_cleared_listing_restarts_from_first_page() {
    let f = fixture(&[("1", "a"), ("2", "b")]);
    f.provider
      .fetch_all(&r("app://notes/items?pageSize=1"))
      .unwrap()
      .wait_for_completion();
    f.provider
      .fetch_all(&r("app://notes/items?pageSize=1&beginMarker=1"))
      .unwrap()
      .wait_for_completion();
    assert_eq!(
      ids(&f.provider.cached_collection(&r("app://notes/items")).unwrap()),
      vec!["1", "2"]
    );

    f.provider.clear(&r("app://notes/items"));
    f.provider
      .fetch_all(&r("app://notes/items?pageSize=1"))
      .unwrap()
      .wait_for_completion();
    assert_eq!(
      ids(&f.provider.cached_collection(&r("app://notes/items")).unwrap()),
      vec!["1"]
    );
  }

  #[test]
  fn test_no_cache_bypasses_reads_and_writes() {
    let f = fixture(&[("1", "a")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();
    assert_eq!(f.backend.reads(), 1);

    f.provider
      .insert(&r("app://notes/items"), note("2", "b"))
      .unwrap()
      .wait_for_completion();
    let before = f.provider.cached_collection(&r("app://notes/items")).unwrap();

    let fresh = f
      .provider
      .fetch_all(&r("app://notes/items?noCache=yes&pageSize=1"))
      .unwrap();
    assert_eq!(ids(&fresh.get().unwrap()), vec!["1"]);
    assert_eq!(f.backend.reads(), 2);

    let after = f.provider.cached_collection(&r("app://notes/items")).unwrap();
    assert_eq!(before, after);
  }

  #[test]
  fn test_insert_is_visible_before_the_backend_answers() {
    let f = fixture(&[("1", "a"), ("3", "c")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();

    let inserted = f
      .provider
      .insert(&r("app://notes/items"), note("2", "b"))
      .unwrap();

    assert_eq!(
      ids(&f.provider.cached_collection(&r("app://notes/items")).unwrap()),
      vec!["1", "2", "3"]
    );
    assert_eq!(f.provider.cached(&r("app://notes/items/2")), Some(note("2", "b")));

    assert_eq!(inserted.get(), Some(note("2", "b")));
    assert_eq!(f.backend.get("2"), Some(note("2", "b")));
  }

  #[test]
  fn test_insert_many_updates_collection_once_per_object() {
    let f = fixture(&[("1", "a")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();

    let inserted = f
      .provider
      .insert_many(&r("app://notes/items"), vec![note("3", "c"), note("2", "b")])
      .unwrap();
    assert_eq!(
      ids(&f.provider.cached_collection(&r("app://notes/items")).unwrap()),
      vec!["1", "2", "3"]
    );
    assert_eq!(inserted.get().map(|n| n.len()), Some(2));
  }

  #[test]
  fn test_failed_insert_is_rolled_back() {
    let f = fixture(&[("1", "a")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();

    let (tx, changes) = mpsc::channel();
    let tx = Mutex::new(tx);
    let _sub = f
      .notifier
      .subscribe(&r("app://notes/items"), Scope::Exact, move |c| {
        tx.lock().unwrap().send(c.to_string()).unwrap();
      });

    f.backend.fail_writes(true);
    let (done_tx, done) = mpsc::channel();
    let done_tx = Mutex::new(done_tx);
    f.provider
      .insert(&r("app://notes/items"), note("2", "b"))
      .unwrap()
      .on_error(Dispatch::Inline, move |_| {
        done_tx.lock().unwrap().send(()).unwrap();
      });
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(f.provider.cached(&r("app://notes/items/2")), None);
    assert_eq!(f.provider.cached_collection(&r("app://notes/items")), None);

    // One notification for the write, one for the rollback
    for _ in 0..2 {
      changes.recv_timeout(Duration::from_secs(5)).unwrap();
    }
  }

  #[test]
  fn test_update_replaces_object_and_collection_element() {
    let f = fixture(&[("1", "a"), ("2", "b")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();

    f.provider
      .update(&r("app://notes/items/1"), note("1", "A"))
      .unwrap();

    assert_eq!(f.provider.cached(&r("app://notes/items/1")), Some(note("1", "A")));
    assert_eq!(
      f.provider.cached_collection(&r("app://notes/items")).unwrap(),
      vec![note("1", "A"), note("2", "b")]
    );
  }

  #[test]
  fn test_delete_clears_object_and_parent_only() {
    let f = fixture(&[("1", "a"), ("2", "b")]);
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();
    f.provider.caches.collections.put("app://notes/other", &vec![note("9", "z")]);

    let deleted = f.provider.delete(&r("app://notes/items/1")).unwrap();
    assert_eq!(f.provider.cached(&r("app://notes/items/1")), None);
    assert_eq!(f.provider.cached_collection(&r("app://notes/items")), None);
    assert_eq!(
      f.provider.cached_collection(&r("app://notes/other")),
      Some(vec![note("9", "z")])
    );

    assert_eq!(deleted.get(), Some(note("1", "a")));
  }

  #[test]
  fn test_reads_during_delete_are_dropped_once_it_settles() {
    let f = fixture(&[("1", "a"), ("2", "b")]);
    f.backend.slow_writes(Duration::from_millis(300));

    let deleted = f.provider.delete(&r("app://notes/items/1")).unwrap();
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();
    assert_eq!(f.provider.cached(&r("app://notes/items/1")), Some(note("1", "a")));

    deleted.wait_for_completion();
    assert_eq!(f.provider.cached(&r("app://notes/items/1")), None);
    assert_eq!(f.provider.cached_collection(&r("app://notes/items")), None);
  }

  #[test]
  fn test_clear_all_empties_both_caches() {
    let f = fixture(&[("1", "a")]);
    f.provider
      .fetch(&r("app://notes/items/1"))
      .unwrap()
      .wait_for_completion();
    f.provider
      .fetch_all(&r("app://notes/items"))
      .unwrap()
      .wait_for_completion();

    f.provider.clear_all();
    assert_eq!(f.provider.cached(&r("app://notes/items/1")), None);
    assert_eq!(f.provider.cached_collection(&r("app://notes/items")), None);
  }

  #[test]
  fn test_cache_survives_restart_and_resets_on_version_bump() {
    let dir = tempfile::tempdir().unwrap();
    let config = |version| CacheConfig {
      dir: Some(dir.path().to_path_buf()),
      schema_version: version,
      ..CacheConfig::default()
    };
    let item = r("app://notes/items/1");
    let backend = NoteBackend::with_notes(&[("1", "a")]);

    let open = |version| {
      let (executor, foreground) = testing::executor();
      let notifier = ChangeNotifier::new(executor.clone());
      let raw = testing::routed_notes(executor.clone(), backend.clone());
      let observable = ObservableProvider::new(Arc::new(raw), notifier);
      (
        CachingProvider::new(observable, &config(version), executor),
        foreground,
      )
    };

    {
      let (provider, _fg) = open(1);
      provider.fetch(&item).unwrap().wait_for_completion();
    }
    assert_eq!(backend.reads(), 1);

    {
      let (provider, _fg) = open(1);
      assert_eq!(provider.fetch(&item).unwrap().get(), Some(note("1", "a")));
    }
    assert_eq!(backend.reads(), 1);

    let (provider, _fg) = open(2);
    assert_eq!(provider.cached(&item), None);
    assert_eq!(provider.fetch(&item).unwrap().get(), Some(note("1", "a")));
    assert_eq!(backend.reads(), 2);
  }

  #[test]
  fn test_upsert_sorts_by_id() {
    let mut notes = vec![note("2", "b"), note("1", "a")];
    upsert(&mut notes, vec![note("3", "c"), note("1", "A")]);
    assert_eq!(notes, vec![note("1", "A"), note("2", "b"), note("3", "c")]);
  }
}
