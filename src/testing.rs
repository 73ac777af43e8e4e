//! Shared fixtures: a note entity and an in-memory backend routed like a real one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, Cacheable, DurableStore};
use crate::config::ExecutorConfig;
use crate::notify::ChangeNotifier;
use crate::promise::{Executor, ForegroundQueue, ForegroundReceiver};
use crate::provider::{CachingProvider, ObservableProvider, RouteTable, RoutedProvider};
use crate::resource::{KeyPolicy, BEGIN_MARKER, PAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
  pub id: String,
  pub body: String,
}

impl Cacheable for Note {
  fn id(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "note"
  }
}

pub fn note(id: &str, body: &str) -> Note {
  Note {
    id: id.to_string(),
    body: body.to_string(),
  }
}

pub fn executor() -> (Executor, ForegroundReceiver) {
  let (queue, receiver) = ForegroundQueue::new();
  let config = ExecutorConfig {
    workers: 4,
    ..ExecutorConfig::default()
  };
  (Executor::new(&config, Arc::new(queue)).unwrap(), receiver)
}

/// Notes by id, plus counters so tests can tell cache hits from backend calls.
#[derive(Default)]
pub struct NoteBackend {
  notes: Mutex<BTreeMap<String, Note>>,
  reads: AtomicUsize,
  failing: AtomicBool,
  write_delay: Mutex<Duration>,
}

impl NoteBackend {
  pub fn with_notes(notes: &[(&str, &str)]) -> Arc<Self> {
    let backend = Self::default();
    {
      let mut stored = backend.notes.lock().unwrap();
      for (id, body) in notes {
        stored.insert(id.to_string(), note(id, body));
      }
    }
    Arc::new(backend)
  }

  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  /// Make every subsequent write fail.
  pub fn fail_writes(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  /// Make writes and deletes take `delay` before touching the notes.
  pub fn slow_writes(&self, delay: Duration) {
    *self.write_delay.lock().unwrap() = delay;
  }

  fn pause(&self) {
    let delay = *self.write_delay.lock().unwrap();
    if !delay.is_zero() {
      std::thread::sleep(delay);
    }
  }

  /// Change a note behind the providers' back.
  pub fn store(&self, note: Note) {
    self.notes.lock().unwrap().insert(note.id.clone(), note);
  }

  pub fn get(&self, id: &str) -> Option<Note> {
    self.notes.lock().unwrap().get(id).cloned()
  }

  fn read(&self, id: &str) -> color_eyre::Result<Note> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    self.get(id).ok_or_else(|| eyre!("note {} does not exist", id))
  }

  /// Notes after `beginMarker`, at most `pageSize` of them.
  fn page(&self, after: Option<&str>, size: Option<usize>) -> Vec<Note> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    self
      .notes
      .lock()
      .unwrap()
      .values()
      .filter(|n| after.map_or(true, |marker| n.id.as_str() > marker))
      .take(size.unwrap_or(usize::MAX))
      .cloned()
      .collect()
  }

  fn write(&self, note: Note) -> color_eyre::Result<Note> {
    self.pause();
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("backend rejected note {}", note.id));
    }
    self
      .notes
      .lock()
      .unwrap()
      .insert(note.id.clone(), note.clone());
    Ok(note)
  }

  fn remove(&self, id: &str) -> color_eyre::Result<Note> {
    self.pause();
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("backend refused to delete note {}", id));
    }
    self
      .notes
      .lock()
      .unwrap()
      .remove(id)
      .ok_or_else(|| eyre!("note {} does not exist", id))
  }
}

/// Routes `/items` and `/items/<id>` onto `backend`.
pub fn routed_notes(executor: Executor, backend: Arc<NoteBackend>) -> RoutedProvider<Note> {
  let (fetch, page, insert, insert_all, update, delete) = (
    backend.clone(),
    backend.clone(),
    backend.clone(),
    backend.clone(),
    backend.clone(),
    backend,
  );

  let routes = RouteTable::new()
    .fetch("/items/<id>", move |ctx| fetch.read(ctx.param("id")?))
    .fetch_all("/items", move |ctx| {
      let size = ctx.query(PAGE_SIZE).and_then(|s| s.parse().ok());
      Ok(page.page(ctx.query(BEGIN_MARKER), size))
    })
    .insert("/items", move |_, note| insert.write(note))
    .insert_all("/items", move |_, notes| {
      notes.into_iter().map(|n| insert_all.write(n)).collect()
    })
    .update("/items/<id>", move |_, note| update.write(note))
    .delete("/items/<id>", move |ctx| delete.remove(ctx.param("id")?));

  RoutedProvider::new(executor, routes)
}

/// The full decorator stack over `backend`, with in-memory durable stores.
pub fn caching_notes(
  executor: Executor,
  notifier: ChangeNotifier,
  backend: Arc<NoteBackend>,
) -> CachingProvider<Note> {
  let objects = DurableStore::in_memory("note", 50_000_000, 1).unwrap();
  let collections = DurableStore::in_memory("note_fetchAll", 10_000_000, 1).unwrap();

  CachingProvider::with_caches(
    ObservableProvider::new(
      Arc::new(routed_notes(executor.clone(), backend)),
      notifier,
    ),
    Cache::with_store("note", 100, objects),
    Cache::with_store("note_fetchAll", 100, collections),
    KeyPolicy::default(),
    executor,
  )
}
