//! Change notifications: "this resource changed" broadcasts and their listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::promise::Executor;
use crate::resource::ResourceRef;

/// Which notifications a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  /// Same authority and path; query ignored
  Exact,
  /// The path itself or anything below it
  Descendants,
}

type Listener = Arc<dyn Fn(&ResourceRef) + Send + Sync>;

struct Entry {
  resource: ResourceRef,
  scope: Scope,
  listener: Listener,
}

impl Entry {
  fn matches(&self, changed: &ResourceRef) -> bool {
    match self.scope {
      Scope::Exact => self.resource.same_path(changed),
      Scope::Descendants => {
        self.resource.same_path(changed) || changed.is_descendant_of(&self.resource)
      }
    }
  }
}

struct Listeners {
  next_id: AtomicU64,
  entries: Mutex<HashMap<u64, Entry>>,
}

/// Broadcast channel for resource changes.
///
/// Listeners run as fresh pool tasks, never on the thread calling `notify`.
#[derive(Clone)]
pub struct ChangeNotifier {
  executor: Executor,
  listeners: Arc<Listeners>,
}

impl ChangeNotifier {
  pub fn new(executor: Executor) -> Self {
    Self {
      executor,
      listeners: Arc::new(Listeners {
        next_id: AtomicU64::new(1),
        entries: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Register `listener` for changes to `resource`.
  ///
  /// The listener stays registered until the returned handle is unsubscribed or
  /// dropped.
  pub fn subscribe<F>(&self, resource: &ResourceRef, scope: Scope, listener: F) -> Subscription
  where
    F: Fn(&ResourceRef) + Send + Sync + 'static,
  {
    let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
    let entry = Entry {
      resource: resource.without_params(),
      scope,
      listener: Arc::new(listener),
    };
    self
      .listeners
      .entries
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .insert(id, entry);

    Subscription {
      id,
      listeners: Arc::downgrade(&self.listeners),
    }
  }

  /// Tell every matching listener that `resource` changed.
  pub fn notify(&self, resource: &ResourceRef) {
    let matching: Vec<Listener> = self
      .listeners
      .entries
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .values()
      .filter(|entry| entry.matches(resource))
      .map(|entry| Arc::clone(&entry.listener))
      .collect();

    tracing::debug!(%resource, listeners = matching.len(), "change notification");

    for listener in matching {
      let changed = resource.clone();
      self.executor.execute(move || listener(&changed));
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .listeners
      .entries
      .lock()
      .map(|entries| entries.len())
      .unwrap_or(0)
  }
}

/// A registered listener. Dropping it unsubscribes.
pub struct Subscription {
  id: u64,
  listeners: Weak<Listeners>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(listeners) = self.listeners.upgrade() {
      listeners
        .entries
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(&self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}
