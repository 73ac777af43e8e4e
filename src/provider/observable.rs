use std::sync::Arc;

use super::Provider;
use crate::cache::CacheValue;
use crate::error::Result;
use crate::notify::ChangeNotifier;
use crate::promise::{Dispatch, ObservablePromise};
use crate::resource::ResourceRef;

/// Turns writes into change notifications.
///
/// Inserts and updates notify the reference they were issued on; deletes notify the
/// parent collection. The notification goes out once the write has settled (or right
/// away if it could not be scheduled), so listeners re-reading it see the backend's
/// state. A cancelled write notifies nobody.
pub struct ObservableProvider<T> {
  inner: Arc<dyn Provider<T>>,
  notifier: ChangeNotifier,
}

impl<T> Clone for ObservableProvider<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      notifier: self.notifier.clone(),
    }
  }
}

impl<T: CacheValue> ObservableProvider<T> {
  pub fn new(inner: Arc<dyn Provider<T>>, notifier: ChangeNotifier) -> Self {
    Self { inner, notifier }
  }

  pub fn notifier(&self) -> &ChangeNotifier {
    &self.notifier
  }

  /// Notify `changed` when `write` succeeds or fails.
  fn notify_when_settled<V>(
    &self,
    write: Result<ObservablePromise<V>>,
    changed: ResourceRef,
  ) -> Result<ObservablePromise<V>>
  where
    V: Clone + Send + 'static,
  {
    let promise = match write {
      Ok(promise) => promise,
      Err(e) => {
        self.notifier.notify(&changed);
        return Err(e);
      }
    };

    let (notifier, resource) = (self.notifier.clone(), changed.clone());
    promise.on_ready(Dispatch::Inline, move |_| notifier.notify(&resource));
    let notifier = self.notifier.clone();
    promise.on_error(Dispatch::Inline, move |_| notifier.notify(&changed));
    Ok(promise)
  }
}

impl<T: CacheValue> Provider<T> for ObservableProvider<T> {
  fn fetch(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    self.inner.fetch(resource)
  }

  fn fetch_all(&self, resource: &ResourceRef) -> Result<ObservablePromise<Vec<T>>> {
    self.inner.fetch_all(resource)
  }

  fn insert(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>> {
    self.notify_when_settled(self.inner.insert(resource, object), resource.clone())
  }

  fn insert_many(
    &self,
    resource: &ResourceRef,
    objects: Vec<T>,
  ) -> Result<ObservablePromise<Vec<T>>> {
    self.notify_when_settled(self.inner.insert_many(resource, objects), resource.clone())
  }

  fn update(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>> {
    self.notify_when_settled(self.inner.update(resource, object), resource.clone())
  }

  fn delete(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    // The object is gone; only listeners on its collection care
    self.notify_when_settled(self.inner.delete(resource), resource.parent())
  }

  fn clear(&self, resource: &ResourceRef) {
    self.inner.clear(resource);
  }

  fn invalidate(&self, resource: &ResourceRef) {
    self.notifier.notify(resource);
  }

  fn clear_all(&self) {
    self.inner.clear_all();
  }
}
