use std::ops::Deref;
use std::sync::{Arc, Mutex};

use super::base::Promise;
use crate::notify::Subscription;
use crate::resource::ResourceRef;

/// A promise bound to the resource it was computed from.
///
/// It may carry one change subscription (installed by auto-updating reads). The
/// subscription is released on `cancel`, when replaced, or when the last handle is
/// dropped.
pub struct ObservablePromise<T> {
  promise: Promise<T>,
  resource: ResourceRef,
  subscription: Arc<Mutex<Option<Subscription>>>,
}

impl<T> Clone for ObservablePromise<T> {
  fn clone(&self) -> Self {
    Self {
      promise: self.promise.clone(),
      resource: self.resource.clone(),
      subscription: Arc::clone(&self.subscription),
    }
  }
}

impl<T: Clone + Send + 'static> ObservablePromise<T> {
  pub fn new(promise: Promise<T>, resource: ResourceRef) -> Self {
    Self {
      promise,
      resource,
      subscription: Arc::new(Mutex::new(None)),
    }
  }

  pub fn resource(&self) -> &ResourceRef {
    &self.resource
  }

  /// The plain promise; shares state with this handle.
  pub fn promise(&self) -> &Promise<T> {
    &self.promise
  }

  /// Install a change subscription, unsubscribing any previous one first.
  pub fn set_subscription(&self, subscription: Subscription) {
    let mut slot = self
      .subscription
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(previous) = slot.take() {
      previous.unsubscribe();
    }
    tracing::debug!(resource = %self.resource, "subscribed to changes");
    *slot = Some(subscription);
  }

  pub fn is_subscribed(&self) -> bool {
    self
      .subscription
      .lock()
      .map(|slot| slot.is_some())
      .unwrap_or(false)
  }

  /// Cancel the promise and release the subscription.
  pub fn cancel(&self) {
    self.promise.cancel();
    let previous = self
      .subscription
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(subscription) = previous {
      subscription.unsubscribe();
    }
  }
}

impl<T> Deref for ObservablePromise<T> {
  type Target = Promise<T>;

  fn deref(&self) -> &Promise<T> {
    &self.promise
  }
}

impl<T> std::fmt::Debug for ObservablePromise<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ObservablePromise")
      .field("resource", &self.resource.to_string())
      .field("promise", &self.promise)
      .finish_non_exhaustive()
  }
}
