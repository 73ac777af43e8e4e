//! Authority-addressed dispatch of provider operations.
//!
//! A [`Registry`] maps authorities to providers. The [`Resolver`] looks the provider up
//! for every call, forwards the operation and, for auto-updating reads, keeps the
//! returned promise live by re-fetching whenever the resource changes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cache::CacheValue;
use crate::error::{ResolverError, Result};
use crate::notify::{ChangeNotifier, Scope};
use crate::promise::ObservablePromise;
use crate::provider::Provider;
use crate::resource::ResourceRef;

/// Type-erased administrative view of a registered provider.
trait Administer: Send + Sync {
  fn clear(&self, resource: &ResourceRef);
  fn invalidate(&self, resource: &ResourceRef);
  fn clear_all(&self);
}

struct Erased<T>(Arc<dyn Provider<T>>);

impl<T: CacheValue> Administer for Erased<T> {
  fn clear(&self, resource: &ResourceRef) {
    self.0.clear(resource);
  }

  fn invalidate(&self, resource: &ResourceRef) {
    self.0.invalidate(resource);
  }

  fn clear_all(&self) {
    self.0.clear_all();
  }
}

struct Registration {
  entity: &'static str,
  // Always an `Arc<dyn Provider<T>>` for the registered `T`
  typed: Box<dyn Any + Send + Sync>,
  admin: Box<dyn Administer>,
}

/// Authority -> provider table. Built once at startup and shared.
#[derive(Default)]
pub struct Registry {
  providers: RwLock<HashMap<String, Registration>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `authority` with `provider`, replacing any previous registration.
  pub fn register<T: CacheValue>(&self, authority: &str, provider: Arc<dyn Provider<T>>) {
    let registration = Registration {
      entity: std::any::type_name::<T>(),
      typed: Box::new(Arc::clone(&provider)),
      admin: Box::new(Erased(provider)),
    };

    let previous = self
      .providers
      .write()
      .unwrap_or_else(|p| p.into_inner())
      .insert(authority.to_string(), registration);

    if previous.is_some() {
      tracing::warn!(authority, "provider registration replaced");
    } else {
      tracing::debug!(authority, entity = std::any::type_name::<T>(), "provider registered");
    }
  }

  pub fn unregister(&self, authority: &str) -> bool {
    self
      .providers
      .write()
      .unwrap_or_else(|p| p.into_inner())
      .remove(authority)
      .is_some()
  }

  pub fn authorities(&self) -> Vec<String> {
    let mut authorities: Vec<String> = self
      .providers
      .read()
      .unwrap_or_else(|p| p.into_inner())
      .keys()
      .cloned()
      .collect();
    authorities.sort();
    authorities
  }

  /// The provider serving `authority`, if it serves `T`.
  pub fn provider<T: CacheValue>(&self, authority: &str) -> Result<Arc<dyn Provider<T>>> {
    let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
    let registration = providers
      .get(authority)
      .ok_or_else(|| ResolverError::ProviderNotFound(authority.to_string()))?;

    registration
      .typed
      .downcast_ref::<Arc<dyn Provider<T>>>()
      .cloned()
      .ok_or_else(|| {
        tracing::error!(
          authority,
          registered = registration.entity,
          requested = std::any::type_name::<T>(),
          "provider serves another entity type"
        );
        ResolverError::ProviderTypeMismatch {
          authority: authority.to_string(),
          entity: std::any::type_name::<T>(),
        }
      })
  }

  /// Run `f` on the administrative view of the provider for `authority`, if any.
  fn administer(&self, authority: &str, f: impl FnOnce(&dyn Administer)) -> bool {
    let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
    match providers.get(authority) {
      Some(registration) => {
        f(registration.admin.as_ref());
        true
      }
      None => false,
    }
  }
}

/// Front door for identifier-addressed operations.
#[derive(Clone)]
pub struct Resolver {
  registry: Arc<Registry>,
  notifier: ChangeNotifier,
}

impl Resolver {
  /// `notifier` must be the channel the registered providers notify on.
  pub fn new(registry: Arc<Registry>, notifier: ChangeNotifier) -> Self {
    Self { registry, notifier }
  }

  pub fn registry(&self) -> &Arc<Registry> {
    &self.registry
  }

  fn provider<T: CacheValue>(&self, resource: &ResourceRef) -> Result<Arc<dyn Provider<T>>> {
    self
      .registry
      .provider::<T>(resource.authority())
      .inspect_err(|e| tracing::error!(%resource, error = %e, "no provider for resource"))
  }

  /// Fetch one object. With `auto_update` the returned promise fires again with a
  /// fresh value every time the resource changes, until it is cancelled or dropped.
  pub fn fetch<T: CacheValue>(
    &self,
    resource: &ResourceRef,
    auto_update: bool,
  ) -> Result<ObservablePromise<T>> {
    let provider = self.provider::<T>(resource)?;
    let promise = provider
      .fetch(resource)
      .inspect_err(|e| log_failure("fetch", resource, e))?;

    if auto_update {
      self.keep_live(&promise, move |r| provider.fetch(r));
    }
    Ok(promise)
  }

  /// Fetch a collection; `auto_update` as for [`Resolver::fetch`].
  pub fn fetch_all<T: CacheValue>(
    &self,
    resource: &ResourceRef,
    auto_update: bool,
  ) -> Result<ObservablePromise<Vec<T>>> {
    let provider = self.provider::<T>(resource)?;
    let promise = provider
      .fetch_all(resource)
      .inspect_err(|e| log_failure("fetch all", resource, e))?;

    if auto_update {
      self.keep_live(&promise, move |r| provider.fetch_all(r));
    }
    Ok(promise)
  }

  pub fn insert<T: CacheValue>(
    &self,
    resource: &ResourceRef,
    object: T,
  ) -> Result<ObservablePromise<T>> {
    self
      .provider::<T>(resource)?
      .insert(resource, object)
      .inspect_err(|e| log_failure("insert", resource, e))
  }

  pub fn insert_many<T: CacheValue>(
    &self,
    resource: &ResourceRef,
    objects: Vec<T>,
  ) -> Result<ObservablePromise<Vec<T>>> {
    self
      .provider::<T>(resource)?
      .insert_many(resource, objects)
      .inspect_err(|e| log_failure("insert many", resource, e))
  }

  pub fn update<T: CacheValue>(
    &self,
    resource: &ResourceRef,
    object: T,
  ) -> Result<ObservablePromise<T>> {
    self
      .provider::<T>(resource)?
      .update(resource, object)
      .inspect_err(|e| log_failure("update", resource, e))
  }

  pub fn delete<T: CacheValue>(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    self
      .provider::<T>(resource)?
      .delete(resource)
      .inspect_err(|e| log_failure("delete", resource, e))
  }

  /// Drop cached state for `resource` and tell its listeners.
  pub fn clear(&self, resource: &ResourceRef) {
    let found = self.registry.administer(resource.authority(), |admin| {
      admin.clear(resource);
      admin.invalidate(resource);
    });
    if !found {
      tracing::debug!(%resource, "clear: no provider registered");
    }
  }

  pub fn invalidate(&self, resource: &ResourceRef) {
    self
      .registry
      .administer(resource.authority(), |admin| admin.invalidate(resource));
  }

  /// Drop every cached entry of the provider serving `authority`.
  pub fn clear_all(&self, authority: &str) {
    if !self.registry.administer(authority, |admin| admin.clear_all()) {
      tracing::debug!(authority, "clear all: no provider registered");
    }
  }

  /// Re-issue the read whenever the promise's resource changes, renewing the promise.
  fn keep_live<V, F>(&self, promise: &ObservablePromise<V>, refetch: F)
  where
    V: Clone + Send + 'static,
    F: Fn(&ResourceRef) -> Result<ObservablePromise<V>> + Send + Sync + 'static,
  {
    // The listener holds the bare promise; the subscription lives in the handle, so
    // dropping the last handle ends the updates
    let target = promise.promise().clone();
    let resource = promise.resource().clone();
    let subscription = self
      .notifier
      .subscribe(promise.resource(), Scope::Exact, move |changed| {
        if target.is_cancelled() {
          return;
        }
        tracing::debug!(%resource, %changed, "resource changed, refreshing");
        match refetch(&resource) {
          Ok(fresh) => target.renew(&fresh),
          Err(e) => tracing::warn!(%resource, error = %e, "refresh failed"),
        }
      });
    promise.set_subscription(subscription);
  }
}

fn log_failure(operation: &str, resource: &ResourceRef, error: &ResolverError) {
  if error.is_absent() {
    tracing::debug!(operation, %resource, %error, "nothing to serve");
  } else {
    tracing::error!(operation, %resource, %error, "operation could not be scheduled");
  }
}
