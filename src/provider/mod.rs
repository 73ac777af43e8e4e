//! Identifier-addressed resource providers and their decorators.
//!
//! A raw provider (usually a [`RoutedProvider`]) does the actual work. It is wrapped
//! by an [`ObservableProvider`], which broadcasts changes after writes, and that in
//! turn by a [`CachingProvider`], which answers reads from the two-tier cache.

mod cached;
mod observable;
pub mod router;

pub use cached::CachingProvider;
pub use observable::ObservableProvider;
pub use router::{Operation, RouteContext, RouteTable, RouteTemplate, RoutedProvider};

use crate::cache::CacheValue;
use crate::error::Result;
use crate::promise::ObservablePromise;
use crate::resource::ResourceRef;

/// Asynchronous operations on the resources of one authority.
///
/// Every operation returns immediately with a promise bound to `resource`. An `Err`
/// means the operation could not even be scheduled.
pub trait Provider<T: CacheValue>: Send + Sync {
  fn fetch(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>>;

  fn fetch_all(&self, resource: &ResourceRef) -> Result<ObservablePromise<Vec<T>>>;

  /// Create `object` inside the collection at `resource`.
  fn insert(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>>;

  fn insert_many(&self, resource: &ResourceRef, objects: Vec<T>)
    -> Result<ObservablePromise<Vec<T>>>;

  /// Replace the object at `resource`.
  fn update(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>>;

  /// Remove the object at `resource`, resolving with the removed object.
  fn delete(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>>;

  /// Drop any cached state for `resource`.
  fn clear(&self, _resource: &ResourceRef) {}

  /// Tell listeners that `resource` changed.
  fn invalidate(&self, _resource: &ResourceRef) {}

  /// Drop every cached entry this provider holds.
  fn clear_all(&self) {}
}
