//! Core traits for the caching system.

use serde::{de::DeserializeOwned, Serialize};

/// Anything a two-tier cache can hold: cloneable for the fast tier, serde for the
/// durable one.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Trait for resource objects served by providers and cached by them.
///
/// Implementors must provide an identifier unique within their collection.
pub trait Cacheable: CacheValue {
  /// Identifier within the collection (e.g. "42"). Collections are sorted by it.
  fn id(&self) -> String;

  /// Entity type name; names the durable stores (e.g. "note", "note_fetchAll")
  fn entity_type() -> &'static str;
}
