//! Two-tier caching for provider results.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Keeps recently used values in a bounded in-memory LRU
//! - Persists values to one SQLite store per entity type, within a byte budget
//! - Stamps durable entries with a schema version and ignores older ones

mod layer;
mod storage;
mod traits;

pub use layer::Cache;
pub use storage::{DurableStore, StoreStats};
pub use traits::{CacheValue, Cacheable};
