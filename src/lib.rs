//! Cached, observable access to REST-like resources addressed by URI.
//!
//! Providers serve the resources of one authority. A [`provider::CachingProvider`]
//! answers reads from a two-tier cache and applies writes optimistically, the
//! [`resolver::Resolver`] dispatches by authority and keeps auto-updating reads live.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod notify;
pub mod promise;
pub mod provider;
pub mod resolver;
pub mod resource;

#[cfg(test)]
mod testing;

pub use error::{ResolverError, Result};
pub use resource::ResourceRef;
