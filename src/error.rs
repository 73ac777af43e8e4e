//! Error taxonomy for resolver, provider and cache operations.

use std::fmt;

use thiserror::Error;

use crate::provider::router::Operation;

/// Errors reported by the resolver and its providers.
///
/// Only the variants produced by reads (`ProviderNotFound`, `NotFound`) mean "absent";
/// everything else points at a misconfiguration or a storage problem.
#[derive(Debug, Error)]
pub enum ResolverError {
  #[error("no provider registered for authority `{0}`")]
  ProviderNotFound(String),

  #[error("provider for `{authority}` does not serve `{entity}` resources")]
  ProviderTypeMismatch {
    authority: String,
    entity: &'static str,
  },

  #[error("nothing found for {operation} on {resource}")]
  NotFound {
    operation: Operation,
    resource: String,
  },

  #[error("no {operation} route declared for {resource}")]
  RouteNotMatched {
    operation: Operation,
    resource: String,
  },

  #[error("invalid resource reference `{input}`: {reason}")]
  InvalidRef { input: String, reason: String },

  #[error("cache storage error: {0}")]
  CacheIo(#[from] rusqlite::Error),

  #[error("cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl ResolverError {
  /// Whether this error only means "there is nothing here" for a read.
  pub fn is_absent(&self) -> bool {
    matches!(self, Self::ProviderNotFound(_) | Self::NotFound { .. })
  }
}

pub type Result<T, E = ResolverError> = std::result::Result<T, E>;

/// Failure captured from a unit of work executed on the pool.
///
/// Cloned into every error callback, so the report itself is shared.
#[derive(Clone)]
pub struct WorkFailed(std::sync::Arc<color_eyre::Report>);

impl WorkFailed {
  pub fn new(report: color_eyre::Report) -> Self {
    Self(std::sync::Arc::new(report))
  }

  pub fn report(&self) -> &color_eyre::Report {
    &self.0
  }
}

impl fmt::Display for WorkFailed {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Debug for WorkFailed {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "WorkFailed({:?})", self.0)
  }
}
