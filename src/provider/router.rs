//! Declarative routing of resource references to handlers.
//!
//! Templates are paths whose segments are literals or `<name>` placeholders. For an
//! incoming reference the template with the fewest placeholder substitutions wins;
//! ties go to the template declared first.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use color_eyre::eyre::eyre;

use super::Provider;
use crate::cache::CacheValue;
use crate::error::{ResolverError, Result};
use crate::promise::{Executor, ObservablePromise};
use crate::resource::ResourceRef;

/// The provider operations a route can be declared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  Fetch,
  FetchAll,
  Insert,
  InsertAll,
  Update,
  Delete,
}

impl Operation {
  pub fn is_read(self) -> bool {
    matches!(self, Self::Fetch | Self::FetchAll)
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Fetch => "fetch",
      Self::FetchAll => "fetchAll",
      Self::Insert => "insert",
      Self::InsertAll => "insertAll",
      Self::Update => "update",
      Self::Delete => "delete",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  Placeholder(String),
}

/// A parsed route template such as `/users/<id>/posts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
  source: String,
  segments: Vec<Segment>,
}

/// Result of matching a template against a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
  /// Placeholder segments that had to be substituted; lower is more specific
  pub substitutions: usize,
  pub params: HashMap<String, String>,
}

impl RouteTemplate {
  pub fn parse(template: &str) -> Self {
    let segments = template
      .split('/')
      .filter(|s| !s.is_empty())
      .map(|s| match s.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        Some(name) if !name.is_empty() => Segment::Placeholder(name.to_string()),
        _ => Segment::Literal(s.to_string()),
      })
      .collect();

    Self {
      source: template.to_string(),
      segments,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }

  /// Match the path of `resource`; `None` when the segment counts or a literal differ.
  pub fn matches(&self, resource: &ResourceRef) -> Option<RouteMatch> {
    let path = resource.segments();
    if path.len() != self.segments.len() {
      return None;
    }

    let mut params = HashMap::new();
    let mut substitutions = 0;
    for (segment, actual) in self.segments.iter().zip(path) {
      match segment {
        Segment::Literal(expected) if expected != actual => return None,
        Segment::Literal(_) => {}
        Segment::Placeholder(name) => {
          // A repeated name counts every time; the last value wins in `params`
          substitutions += 1;
          params.insert(name.clone(), actual.clone());
        }
      }
    }

    Some(RouteMatch {
      substitutions,
      params,
    })
  }
}

impl fmt::Display for RouteTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

/// Index and match of the most specific template for `resource`.
///
/// Templates are considered in iteration order, so the first one wins a tie.
pub fn best_match<'a, I>(templates: I, resource: &ResourceRef) -> Option<(usize, RouteMatch)>
where
  I: IntoIterator<Item = &'a RouteTemplate>,
{
  templates
    .into_iter()
    .enumerate()
    .filter_map(|(index, template)| template.matches(resource).map(|m| (index, m)))
    .min_by_key(|(_, m)| m.substitutions)
}

/// What a handler gets to see of the request.
#[derive(Debug, Clone)]
pub struct RouteContext {
  resource: ResourceRef,
  params: HashMap<String, String>,
}

impl RouteContext {
  pub fn resource(&self) -> &ResourceRef {
    &self.resource
  }

  /// A captured placeholder. Missing names are handler bugs and fail the work.
  pub fn param(&self, name: &str) -> color_eyre::Result<&str> {
    self
      .params
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| eyre!("route for {} has no `{}` placeholder", self.resource, name))
  }

  pub fn query(&self, name: &str) -> Option<&str> {
    self.resource.query(name)
  }
}

type ReadFn<T> = Arc<dyn Fn(&RouteContext) -> color_eyre::Result<T> + Send + Sync>;
type WriteFn<T> = Arc<dyn Fn(&RouteContext, T) -> color_eyre::Result<T> + Send + Sync>;

struct Route<H> {
  template: RouteTemplate,
  handler: H,
}

/// Handlers declared per operation, built with the chained declaration methods.
pub struct RouteTable<T> {
  fetch: Vec<Route<ReadFn<T>>>,
  fetch_all: Vec<Route<ReadFn<Vec<T>>>>,
  insert: Vec<Route<WriteFn<T>>>,
  insert_all: Vec<Route<WriteFn<Vec<T>>>>,
  update: Vec<Route<WriteFn<T>>>,
  delete: Vec<Route<ReadFn<T>>>,
}

impl<T> Default for RouteTable<T> {
  fn default() -> Self {
    Self {
      fetch: Vec::new(),
      fetch_all: Vec::new(),
      insert: Vec::new(),
      insert_all: Vec::new(),
      update: Vec::new(),
      delete: Vec::new(),
    }
  }
}

fn route<H>(template: &str, handler: H) -> Route<H> {
  Route {
    template: RouteTemplate::parse(template),
    handler,
  }
}

impl<T: CacheValue> RouteTable<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fetch<F>(mut self, template: &str, handler: F) -> Self
  where
    F: Fn(&RouteContext) -> color_eyre::Result<T> + Send + Sync + 'static,
  {
    self.fetch.push(route(template, Arc::new(handler)));
    self
  }

  pub fn fetch_all<F>(mut self, template: &str, handler: F) -> Self
  where
    F: Fn(&RouteContext) -> color_eyre::Result<Vec<T>> + Send + Sync + 'static,
  {
    self.fetch_all.push(route(template, Arc::new(handler)));
    self
  }

  pub fn insert<F>(mut self, template: &str, handler: F) -> Self
  where
    F: Fn(&RouteContext, T) -> color_eyre::Result<T> + Send + Sync + 'static,
  {
    self.insert.push(route(template, Arc::new(handler)));
    self
  }

  pub fn insert_all<F>(mut self, template: &str, handler: F) -> Self
  where
    F: Fn(&RouteContext, Vec<T>) -> color_eyre::Result<Vec<T>> + Send + Sync + 'static,
  {
    self.insert_all.push(route(template, Arc::new(handler)));
    self
  }

  pub fn update<F>(mut self, template: &str, handler: F) -> Self
  where
    F: Fn(&RouteContext, T) -> color_eyre::Result<T> + Send + Sync + 'static,
  {
    self.update.push(route(template, Arc::new(handler)));
    self
  }

  pub fn delete<F>(mut self, template: &str, handler: F) -> Self
  where
    F: Fn(&RouteContext) -> color_eyre::Result<T> + Send + Sync + 'static,
  {
    self.delete.push(route(template, Arc::new(handler)));
    self
  }
}

/// Pick the handler for `resource` among `routes` declared for `operation`.
fn select<H: Clone>(
  operation: Operation,
  routes: &[Route<H>],
  resource: &ResourceRef,
) -> Result<(H, RouteContext)> {
  let Some((index, matched)) = best_match(routes.iter().map(|r| &r.template), resource) else {
    if operation.is_read() {
      tracing::debug!(%operation, %resource, "no route matched");
      return Err(ResolverError::NotFound {
        operation,
        resource: resource.to_string(),
      });
    }

    tracing::error!(%operation, %resource, "no route declared for write");
    return Err(ResolverError::RouteNotMatched {
      operation,
      resource: resource.to_string(),
    });
  };

  let route = &routes[index];
  tracing::trace!(%operation, %resource, template = %route.template, "route selected");

  Ok((
    route.handler.clone(),
    RouteContext {
      resource: resource.clone(),
      params: matched.params,
    },
  ))
}

/// A provider whose operations are the handlers of a [`RouteTable`], run on the pool.
pub struct RoutedProvider<T> {
  executor: Executor,
  routes: RouteTable<T>,
}

impl<T: CacheValue> RoutedProvider<T> {
  pub fn new(executor: Executor, routes: RouteTable<T>) -> Self {
    Self { executor, routes }
  }
}

impl<T: CacheValue> Provider<T> for RoutedProvider<T> {
  fn fetch(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    let (handler, context) = select(Operation::Fetch, &self.routes.fetch, resource)?;
    Ok(self.executor.observe(resource.clone(), move || handler(&context)))
  }

  fn fetch_all(&self, resource: &ResourceRef) -> Result<ObservablePromise<Vec<T>>> {
    let (handler, context) = select(Operation::FetchAll, &self.routes.fetch_all, resource)?;
    Ok(self.executor.observe(resource.clone(), move || handler(&context)))
  }

  fn insert(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>> {
    let (handler, context) = select(Operation::Insert, &self.routes.insert, resource)?;
    Ok(self.executor.observe(resource.clone(), move || handler(&context, object)))
  }

  fn insert_many(
    &self,
    resource: &ResourceRef,
    objects: Vec<T>,
  ) -> Result<ObservablePromise<Vec<T>>> {
    let (handler, context) = select(Operation::InsertAll, &self.routes.insert_all, resource)?;
    Ok(self.executor.observe(resource.clone(), move || handler(&context, objects)))
  }

  fn update(&self, resource: &ResourceRef, object: T) -> Result<ObservablePromise<T>> {
    let (handler, context) = select(Operation::Update, &self.routes.update, resource)?;
    Ok(self.executor.observe(resource.clone(), move || handler(&context, object)))
  }

  fn delete(&self, resource: &ResourceRef) -> Result<ObservablePromise<T>> {
    let (handler, context) = select(Operation::Delete, &self.routes.delete, resource)?;
    Ok(self.executor.observe(resource.clone(), move || handler(&context)))
  }
}
