//! Resource references: `scheme://authority/path/segments?query=params`.

use std::fmt;

use url::{form_urlencoded, Url};

use crate::error::{ResolverError, Result};

/// Page size hint. Never part of a cache key.
pub const PAGE_SIZE: &str = "pageSize";
/// `noCache=yes` bypasses every cache tier for one call.
pub const NO_CACHE: &str = "noCache";
/// Pagination cursor; present on continuation pages only.
pub const BEGIN_MARKER: &str = "beginMarker";
pub const YES: &str = "yes";

/// A parsed, immutable resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
  scheme: String,
  authority: String,
  segments: Vec<String>,
  query: Vec<(String, String)>,
}

impl ResourceRef {
  /// Parse the textual form. The authority is mandatory.
  pub fn parse(input: &str) -> Result<Self> {
    let invalid = |reason: &str| ResolverError::InvalidRef {
      input: input.to_string(),
      reason: reason.to_string(),
    };

    let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;
    let authority = url
      .host_str()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| invalid("missing authority"))?;

    let segments = url
      .path_segments()
      .map(|s| s.filter(|s| !s.is_empty()).map(String::from).collect())
      .unwrap_or_default();

    let query = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();

    Ok(Self {
      scheme: url.scheme().to_string(),
      authority: authority.to_string(),
      segments,
      query,
    })
  }

  /// Build a reference from parts; `path` is split on `/`.
  pub fn new(scheme: &str, authority: &str, path: &str) -> Self {
    Self {
      scheme: scheme.to_string(),
      authority: authority.to_string(),
      segments: split_path(path),
      query: Vec::new(),
    }
  }

  pub fn scheme(&self) -> &str {
    &self.scheme
  }

  pub fn authority(&self) -> &str {
    &self.authority
  }

  pub fn segments(&self) -> &[String] {
    &self.segments
  }

  pub fn last_segment(&self) -> Option<&str> {
    self.segments.last().map(String::as_str)
  }

  /// Path with a leading slash, `/` for the root.
  pub fn path(&self) -> String {
    format!("/{}", self.segments.join("/"))
  }

  pub fn query_pairs(&self) -> &[(String, String)] {
    &self.query
  }

  /// First value of a query parameter.
  pub fn query(&self, name: &str) -> Option<&str> {
    self
      .query
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }

  /// Replace every occurrence of `name` with a single `name=value`, appended last.
  pub fn with_query(&self, name: &str, value: &str) -> Self {
    let mut next = self.without_query(name);
    next.query.push((name.to_string(), value.to_string()));
    next
  }

  pub fn without_query(&self, name: &str) -> Self {
    let mut next = self.clone();
    next.query.retain(|(k, _)| k != name);
    next
  }

  /// Same scheme, authority and path; no query.
  pub fn without_params(&self) -> Self {
    Self {
      query: Vec::new(),
      ..self.clone()
    }
  }

  /// The reference one segment below this one. Query parameters are dropped.
  pub fn child(&self, segment: &str) -> Self {
    let mut segments = self.segments.clone();
    segments.extend(split_path(segment));
    Self {
      scheme: self.scheme.clone(),
      authority: self.authority.clone(),
      segments,
      query: Vec::new(),
    }
  }

  /// The enclosing collection: last segment and query removed.
  pub fn parent(&self) -> Self {
    let mut segments = self.segments.clone();
    segments.pop();
    Self {
      scheme: self.scheme.clone(),
      authority: self.authority.clone(),
      segments,
      query: Vec::new(),
    }
  }

  /// Same authority and path, regardless of scheme and query.
  pub fn same_path(&self, other: &ResourceRef) -> bool {
    self.authority == other.authority && self.segments == other.segments
  }

  /// True when `self` lies strictly below `ancestor`.
  pub fn is_descendant_of(&self, ancestor: &ResourceRef) -> bool {
    self.authority == ancestor.authority
      && self.segments.len() > ancestor.segments.len()
      && self.segments.starts_with(&ancestor.segments)
  }

  pub fn no_cache(&self) -> bool {
    self.query(NO_CACHE) == Some(YES)
  }

  /// A request without a pagination cursor.
  pub fn is_first_page(&self) -> bool {
    self.query(BEGIN_MARKER).is_none()
  }
}

impl fmt::Display for ResourceRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}{}", self.scheme, self.authority, self.path())?;
    if !self.query.is_empty() {
      let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(self.query.iter())
        .finish();
      write!(f, "?{}", query)?;
    }
    Ok(())
  }
}

impl std::str::FromStr for ResourceRef {
  type Err = ResolverError;

  fn from_str(s: &str) -> Result<Self> {
    Self::parse(s)
  }
}

fn split_path(path: &str) -> Vec<String> {
  path
    .split('/')
    .filter(|s| !s.is_empty())
    .map(String::from)
    .collect()
}

/// Cache-key normalization.
///
/// `pageSize` and `noCache` never reach a key. `beginMarker` is kept for request keys
/// and dropped for collection keys, so every page of a listing accumulates under one
/// entry. Extra names (e.g. volatile filter parameters) can be configured.
#[derive(Debug, Clone, Default)]
pub struct KeyPolicy {
  ignored: Vec<String>,
}

impl KeyPolicy {
  pub fn new(ignored: impl IntoIterator<Item = String>) -> Self {
    Self {
      ignored: ignored.into_iter().collect(),
    }
  }

  /// Key for the request as issued (cursor included).
  pub fn request_key(&self, resource: &ResourceRef) -> String {
    self.key(resource, false)
  }

  /// Key shared by every page of a listing.
  pub fn collection_key(&self, resource: &ResourceRef) -> String {
    self.key(resource, true)
  }

  /// Key of one object inside a listing: collection path plus id, no query.
  pub fn member_key(&self, collection: &ResourceRef, id: &str) -> String {
    collection.child(id).to_string()
  }

  fn key(&self, resource: &ResourceRef, skip_marker: bool) -> String {
    let mut normalized = resource.without_params();
    normalized.query = resource
      .query
      .iter()
      .filter(|(k, _)| {
        k != PAGE_SIZE
          && k != NO_CACHE
          && !(skip_marker && k == BEGIN_MARKER)
          && !self.ignored.iter().any(|i| i == k)
      })
      .cloned()
      .collect();
    normalized.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn r(s: &str) -> ResourceRef {
    ResourceRef::parse(s).unwrap()
  }

  #[test]
  fn test_parse_components() {
    let res = r("app://notes/items/5?pageSize=20&tag=a%20b");
    assert_eq!(res.scheme(), "app");
    assert_eq!(res.authority(), "notes");
    assert_eq!(res.segments(), &["items".to_string(), "5".to_string()]);
    assert_eq!(res.path(), "/items/5");
    assert_eq!(res.query(PAGE_SIZE), Some("20"));
    assert_eq!(res.query("tag"), Some("a b"));
  }

  #[test]
  fn test_parse_requires_authority() {
    assert!(matches!(
      ResourceRef::parse("not a uri"),
      Err(ResolverError::InvalidRef { .. })
    ));
  }

  #[test]
  fn test_display_round_trips_query() {
    let res = r("app://notes/items?owner=me&beginMarker=X");
    assert_eq!(res.to_string(), "app://notes/items?owner=me&beginMarker=X");
    assert_eq!(r("app://notes").to_string(), "app://notes/");
  }

  #[test]
  fn test_parent_and_child() {
    let res = r("app://notes/items/5?x=1");
    assert_eq!(res.parent().to_string(), "app://notes/items");
    assert_eq!(res.parent().child("7").to_string(), "app://notes/items/7");
    assert!(res.is_descendant_of(&r("app://notes/items")));
    assert!(!res.is_descendant_of(&r("app://notes/other")));
    assert!(res.same_path(&r("content://notes/items/5")));
  }

  #[test]
  fn test_key_ignores_paging_and_cache_params() {
    let policy = KeyPolicy::default();
    let a = r("app://notes/items?pageSize=20&owner=me");
    let b = r("app://notes/items?owner=me&noCache=yes");
    assert_eq!(policy.request_key(&a), policy.request_key(&b));
    assert_eq!(policy.request_key(&a), "app://notes/items?owner=me");
  }

  #[test]
  fn test_collection_key_drops_marker() {
    let policy = KeyPolicy::default();
    let page2 = r("app://notes/items?pageSize=20&beginMarker=X");
    assert_eq!(policy.request_key(&page2), "app://notes/items?beginMarker=X");
    assert_eq!(policy.collection_key(&page2), "app://notes/items");
  }

  #[test]
  fn test_configured_params_are_ignored() {
    let policy = KeyPolicy::new(vec!["ts".to_string()]);
    assert_eq!(
      policy.request_key(&r("app://notes/items?ts=123&owner=me")),
      "app://notes/items?owner=me"
    );
  }

  #[test]
  fn test_first_page_and_no_cache_flags() {
    assert!(r("app://notes/items").is_first_page());
    assert!(!r("app://notes/items?beginMarker=X").is_first_page());
    assert!(r("app://notes/items?noCache=yes").no_cache());
    assert!(!r("app://notes/items?noCache=no").no_cache());
  }
}
