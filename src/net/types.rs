//! Request and response types shared by the fetch client and the cache.

use reqwest::Method;
use url::Url;

/// How the request was initiated by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  /// Subresource load or programmatic fetch
  #[default]
  Subresource,
}

/// A normalized description of one outgoing request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  /// Value of the Accept header, if the caller declared one
  pub accept: Option<String>,
}

impl RequestDescriptor {
  /// A plain subresource GET for the given URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Subresource,
      accept: None,
    }
  }

  /// A top-level navigation GET.
  pub fn navigation(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Navigate,
      accept: Some("text/html".to_string()),
    }
  }

  /// Set the Accept header value.
  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  /// True for navigations and for requests that declare they accept HTML.
  pub fn wants_html(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self
        .accept
        .as_deref()
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// True when the request targets the given origin.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

/// An immutable copy of a network response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  pub status: u16,
  /// Final URL after redirects
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Snapshot {
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  /// True when the response was ultimately served from the given origin.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }

  /// Whether the opportunistic strategies may cache this response.
  /// Non-200 and cross-origin responses are returned but never stored.
  pub fn is_cacheable(&self, origin: &Url) -> bool {
    self.is_ok() && self.is_same_origin(origin)
  }

  /// Look up a response header, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(header, _)| header.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }
}
