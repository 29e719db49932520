//! Key and result types for the caching system.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};

use crate::net::{RequestDescriptor, Snapshot};

/// Identifies one cached entry: method plus URL, verbatim.
///
/// Query strings and trailing slashes are part of the key, so two URLs that
/// differ only in query order are distinct entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  method: Method,
  url: String,
}

impl RequestKey {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
    }
  }

  pub fn method(&self) -> &str {
    self.method.as_str()
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 over method and URL, for stable fixed-length storage keys.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&RequestDescriptor> for RequestKey {
  fn from(descriptor: &RequestDescriptor) -> Self {
    Self {
      method: descriptor.method.clone(),
      url: descriptor.url.as_str().to_string(),
    }
  }
}

/// Result of routing one request, including where the bytes came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response handed back to the caller
  pub snapshot: Snapshot,
  /// Where the response came from
  pub source: ServedSource,
  /// When the snapshot was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// A live response straight off the network.
  pub fn from_network(snapshot: Snapshot) -> Self {
    Self {
      snapshot,
      source: ServedSource::Network,
      cached_at: None,
    }
  }

  /// A snapshot looked up by the request's own key.
  pub fn from_cache(snapshot: Snapshot, cached_at: DateTime<Utc>) -> Self {
    Self {
      snapshot,
      source: ServedSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// The root document snapshot, substituted for an uncached navigation.
  pub fn root_fallback(snapshot: Snapshot, cached_at: DateTime<Utc>) -> Self {
    Self {
      snapshot,
      source: ServedSource::RootFallback,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedSource {
  /// Fresh response from the network
  Network,
  /// Snapshot found under the request's key
  Cache,
  /// Root document snapshot served in place of an uncached navigation
  RootFallback,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_storage_hash_distinguishes_query_strings() {
    let plain = RequestKey::new(Method::GET, "https://game.example.net/data");
    let with_query = RequestKey::new(Method::GET, "https://game.example.net/data?v=2");

    assert_ne!(plain.storage_hash(), with_query.storage_hash());
  }

  #[test]
  fn test_storage_hash_distinguishes_methods() {
    let get = RequestKey::new(Method::GET, "https://game.example.net/data");
    let head = RequestKey::new(Method::HEAD, "https://game.example.net/data");

    assert_ne!(get.storage_hash(), head.storage_hash());
  }

  #[test]
  fn test_storage_hash_is_stable() {
    let a = RequestKey::new(Method::GET, "https://game.example.net/");
    let b = RequestKey::new(Method::GET, "https://game.example.net/");

    assert_eq!(a.storage_hash(), b.storage_hash());
    assert_eq!(a.storage_hash().len(), 64);
  }
}
