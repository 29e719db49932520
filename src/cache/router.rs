//! Strategy router that decides, per request, how cache partitions and the
//! network combine to produce a response.

use std::future::Future;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use futures::future;
use reqwest::Method;
use tracing::{info, warn};
use url::Url;

use super::partition::PartitionStore;
use super::types::{RequestKey, Served};
use crate::net::{RequestDescriptor, Snapshot};

/// Name of the unversioned partition holding opportunistically cached
/// responses. Survives activation across static versions.
pub const RUNTIME_PARTITION: &str = "runtime-v1";

/// Which strategy a request classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network first; fall back to cache, then to the root document
  NetworkFirstHtml,
  /// Cache first; fetch and opportunistically cache on miss
  CacheFirstStatic,
  /// Network first; fall back to cache only
  NetworkFirstDefault,
}

/// Routes requests between cache partitions and the network.
///
/// Owns two partitions: a static one named by the deployed version tag,
/// populated at install time from the asset manifest, and the runtime one
/// that collects responses as they are fetched.
pub struct CacheRouter<S: PartitionStore> {
  store: Arc<S>,
  origin: Url,
  static_partition: String,
  manifest: Vec<String>,
}

impl<S: PartitionStore> CacheRouter<S> {
  pub fn new(store: S, origin: Url, version: &str, manifest: Vec<String>) -> Self {
    Self {
      store: Arc::new(store),
      origin,
      static_partition: version.to_string(),
      manifest,
    }
  }

  /// Fetch every manifest asset and commit the snapshots to the static
  /// partition in one batch. Any failed or non-200 fetch aborts the whole
  /// install and nothing is committed.
  pub async fn install<F, Fut>(&self, fetch: F) -> Result<()>
  where
    F: Fn(RequestDescriptor) -> Fut,
    Fut: Future<Output = Result<Snapshot>>,
  {
    self.store.open_partition(&self.static_partition)?;
    info!(
      partition = %self.static_partition,
      assets = self.manifest.len(),
      "caching static assets"
    );

    let descriptors = self
      .manifest
      .iter()
      .map(|asset| self.asset_url(asset).map(RequestDescriptor::get))
      .collect::<Result<Vec<_>>>()?;

    let snapshots = future::try_join_all(descriptors.iter().cloned().map(&fetch)).await?;

    let mut entries = Vec::with_capacity(descriptors.len());
    for (descriptor, snapshot) in descriptors.iter().zip(snapshots) {
      if !snapshot.is_ok() {
        return Err(eyre!(
          "Install fetch for {} returned status {}",
          descriptor.url,
          snapshot.status
        ));
      }
      entries.push((RequestKey::from(descriptor), snapshot));
    }

    self.store.put_all(&self.static_partition, &entries)?;

    Ok(())
  }

  /// Delete every partition left over from previous versions and make sure
  /// the runtime partition exists. Traffic is handled immediately after.
  pub fn activate(&self) -> Result<()> {
    for name in self.store.partition_names()? {
      if name != self.static_partition && name != RUNTIME_PARTITION {
        info!(partition = %name, "removing stale partition");
        self.store.delete_partition(&name)?;
      }
    }
    self.store.open_partition(RUNTIME_PARTITION)?;

    Ok(())
  }

  /// Classify a request. `None` means the router declines to intervene and
  /// the host's default handling applies.
  ///
  /// HTML wins over a manifest match, so a navigation to a manifest URL
  /// still goes network-first.
  pub fn classify(&self, descriptor: &RequestDescriptor) -> Option<Strategy> {
    if descriptor.method != Method::GET {
      return None;
    }
    if !descriptor.is_same_origin(&self.origin) {
      return None;
    }

    if descriptor.wants_html() {
      return Some(Strategy::NetworkFirstHtml);
    }
    if self.matches_manifest(descriptor.url.as_str()) {
      return Some(Strategy::CacheFirstStatic);
    }

    Some(Strategy::NetworkFirstDefault)
  }

  /// Route one request through its strategy, or decline with `None`.
  pub async fn handle<F, Fut>(
    &self,
    descriptor: &RequestDescriptor,
    fetch: F,
  ) -> Option<Result<Served>>
  where
    F: FnOnce(RequestDescriptor) -> Fut,
    Fut: Future<Output = Result<Snapshot>>,
  {
    let result = match self.classify(descriptor)? {
      Strategy::NetworkFirstHtml => self.network_first_html(descriptor, fetch).await,
      Strategy::CacheFirstStatic => self.cache_first_static(descriptor, fetch).await,
      Strategy::NetworkFirstDefault => self.network_first_default(descriptor, fetch).await,
    };

    Some(result)
  }

  /// Names of every existing partition.
  pub fn partitions(&self) -> Result<Vec<String>> {
    self.store.partition_names()
  }

  /// Drop a key from every partition.
  pub fn evict(&self, key: &RequestKey) -> Result<()> {
    for name in self.store.partition_names()? {
      self.store.delete(&name, key)?;
    }
    Ok(())
  }

  /// Network-first for HTML: live response wins and lands in the runtime
  /// partition; offline falls back to the cached copy, then to the root
  /// document.
  async fn network_first_html<F, Fut>(&self, descriptor: &RequestDescriptor, fetch: F) -> Result<Served>
  where
    F: FnOnce(RequestDescriptor) -> Fut,
    Fut: Future<Output = Result<Snapshot>>,
  {
    let key = RequestKey::from(descriptor);

    match fetch(descriptor.clone()).await {
      Ok(snapshot) => {
        self.store_best_effort(RUNTIME_PARTITION, &key, &snapshot);
        Ok(Served::from_network(snapshot))
      }
      Err(err) => {
        if let Some(hit) = self.store.get_any(&key)? {
          return Ok(Served::from_cache(hit.snapshot, hit.cached_at));
        }
        if let Some(root) = self.store.get_any(&self.root_key()?)? {
          return Ok(Served::root_fallback(root.snapshot, root.cached_at));
        }
        Err(err)
      }
    }
  }

  /// Cache-first for manifest assets: a stored snapshot short-circuits the
  /// network entirely; a miss fetches and caches cacheable responses into
  /// the static partition.
  async fn cache_first_static<F, Fut>(&self, descriptor: &RequestDescriptor, fetch: F) -> Result<Served>
  where
    F: FnOnce(RequestDescriptor) -> Fut,
    Fut: Future<Output = Result<Snapshot>>,
  {
    let key = RequestKey::from(descriptor);

    if let Some(hit) = self.store.get_any(&key)? {
      return Ok(Served::from_cache(hit.snapshot, hit.cached_at));
    }

    let snapshot = fetch(descriptor.clone()).await?;
    if snapshot.is_cacheable(&self.origin) {
      self.store_best_effort(&self.static_partition, &key, &snapshot);
    }

    Ok(Served::from_network(snapshot))
  }

  /// Network-first for everything else: like the HTML strategy but without
  /// the root-document fallback, and only cacheable responses are stored.
  async fn network_first_default<F, Fut>(
    &self,
    descriptor: &RequestDescriptor,
    fetch: F,
  ) -> Result<Served>
  where
    F: FnOnce(RequestDescriptor) -> Fut,
    Fut: Future<Output = Result<Snapshot>>,
  {
    let key = RequestKey::from(descriptor);

    match fetch(descriptor.clone()).await {
      Ok(snapshot) => {
        if snapshot.is_cacheable(&self.origin) {
          self.store_best_effort(RUNTIME_PARTITION, &key, &snapshot);
        }
        Ok(Served::from_network(snapshot))
      }
      Err(err) => {
        if let Some(hit) = self.store.get_any(&key)? {
          return Ok(Served::from_cache(hit.snapshot, hit.cached_at));
        }
        Err(err)
      }
    }
  }

  /// Caching a live response must never fail the response itself.
  fn store_best_effort(&self, partition: &str, key: &RequestKey, snapshot: &Snapshot) {
    if let Err(err) = self.store.put(partition, key, snapshot) {
      warn!(url = key.url(), partition, "failed to cache response: {}", err);
    }
  }

  fn matches_manifest(&self, url: &str) -> bool {
    self.manifest.iter().any(|asset| url.contains(asset.as_str()))
  }

  fn asset_url(&self, asset: &str) -> Result<Url> {
    self
      .origin
      .join(asset)
      .map_err(|e| eyre!("Invalid manifest entry {}: {}", asset, e))
  }

  fn root_key(&self) -> Result<RequestKey> {
    let root = self.asset_url("/")?;
    Ok(RequestKey::new(Method::GET, root.as_str()))
  }
}

impl<S: PartitionStore> Clone for CacheRouter<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      origin: self.origin.clone(),
      static_partition: self.static_partition.clone(),
      manifest: self.manifest.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::partition::SqlitePartitions;
  use crate::cache::types::ServedSource;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn origin() -> Url {
    Url::parse("https://game.example.net").unwrap()
  }

  fn router(manifest: &[&str]) -> CacheRouter<SqlitePartitions> {
    CacheRouter::new(
      SqlitePartitions::open_in_memory().unwrap(),
      origin(),
      "v1.0.0",
      manifest.iter().map(|s| s.to_string()).collect(),
    )
  }

  fn descriptor(path: &str) -> RequestDescriptor {
    RequestDescriptor::get(origin().join(path).unwrap())
  }

  fn snapshot_for(descriptor: &RequestDescriptor, body: &[u8]) -> Snapshot {
    Snapshot {
      status: 200,
      url: descriptor.url.clone(),
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: body.to_vec(),
    }
  }

  /// Fetcher that serves 200s and counts how often it is called.
  fn counting_fetch(
    body: &'static [u8],
  ) -> (
    Arc<AtomicU32>,
    impl Fn(RequestDescriptor) -> future::Ready<Result<Snapshot>> + Clone,
  ) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let fetch = move |descriptor: RequestDescriptor| {
      counter.fetch_add(1, Ordering::SeqCst);
      future::ready(Ok(snapshot_for(&descriptor, body)))
    };
    (calls, fetch)
  }

  fn failing_fetch(_descriptor: RequestDescriptor) -> future::Ready<Result<Snapshot>> {
    future::ready(Err(eyre!("connection refused")))
  }

  #[test]
  fn test_non_get_passes_through() {
    let router = router(&["/style/main.css"]);
    let mut descriptor = descriptor("/style/main.css");
    descriptor.method = Method::POST;

    assert_eq!(router.classify(&descriptor), None);
  }

  #[test]
  fn test_cross_origin_passes_through() {
    let router = router(&["/style/main.css"]);
    let descriptor = RequestDescriptor::get(Url::parse("https://cdn.example.com/lib.js").unwrap());

    assert_eq!(router.classify(&descriptor), None);
  }

  #[test]
  fn test_html_wins_over_manifest_match() {
    let router = router(&["/", "/style/main.css"]);

    let navigation = RequestDescriptor::navigation(origin().join("/").unwrap());
    assert_eq!(router.classify(&navigation), Some(Strategy::NetworkFirstHtml));

    let accepts_html = descriptor("/style/main.css").with_accept("text/html");
    assert_eq!(
      router.classify(&accepts_html),
      Some(Strategy::NetworkFirstHtml)
    );
  }

  #[test]
  fn test_manifest_substring_match() {
    let router = router(&["/style/main.css"]);

    assert_eq!(
      router.classify(&descriptor("/style/main.css")),
      Some(Strategy::CacheFirstStatic)
    );
    assert_eq!(
      router.classify(&descriptor("/api/scores.json")),
      Some(Strategy::NetworkFirstDefault)
    );
  }

  #[tokio::test]
  async fn test_install_populates_static_partition() {
    let router = router(&["/", "/style/main.css"]);
    let (calls, fetch) = counting_fetch(b"asset");

    router.install(fetch).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Both manifest URLs must now be served without touching the network
    for path in ["/", "/style/main.css"] {
      let served = router
        .handle(&descriptor(path), failing_fetch)
        .await
        .unwrap()
        .unwrap();
      assert_eq!(served.source, ServedSource::Cache);
      assert_eq!(served.snapshot.body, b"asset");
    }
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let router = router(&["/", "/style/main.css"]);
    let fetch = |descriptor: RequestDescriptor| {
      future::ready(if descriptor.url.path() == "/" {
        Ok(snapshot_for(&descriptor, b"<html>"))
      } else {
        Err(eyre!("connection reset"))
      })
    };

    assert!(router.install(fetch).await.is_err());

    // Nothing committed, not even the URL that fetched fine
    let served = router.handle(&descriptor("/"), failing_fetch).await.unwrap();
    assert!(served.is_err());
  }

  #[tokio::test]
  async fn test_install_rejects_non_200_asset() {
    let router = router(&["/favicon.ico"]);
    let fetch = |descriptor: RequestDescriptor| {
      let mut snapshot = snapshot_for(&descriptor, b"");
      snapshot.status = 404;
      future::ready(Ok(snapshot))
    };

    assert!(router.install(fetch).await.is_err());
  }

  #[test]
  fn test_activate_prunes_stale_partitions() {
    let store = SqlitePartitions::open_in_memory().unwrap();
    store.open_partition("v0.9.0").unwrap();
    store.open_partition("v1.0.0").unwrap();

    let router = CacheRouter::new(store, origin(), "v1.0.0", vec![]);
    router.activate().unwrap();

    assert_eq!(router.partitions().unwrap(), vec!["v1.0.0", "runtime-v1"]);
  }

  #[tokio::test]
  async fn test_cache_first_skips_network_when_warm() {
    let router = router(&["/style/main.css"]);
    let (calls, fetch) = counting_fetch(b".tile {}");
    let descriptor = descriptor("/style/main.css");

    let first = router
      .handle(&descriptor, fetch.clone())
      .await
      .unwrap()
      .unwrap();
    let second = router.handle(&descriptor, fetch).await.unwrap().unwrap();

    // One fetch total, byte-identical bodies
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.source, ServedSource::Network);
    assert_eq!(second.source, ServedSource::Cache);
    assert_eq!(first.snapshot.body, second.snapshot.body);
  }

  #[tokio::test]
  async fn test_cache_first_never_caches_non_200() {
    let router = router(&["/style/missing.css"]);
    let descriptor = descriptor("/style/missing.css");
    let fetch = |descriptor: RequestDescriptor| {
      let mut snapshot = snapshot_for(&descriptor, b"not found");
      snapshot.status = 404;
      future::ready(Ok(snapshot))
    };

    let served = router.handle(&descriptor, fetch).await.unwrap().unwrap();
    assert_eq!(served.snapshot.status, 404);

    // The 404 was returned but not stored, so offline now fails
    let offline = router.handle(&descriptor, failing_fetch).await.unwrap();
    assert!(offline.is_err());
  }

  #[tokio::test]
  async fn test_html_success_lands_in_runtime_partition() {
    let router = router(&[]);
    let navigation = RequestDescriptor::navigation(origin().join("/leaderboard").unwrap());
    let (_, fetch) = counting_fetch(b"<html>scores</html>");

    let served = router.handle(&navigation, fetch).await.unwrap().unwrap();
    assert_eq!(served.source, ServedSource::Network);

    // Offline replay is served from the runtime snapshot just written
    let offline = router
      .handle(&navigation, failing_fetch)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(offline.source, ServedSource::Cache);
    assert_eq!(offline.snapshot.body, b"<html>scores</html>");
  }

  #[tokio::test]
  async fn test_offline_navigation_falls_back_to_root_document() {
    let router = router(&[]);

    // Warm only the root document
    let root = RequestDescriptor::navigation(origin().join("/").unwrap());
    let (_, fetch) = counting_fetch(b"<html>game</html>");
    router.handle(&root, fetch).await.unwrap().unwrap();

    // A different, never-cached navigation while offline
    let navigation = RequestDescriptor::navigation(origin().join("/replay/42").unwrap());
    let served = router
      .handle(&navigation, failing_fetch)
      .await
      .unwrap()
      .unwrap();

    assert_eq!(served.source, ServedSource::RootFallback);
    assert_eq!(served.snapshot.body, b"<html>game</html>");
  }

  #[tokio::test]
  async fn test_offline_default_without_cache_fails() {
    let router = router(&["/style/main.css"]);
    let descriptor = descriptor("/api/scores.json").with_accept("application/json");

    let served = router.handle(&descriptor, failing_fetch).await.unwrap();
    assert!(served.is_err());
  }

  #[tokio::test]
  async fn test_default_strategy_falls_back_to_cached_copy() {
    let router = router(&[]);
    let descriptor = descriptor("/api/scores.json");
    let (_, fetch) = counting_fetch(b"[1024, 2048]");

    router.handle(&descriptor, fetch).await.unwrap().unwrap();

    let offline = router
      .handle(&descriptor, failing_fetch)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(offline.source, ServedSource::Cache);
    assert_eq!(offline.snapshot.body, b"[1024, 2048]");
  }

  #[tokio::test]
  async fn test_evict_drops_key_from_every_partition() {
    let router = router(&["/style/main.css"]);
    let descriptor = descriptor("/style/main.css");
    let (_, fetch) = counting_fetch(b".tile {}");

    router.handle(&descriptor, fetch).await.unwrap().unwrap();
    router.evict(&RequestKey::from(&descriptor)).unwrap();

    let offline = router.handle(&descriptor, failing_fetch).await.unwrap();
    assert!(offline.is_err());
  }
}
