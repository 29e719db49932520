//! Service loop that consumes host events and drives the cache router.

use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{CacheRouter, PartitionStore};
use crate::event::{HostEvent, ServiceHandle};
use crate::net::HttpClient;

/// Background service owning the router and the fetch client.
///
/// Every host event runs on its own task, so in-flight requests proceed
/// concurrently while each one's own fetch/store/respond steps stay ordered.
pub struct Service<S: PartitionStore + 'static> {
  router: CacheRouter<S>,
  client: HttpClient,
}

impl<S: PartitionStore + 'static> Service<S> {
  pub fn new(router: CacheRouter<S>, client: HttpClient) -> Self {
    Self { router, client }
  }

  /// Spawn the event loop and return the handle the host delivers events
  /// through. The loop ends when every handle is dropped.
  pub fn spawn(self) -> ServiceHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let router = self.router.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
          Self::dispatch(router, client, event).await;
        });
      }
    });

    ServiceHandle::new(tx)
  }

  async fn dispatch(router: CacheRouter<S>, client: HttpClient, event: HostEvent) {
    match event {
      HostEvent::Install { done } => {
        let fetch = move |descriptor| {
          let client = client.clone();
          async move { client.fetch(&descriptor).await }
        };
        // The host may have stopped waiting; the outcome is then dropped
        let _ = done.send(router.install(fetch).await);
      }
      HostEvent::Activate { done } => {
        let _ = done.send(router.activate());
      }
      HostEvent::Request {
        descriptor,
        respond,
      } => {
        debug!(url = %descriptor.url, "handling request");
        let outcome = router
          .handle(&descriptor, |descriptor| async move {
            client.fetch(&descriptor).await
          })
          .await;
        let _ = respond.send(outcome);
      }
    }
  }
}
