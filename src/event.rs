use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};

use crate::cache::Served;
use crate::net::RequestDescriptor;

/// Notifications delivered by the hosting environment.
#[derive(Debug)]
pub enum HostEvent {
  /// Deploy-time precache of the asset manifest
  Install { done: oneshot::Sender<Result<()>> },
  /// Takeover: prune stale partitions and start handling traffic
  Activate { done: oneshot::Sender<Result<()>> },
  /// One outgoing request; `None` on the responder means pass-through
  Request {
    descriptor: RequestDescriptor,
    respond: oneshot::Sender<Option<Result<Served>>>,
  },
}

/// Sending side of the interception boundary. The host (here, the CLI)
/// delivers lifecycle and request notifications through this handle and
/// awaits each outcome.
#[derive(Clone)]
pub struct ServiceHandle {
  tx: mpsc::UnboundedSender<HostEvent>,
}

impl ServiceHandle {
  pub(crate) fn new(tx: mpsc::UnboundedSender<HostEvent>) -> Self {
    Self { tx }
  }

  /// Precache the asset manifest.
  pub async fn install(&self) -> Result<()> {
    let (done, outcome) = oneshot::channel();
    self
      .tx
      .send(HostEvent::Install { done })
      .map_err(|_| eyre!("Service stopped"))?;
    outcome
      .await
      .map_err(|_| eyre!("Service dropped install notification"))?
  }

  /// Prune stale partitions and take over traffic.
  pub async fn activate(&self) -> Result<()> {
    let (done, outcome) = oneshot::channel();
    self
      .tx
      .send(HostEvent::Activate { done })
      .map_err(|_| eyre!("Service stopped"))?;
    outcome
      .await
      .map_err(|_| eyre!("Service dropped activate notification"))?
  }

  /// Route one request. `Ok(None)` means the service declined to intervene
  /// and the caller should use its default network path.
  pub async fn request(&self, descriptor: RequestDescriptor) -> Result<Option<Served>> {
    let (respond, outcome) = oneshot::channel();
    self
      .tx
      .send(HostEvent::Request {
        descriptor,
        respond,
      })
      .map_err(|_| eyre!("Service stopped"))?;
    outcome
      .await
      .map_err(|_| eyre!("Service dropped request notification"))?
      .transpose()
  }
}
