use color_eyre::{eyre::eyre, Result};
use reqwest::header::ACCEPT;

use super::types::{RequestDescriptor, Snapshot};

/// HTTP fetch client wrapper
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("cachegate/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Perform a single network fetch for the described request.
  ///
  /// Non-2xx responses come back as snapshots; only transport failures
  /// (connection refused, DNS, timeouts) produce an error.
  pub async fn fetch(&self, descriptor: &RequestDescriptor) -> Result<Snapshot> {
    let mut request = self
      .client
      .request(descriptor.method.clone(), descriptor.url.clone());

    if let Some(accept) = &descriptor.accept {
      request = request.header(ACCEPT, accept);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", descriptor.url, e))?;

    let status = response.status().as_u16();
    let url = response.url().clone();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body for {}: {}", descriptor.url, e))?
      .to_vec();

    Ok(Snapshot {
      status,
      url,
      headers,
      body,
    })
  }
}
