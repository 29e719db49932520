mod cache;
mod config;
mod event;
mod net;
mod service;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheRouter, RequestKey, SqlitePartitions};
use crate::net::{HttpClient, RequestDescriptor};
use crate::service::Service;

#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(about = "Offline-first caching gateway for a fixed web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cachegate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch and cache every manifest asset into the static partition
  Install,
  /// Delete partitions left over from previous versions
  Activate,
  /// Route one request through the gateway; body goes to stdout
  Fetch {
    /// URL or origin-relative path to request
    url: String,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// Accept header to send
    #[arg(long)]
    accept: Option<String>,
  },
  /// List cache partitions
  Partitions,
  /// Remove a URL from every partition
  Evict {
    /// URL or origin-relative path of the entry to remove
    url: String,
    /// Request method of the entry to remove
    #[arg(long, default_value = "GET")]
    method: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cachegate=info")),
    )
    .with_writer(writer)
    .init();

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let origin = config.origin_url()?;

  let store = match &config.cache.db {
    Some(path) => SqlitePartitions::open(path)?,
    None => SqlitePartitions::open_default()?,
  };
  let router = CacheRouter::new(
    store,
    origin.clone(),
    &config.cache.version,
    config.manifest.clone(),
  );

  match args.command {
    Command::Install => {
      let client = HttpClient::new()?;
      let handle = Service::new(router, client).spawn();
      handle.install().await?;
      info!("static assets cached");
    }
    Command::Activate => {
      let client = HttpClient::new()?;
      let handle = Service::new(router, client).spawn();
      handle.activate().await?;
      info!("activated; stale partitions removed");
    }
    Command::Fetch {
      url,
      navigate,
      accept,
    } => {
      let url = origin
        .join(&url)
        .map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
      let mut descriptor = if navigate {
        RequestDescriptor::navigation(url)
      } else {
        RequestDescriptor::get(url)
      };
      if let Some(accept) = accept {
        descriptor = descriptor.with_accept(accept);
      }

      let client = HttpClient::new()?;
      let handle = Service::new(router, client.clone()).spawn();

      let snapshot = match handle.request(descriptor.clone()).await? {
        Some(served) => {
          match served.cached_at {
            Some(cached_at) => info!(
              status = served.snapshot.status,
              source = ?served.source,
              cached_at = %cached_at,
              "request served from cache"
            ),
            None => info!(
              status = served.snapshot.status,
              content_type = served.snapshot.header("content-type").unwrap_or("-"),
              "request served from network"
            ),
          }
          served.snapshot
        }
        None => {
          // Out-of-scope request; fall back to a plain fetch
          let snapshot = client.fetch(&descriptor).await?;
          info!(status = snapshot.status, "request passed through");
          snapshot
        }
      };

      std::io::stdout()
        .write_all(&snapshot.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?;
    }
    Command::Partitions => {
      for name in router.partitions()? {
        println!("{}", name);
      }
    }
    Command::Evict { url, method } => {
      let url = origin
        .join(&url)
        .map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
      let method = method
        .parse::<reqwest::Method>()
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

      router.evict(&RequestKey::new(method, url.as_str()))?;
      info!(url = %url, "entry evicted from all partitions");
    }
  }

  Ok(())
}
