//! Network fetch client and the request/response types it shares with the
//! caching layer.

mod client;
mod types;

pub use client::HttpClient;
pub use types::{RequestDescriptor, RequestMode, Snapshot};
