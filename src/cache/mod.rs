//! Cache partitions and the strategy router for offline support.
//!
//! This module provides the caching half of the gateway:
//! - Named, durable partitions holding response snapshots keyed by
//!   method + URL
//! - A versioned static partition populated from the asset manifest at
//!   install time, pruned of stale versions at activation
//! - A router that classifies each request and resolves it cache-first or
//!   network-first

mod partition;
mod router;
mod types;

pub use partition::{PartitionStore, SqlitePartitions, StoredSnapshot};
pub use router::{CacheRouter, Strategy, RUNTIME_PARTITION};
pub use types::{RequestKey, Served, ServedSource};
