//! Read-through record cache.
//!
//! Snapshots of upstream fetches are kept in a TTL'd key/value store so
//! repeat reads inside the freshness window skip the portal entirely.
//! Empty results are cached as a short-lived negative sentinel, refreshes
//! are coalesced through a single-flight group, and writes invalidate
//! with an immediate delete plus a deferred second delete.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `ateneo.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! capacity = 1024
//! snapshot_ttl_days = 3
//! negative_ttl_minutes = 10
//! ```

mod config;
mod flight;
mod invalidate;
mod keys;
pub(crate) mod lock;
mod snapshot;
mod store;

pub use config::CacheConfig;
pub use flight::FlightGroup;
pub use invalidate::{Invalidator, spawn_delete_consumer};
pub use keys::CacheKey;
pub use snapshot::{Lookup, SnapshotCache};
pub use store::{CacheError, KvCache, MemoryKv};
