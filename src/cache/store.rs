//! Key-value snapshot storage.
//!
//! The trait is the seam a shared backend (Redis and friends) would plug
//! into; the in-process store backs single-node deployments and tests.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Cache backend failure. Always soft: callers log it and treat the probe
/// as a miss, never as a request failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend failure: {0}")]
    Backend(String),
}

/// String-valued cache with per-entry expiry.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

struct TtlEntry {
    value: String,
    expires_at: Instant,
}

/// In-process KV store with LRU eviction and per-entry TTLs. Expired entries
/// are dropped lazily on the next probe.
pub struct MemoryKv {
    entries: RwLock<LruCache<String, TtlEntry>>,
}

impl MemoryKv {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.capacity_non_zero())),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvCache for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        rw_write(&self.entries, SOURCE, "set").put(
            key.to_string(),
            TtlEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }
}
