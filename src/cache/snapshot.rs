//! Read-through snapshot cache for record queries.
//!
//! Whole result sets are cached per (subject, scope). An empty result is a
//! first-class answer: it is stored as a sentinel with a short TTL so a
//! confirmed-empty scope does not hammer the portal, while still aging out
//! quickly once the subject starts acting on that scope.

use std::sync::Arc;

use metrics::counter;
use tracing::warn;

use crate::domain::records::DomainRecord;

use super::config::CacheConfig;
use super::keys::CacheKey;
use super::store::KvCache;

/// Stored in place of a snapshot when upstream confirmed there are no records.
pub const NEGATIVE_SENTINEL: &str = "__nil__";

/// What a cache probe found.
#[derive(Debug)]
pub enum Lookup {
    /// A fresh snapshot.
    Hit(Vec<DomainRecord>),
    /// Upstream recently confirmed this scope is empty. Callers answer with
    /// an empty set and must not fall through to a refresh.
    Empty,
    /// Nothing usable cached: absent, expired, undecodable or backend error.
    Miss,
}

pub struct SnapshotCache {
    kv: Arc<dyn KvCache>,
    config: CacheConfig,
}

impl SnapshotCache {
    pub fn new(kv: Arc<dyn KvCache>, config: CacheConfig) -> Self {
        Self { kv, config }
    }

    pub async fn get(&self, key: &CacheKey) -> Lookup {
        if !self.config.enabled {
            return Lookup::Miss;
        }
        match self.kv.get(key.as_str()).await {
            Ok(Some(raw)) if raw == NEGATIVE_SENTINEL => {
                counter!("ateneo_cache_negative_hit_total").increment(1);
                Lookup::Empty
            }
            Ok(Some(raw)) => match serde_json::from_str::<Vec<DomainRecord>>(&raw) {
                Ok(records) => {
                    counter!("ateneo_cache_hit_total").increment(1);
                    Lookup::Hit(records)
                }
                Err(error) => {
                    warn!(key = %key, error = %error, "discarding undecodable cache snapshot");
                    counter!("ateneo_cache_miss_total").increment(1);
                    Lookup::Miss
                }
            },
            Ok(None) => {
                counter!("ateneo_cache_miss_total").increment(1);
                Lookup::Miss
            }
            Err(error) => {
                warn!(key = %key, error = %error, "cache read failed, treating as miss");
                counter!("ateneo_cache_error_total").increment(1);
                Lookup::Miss
            }
        }
    }

    /// Stores a refreshed snapshot. Empty sets become the negative sentinel
    /// under its short TTL. Write failures are logged and swallowed; the
    /// refresh that produced the data has already succeeded.
    pub async fn put(&self, key: &CacheKey, records: &[DomainRecord]) {
        if !self.config.enabled {
            return;
        }
        let (payload, ttl) = if records.is_empty() {
            (NEGATIVE_SENTINEL.to_string(), self.config.negative_ttl)
        } else {
            match serde_json::to_string(records) {
                Ok(json) => (json, self.config.snapshot_ttl),
                Err(error) => {
                    warn!(key = %key, error = %error, "snapshot not serializable, skipping cache write");
                    return;
                }
            }
        };
        if let Err(error) = self.kv.set(key.as_str(), &payload, ttl).await {
            warn!(key = %key, error = %error, "cache write failed");
            counter!("ateneo_cache_error_total").increment(1);
        }
    }
}
