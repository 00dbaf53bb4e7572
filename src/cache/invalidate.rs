//! Two-phase cache invalidation.
//!
//! A single delete is not enough under concurrency: a reader that loaded
//! the database just before a write committed can repopulate the key
//! right after the delete lands. The coordinator deletes immediately and
//! schedules an identical delete through the delay queue, so any stale
//! repopulation in that window is wiped once the delay elapses.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::keys::CacheKey;
use crate::cache::store::KvCache;
use crate::infra::queue::{BrokerError, DelayQueue, Envelope};

const SWEEPER_GROUP: &str = "cache.sweeper";
const DELETE_ACTION: &str = "delete";

#[derive(Clone)]
pub struct Invalidator {
    kv: Arc<dyn KvCache>,
    defer: DelayQueue,
}

impl Invalidator {
    pub fn new(kv: Arc<dyn KvCache>, defer: DelayQueue) -> Self {
        Self { kv, defer }
    }

    /// Drops the key now and schedules the trailing delete. Invalidation
    /// never fails the caller; a cache holding a stale entry heals when
    /// the TTL runs out.
    pub async fn invalidate(&self, key: &CacheKey) {
        if let Err(error) = self.kv.delete(key.as_str()).await {
            warn!(key = %key, error = %error, "immediate cache delete failed");
        }
        match self.defer.send(key.as_str(), DELETE_ACTION).await {
            Ok(()) => {
                counter!("ateneo_cache_invalidation_total").increment(1);
                debug!(key = %key, "scheduled trailing cache delete");
            }
            Err(error) => {
                warn!(key = %key, error = %error, "failed to schedule trailing cache delete");
            }
        }
    }
}

/// Spawns the consumer that applies trailing deletes once their delay
/// elapses. Handler failures are nacked and retried by the queue.
pub async fn spawn_delete_consumer(
    defer: &DelayQueue,
    kv: Arc<dyn KvCache>,
) -> Result<JoinHandle<()>, BrokerError> {
    defer
        .consume(SWEEPER_GROUP, move |envelope: Envelope| {
            let kv = kv.clone();
            async move {
                if envelope.value != DELETE_ACTION {
                    warn!(
                        key = %envelope.key,
                        action = %envelope.value,
                        "ignoring unknown cache maintenance action"
                    );
                    return Ok(());
                }
                kv.delete(&envelope.key).await
            }
        })
        .await
}
