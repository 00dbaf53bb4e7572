//! Bounded per-identity session pool.
//!
//! A cookie jar must never be mutated by two tasks at once, so each
//! subject gets one pooled slot behind an async mutex: whoever holds the
//! slot lock may read, refresh, or replace the credential. Entries expire
//! on a fixed TTL, the pool is capacity-bounded with oldest-first
//! eviction, and a background sweeper clears expired entries so idle
//! subjects do not pin memory until their next visit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SessionPoolSettings;
use crate::domain::identity::SessionCredential;

/// A subject's pooled session slot. `None` means no login has happened
/// since the slot was minted (or the last discard).
pub type SessionSlot = Arc<Mutex<Option<SessionCredential>>>;

struct PoolEntry {
    slot: SessionSlot,
    created_at: Instant,
}

impl PoolEntry {
    fn fresh(now: Instant) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            created_at: now,
        }
    }
}

pub struct SessionPool {
    entries: DashMap<String, PoolEntry>,
    capacity: usize,
    entry_ttl: Duration,
}

impl SessionPool {
    pub fn new(settings: &SessionPoolSettings) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: settings.capacity.get() as usize,
            entry_ttl: settings.entry_ttl,
        }
    }

    /// Returns the subject's slot, minting an empty one on first use.
    /// An entry past its TTL is replaced, not returned: the portal will
    /// have dropped the server side of the session long before.
    pub fn lease(&self, subject: &str) -> SessionSlot {
        let now = Instant::now();
        let mut created = false;
        let slot = {
            let mut entry = self.entries.entry(subject.to_string()).or_insert_with(|| {
                created = true;
                PoolEntry::fresh(now)
            });
            if !created && now.duration_since(entry.created_at) >= self.entry_ttl {
                *entry = PoolEntry::fresh(now);
            }
            entry.slot.clone()
        };
        if created {
            self.shrink_to_capacity(subject);
        }
        slot
    }

    /// Forgets the subject's entry. Called when the portal rejects the
    /// pooled credential so the next lease starts from a clean slot.
    pub fn discard(&self, subject: &str) {
        self.entries.remove(subject);
    }

    /// Evicts every expired entry; returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.created_at) < self.entry_ttl);
        before - self.entries.len()
    }

    fn shrink_to_capacity(&self, keep: &str) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().created_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Periodic expired-entry eviction.
pub fn spawn_sweeper(pool: Arc<SessionPool>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = pool.sweep();
            if evicted > 0 {
                counter!("ateneo_session_evicted_total").increment(evicted as u64);
                debug!(evicted, "evicted expired portal sessions");
            }
        }
    })
}
