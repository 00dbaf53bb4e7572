//! Cache configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);
const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(10 * 60);

/// Resolved cache tuning, derived from the `[cache]` settings section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Disabling turns every probe into a miss and every write into a no-op.
    pub enabled: bool,
    /// Maximum snapshots held before LRU eviction.
    pub capacity: usize,
    /// Lifetime of real snapshots.
    pub snapshot_ttl: Duration,
    /// Lifetime of confirmed-empty sentinels. Deliberately short: an empty
    /// scope usually means the subject is about to act on it upstream.
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CAPACITY,
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            capacity: settings.capacity.get() as usize,
            snapshot_ttl: settings.snapshot_ttl,
            negative_ttl: settings.negative_ttl,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
