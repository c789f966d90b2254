//! Cache configuration

use crate::clock::{Clock, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 2020-01-01T00:00:00Z. A clock reading earlier than this is not trusted.
pub const KNOWN_GOOD_EPOCH: i64 = 1_577_836_800;

/// Lower bound on `free + used` before the 1/10 quota factor
pub const MIN_QUOTA: u64 = 100 * 1000 * 1000;
/// Upper bound on `free + used` before the 1/10 quota factor
pub const MAX_QUOTA: u64 = 5000 * 1000 * 1000;

/// Configuration for a [`crate::Cache`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the shard directories and `index.dat`
    pub root: PathBuf,
    pub min_quota: u64,
    pub max_quota: u64,
    /// Quiet period after the first change before the index is saved
    pub save_debounce: Duration,
    /// How often the worker rechecks an untrusted clock
    pub clock_poll_interval: Duration,
    pub known_good_epoch: i64,
    pub clock: Arc<dyn Clock>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cache/bc2"),
            min_quota: MIN_QUOTA,
            max_quota: MAX_QUOTA,
            save_debounce: Duration::from_secs(5),
            clock_poll_interval: Duration::from_secs(1),
            known_good_epoch: KNOWN_GOOD_EPOCH,
            clock: Arc::new(SystemClock),
        }
    }
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_quota_bounds(mut self, min_quota: u64, max_quota: u64) -> Self {
        self.min_quota = min_quota.min(max_quota);
        self.max_quota = max_quota.max(min_quota);
        self
    }

    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    pub fn with_clock_poll_interval(mut self, interval: Duration) -> Self {
        self.clock_poll_interval = interval;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.dat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.root, PathBuf::from("./cache/bc2"));
        assert_eq!(config.min_quota, MIN_QUOTA);
        assert_eq!(config.max_quota, MAX_QUOTA);
        assert_eq!(config.save_debounce, Duration::from_secs(5));
        assert_eq!(config.index_path(), PathBuf::from("./cache/bc2/index.dat"));
    }

    #[test]
    fn test_quota_bounds_are_ordered() {
        let config = CacheConfig::new("/tmp/x").with_quota_bounds(500, 100);
        assert!(config.min_quota <= config.max_quota);
    }

    #[test]
    fn test_with_clock() {
        let config = CacheConfig::new("/tmp/x").with_clock(ManualClock::new(12));
        assert_eq!(config.clock.now(), 12);
    }
}
