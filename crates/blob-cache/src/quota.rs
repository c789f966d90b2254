//! Disk quota derived from free space

use std::path::Path;
use tracing::warn;

/// A tenth of `free + current`, with the sum clamped to `[min, max]`.
pub fn compute_quota(free: u64, current: u64, min: u64, max: u64) -> u64 {
    free.saturating_add(current).clamp(min, max.max(min)) / 10
}

/// Free bytes on the filesystem holding `root`; 0 when unknown.
pub fn available_space(root: &Path) -> u64 {
    match fs2::available_space(root) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(root = ?root, error = %e, "Unable to query free disk space");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_clamps_low() {
        assert_eq!(compute_quota(0, 0, 1000, 5000), 100);
    }

    #[test]
    fn test_quota_clamps_high() {
        assert_eq!(compute_quota(u64::MAX, 10, 1000, 5000), 500);
    }

    #[test]
    fn test_quota_counts_current_usage() {
        assert_eq!(compute_quota(2000, 1000, 1000, 5000), 300);
    }

    #[test]
    fn test_available_space_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_space(dir.path()) > 0);
    }
}
