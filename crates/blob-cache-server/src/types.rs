//! Configuration and response types for the blob cache server

use blob_cache::{CacheConfig, CacheStats, MAX_QUOTA, MIN_QUOTA};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub min_quota: u64,
    pub max_quota: u64,
    pub save_debounce_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            cache_dir: PathBuf::from("./cache/bc2"),
            min_quota: MIN_QUOTA,
            max_quota: MAX_QUOTA,
            save_debounce_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(defaults.port);

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let min_quota = env::var("MIN_QUOTA")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.min_quota);

        let max_quota = env::var("MAX_QUOTA")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_quota);

        let save_debounce_secs = env::var("SAVE_DEBOUNCE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.save_debounce_secs);

        Self {
            port,
            cache_dir,
            min_quota,
            max_quota,
            save_debounce_secs,
        }
    }

    /// Quota bounds in decimal megabytes, the unit they are configured in
    pub fn quota_bounds_mb(&self) -> (u64, u64) {
        (self.min_quota / 1_000_000, self.max_quota / 1_000_000)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(self.cache_dir.clone())
            .with_quota_bounds(self.min_quota, self.max_quota)
            .with_save_debounce(Duration::from_secs(self.save_debounce_secs))
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

/// Body returned by a blob upload
#[derive(Debug, Serialize)]
pub struct PutResponse {
    /// Identical content was already cached
    pub unchanged: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3005);
        assert_eq!(config.cache_dir, PathBuf::from("./cache/bc2"));
        assert_eq!(config.min_quota, MIN_QUOTA);
        assert_eq!(config.save_debounce_secs, 5);
    }

    #[test]
    fn test_quota_bounds_mb() {
        assert_eq!(ServerConfig::default().quota_bounds_mb(), (100, 5000));
    }

    #[test]
    fn test_cache_config_carries_settings() {
        let config = ServerConfig {
            save_debounce_secs: 9,
            min_quota: 10,
            max_quota: 20,
            ..ServerConfig::default()
        };
        let cache_config = config.cache_config();
        assert_eq!(cache_config.save_debounce, Duration::from_secs(9));
        assert_eq!(cache_config.min_quota, 10);
        assert_eq!(cache_config.max_quota, 20);
        assert_eq!(cache_config.root, PathBuf::from("./cache/bc2"));
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 3600,
            cache: CacheStats {
                entries: 100,
                total_size: 50_000_000,
                hits: 500,
                misses: 50,
                ..CacheStats::default()
            },
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("3600"));
        assert!(json.contains("50000000"));
    }
}
