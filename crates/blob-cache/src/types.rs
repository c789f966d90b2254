//! Cache types

use serde::{Deserialize, Serialize};

/// Longest etag or content type the index can record.
pub const MAX_SHORT_STRING: usize = u8::MAX as usize;

/// Metadata for one cached blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key_fingerprint: u64,
    pub content_fingerprint: u32,
    pub last_access: u32,
    pub expiry: u32,
    pub modtime: u32,
    /// Payload bytes, excluding the content type prefix in the blob file
    pub size: u32,
    pub content_type_len: u8,
    /// Exempt from quota pruning
    pub important: bool,
    pub etag: Option<String>,
    /// Insertion order, breaks `last_access` ties when pruning
    pub(crate) seq: u64,
}

impl CacheItem {
    pub fn is_expired(&self, now: u32) -> bool {
        now > self.expiry
    }

    /// Length of the blob file backing this item.
    pub fn file_len(&self) -> u64 {
        self.content_type_len as u64 + self.size as u64
    }
}

/// Caller-supplied attributes of a `put`
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    /// Seconds from now until the entry expires
    pub max_age: u32,
    pub etag: Option<String>,
    /// Modification time of the source, e.g. HTTP Last-Modified
    pub modtime: i64,
    pub important: bool,
}

impl PutOptions {
    pub fn new(max_age: u32) -> Self {
        Self {
            max_age,
            ..Self::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn modtime(mut self, modtime: i64) -> Self {
        self.modtime = modtime;
        self
    }

    pub fn important(mut self, important: bool) -> Self {
        self.important = important;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Zeroed bytes appended after the payload
    pub pad: usize,
    /// Serve expired entries instead of evicting them
    pub allow_stale: bool,
}

impl GetOptions {
    pub fn stale() -> Self {
        Self {
            pad: 0,
            allow_stale: true,
        }
    }
}

/// A blob returned by `get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Payload followed by the requested padding
    pub data: Vec<u8>,
    pub len: usize,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub modtime: i64,
    /// Expired, served only because stale reads were allowed
    pub stale: bool,
}

impl Blob {
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub etag: Option<String>,
    pub modtime: i64,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub pending_writes: usize,
    pub quota: u64,
    pub hits: u64,
    pub misses: u64,
    pub clock_sane: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert!(!stats.clock_sane);
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            entries: 3,
            total_size: 12345,
            quota: 99,
            ..CacheStats::default()
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("12345"));
        assert!(json.contains("\"pending_writes\":0"));

        let deserialized: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.entries, 3);
        assert_eq!(deserialized.quota, 99);
    }

    #[test]
    fn test_put_options_builder() {
        let opts = PutOptions::new(60)
            .content_type("image/png")
            .etag("\"v1\"")
            .modtime(1000)
            .important(true);
        assert_eq!(opts.max_age, 60);
        assert_eq!(opts.content_type.as_deref(), Some("image/png"));
        assert_eq!(opts.etag.as_deref(), Some("\"v1\""));
        assert_eq!(opts.modtime, 1000);
        assert!(opts.important);
    }

    #[test]
    fn test_blob_payload_excludes_pad() {
        let blob = Blob {
            data: vec![b'h', b'i', 0, 0],
            len: 2,
            content_type: None,
            etag: None,
            modtime: 0,
            stale: false,
        };
        assert_eq!(blob.payload(), b"hi");
    }

    #[test]
    fn test_item_expiry() {
        let item = CacheItem {
            key_fingerprint: 1,
            content_fingerprint: 2,
            last_access: 0,
            expiry: 100,
            modtime: 0,
            size: 10,
            content_type_len: 3,
            important: false,
            etag: None,
            seq: 0,
        };
        assert!(!item.is_expired(100));
        assert!(item.is_expired(101));
        assert_eq!(item.file_len(), 13);
    }
}
