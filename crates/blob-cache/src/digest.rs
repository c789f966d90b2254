//! Key, content and snapshot fingerprints

use sha2::{Digest, Sha256};
use xxhash_rust::xxh32::xxh32;

/// Length of the snapshot trailer.
pub const CHECKSUM_LEN: usize = 20;

/// Fingerprint of a logical key within a stash.
///
/// Key and stash are fed to the hash back to back, so ("ab", "c") and
/// ("a", "bc") share a fingerprint. Callers pick stash names that cannot
/// collide this way.
pub fn digest_key(key: &str, stash: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(stash.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Cheap fingerprint used only to skip rewriting identical content.
pub fn digest_content(data: &[u8]) -> u32 {
    xxh32(data, 0)
}

/// Truncated SHA-256 over a snapshot body.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_key_deterministic() {
        let a = digest_key("https://example.com/a.png", "fa");
        let b = digest_key("https://example.com/a.png", "fa");
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_key_depends_on_stash() {
        let a = digest_key("key", "images");
        let b = digest_key("key", "thumbs");
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_content() {
        assert_eq!(digest_content(b"hello"), digest_content(b"hello"));
        assert_ne!(digest_content(b"hello"), digest_content(b"hellp"));
        assert_eq!(digest_content(b""), xxh32(b"", 0));
    }

    #[test]
    fn test_checksum_length_and_sensitivity() {
        let a = checksum(b"snapshot body");
        let b = checksum(b"snapshot bodz");
        assert_eq!(a.len(), CHECKSUM_LEN);
        assert_ne!(a, b);
    }
}
