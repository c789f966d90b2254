//! Persistent content-addressed blob cache
//!
//! Blobs are cached on disk under a (key, stash) fingerprint with an
//! in-memory index that is snapshotted to `index.dat`. Writes are handed to a
//! background worker, the cache is pruned LRU-first against a quota derived
//! from free disk space, and expiry is suspended until the system clock is
//! known to be set. Any inconsistency found on disk degrades to a cache miss.

mod cache;
mod clock;
mod config;
mod digest;
mod error;
mod flush;
mod index;
mod quota;
mod snapshot;
mod store;
mod types;

pub use cache::Cache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, KNOWN_GOOD_EPOCH, MAX_QUOTA, MIN_QUOTA};
pub use digest::{digest_content, digest_key};
pub use error::{BlobCacheError, Result, SnapshotError};
pub use flush::Phase;
pub use index::{Index, PutOutcome};
pub use snapshot::{decode as decode_snapshot, encode as encode_snapshot, Snapshot};
pub use store::BlobStore;
pub use types::{Blob, CacheItem, CacheStats, GetOptions, Metadata, PutOptions};
