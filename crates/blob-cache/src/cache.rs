//! Public cache handle

use crate::clock::epoch32;
use crate::config::CacheConfig;
use crate::digest::{digest_content, digest_key};
use crate::error::Result;
use crate::flush::{FlushEntry, Phase, Shared, State};
use crate::index::{Index, PutOutcome};
use crate::snapshot::{self, MAGIC_CURRENT};
use crate::store::{padded_buffer, remove_legacy_formats};
use crate::types::{Blob, CacheItem, CacheStats, GetOptions, Metadata, PutOptions, MAX_SHORT_STRING};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A persistent blob cache with a background write-back worker
///
/// `put` never waits for disk I/O. `get` reads the blob file, outside the
/// cache lock, only when the newest bytes are not still queued.
pub struct Cache {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Open the cache at `config.root` and start the flush worker.
    ///
    /// A missing or corrupt snapshot starts an empty cache. Fails only when
    /// the root directory cannot be created or the worker cannot be spawned.
    pub fn init(config: CacheConfig) -> Result<Self> {
        remove_legacy_formats(&config.root);
        fs::create_dir_all(&config.root)?;

        let (index, dirty) = match snapshot::load_file(&config.index_path()) {
            Ok(Some(snapshot)) => {
                if snapshot.magic != MAGIC_CURRENT {
                    info!(magic = %format!("{:#010x}", snapshot.magic), "Migrating index snapshot");
                }
                (snapshot.index, snapshot.magic != MAGIC_CURRENT)
            }
            Ok(None) => (Index::new(), false),
            Err(e) => {
                warn!(error = %e, "Discarding index snapshot, starting with an empty cache");
                (Index::new(), true)
            }
        };

        let clock_sane = config.clock.now() > config.known_good_epoch;
        let mut state = State::new(index, clock_sane, 0);
        if dirty {
            state.mark_dirty();
        }
        if !clock_sane {
            warn!(
                now = config.clock.now(),
                "System clock is not set, expiry disabled until it is"
            );
        }

        let shared = Arc::new(Shared::new(config, state));

        let valid: HashSet<u64> = shared.state.lock().index.fingerprints().collect();
        let removed = shared.store.sweep_orphans(&valid);
        if removed > 0 {
            debug!(removed, "Removed stale blob files");
        }

        {
            let mut state = shared.state.lock();
            state.quota = shared.current_quota(state.index.current_size());
            info!(
                items = state.index.len(),
                bytes = state.index.current_size(),
                quota = state.quota,
                root = ?shared.config.root,
                "Blob cache initialized"
            );
        }

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("blobcache-flush".to_string())
            .spawn(move || worker_shared.run())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Store `data` under (key, stash).
    ///
    /// Returns true when identical content was already cached, in which case
    /// only the metadata is refreshed and nothing is written.
    pub fn put(&self, key: &str, stash: &str, data: impl Into<Arc<[u8]>>, opts: PutOptions) -> bool {
        let data: Arc<[u8]> = data.into();
        let key_fp = digest_key(key, stash);

        let Ok(size) = u32::try_from(data.len()) else {
            warn!(key = %key, size = data.len(), "Blob too large to cache");
            return false;
        };

        let content_type = opts.content_type.filter(|ct| {
            let fits = ct.len() <= MAX_SHORT_STRING;
            if !fits {
                debug!(key = %key, len = ct.len(), "Content type too long, not stored");
            }
            fits
        });
        let etag = opts.etag.filter(|etag| {
            let fits = etag.len() <= MAX_SHORT_STRING;
            if !fits {
                debug!(key = %key, len = etag.len(), "Etag too long, not stored");
            }
            fits
        });

        let now = self.shared.config.clock.now();
        let content_fp = digest_content(&data);
        let item = CacheItem {
            key_fingerprint: key_fp,
            content_fingerprint: content_fp,
            last_access: epoch32(now),
            expiry: epoch32(now.saturating_add(opts.max_age as i64)),
            modtime: epoch32(opts.modtime),
            size,
            content_type_len: content_type.as_ref().map_or(0, |ct| ct.len() as u8),
            important: opts.important,
            etag,
            seq: 0,
        };

        let mut state = self.shared.state.lock();
        let outcome = state.index.put(item);
        state.mark_dirty();
        if outcome == PutOutcome::NeedsWrite {
            state.enqueue_write(FlushEntry {
                key_fp,
                content_fp,
                content_type,
                data,
            });
        }
        drop(state);
        self.shared.wake.notify_one();

        debug!(key = %key, stash = %stash, size, ?outcome, "Cached blob");
        outcome == PutOutcome::AlreadyCurrent
    }

    /// Fetch the blob cached under (key, stash).
    pub fn get(&self, key: &str, stash: &str, opts: GetOptions) -> Option<Blob> {
        let blob = self.lookup_blob(key, stash, opts);
        let counter = if blob.is_some() {
            &self.shared.hits
        } else {
            &self.shared.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        blob
    }

    fn lookup_blob(&self, key: &str, stash: &str, opts: GetOptions) -> Option<Blob> {
        let key_fp = digest_key(key, stash);
        let mut state = self.shared.state.lock();
        let item = state.index.lookup(key_fp)?.clone();

        let now = epoch32(self.shared.config.clock.now());
        let expired = state.clock_sane && item.is_expired(now);
        if expired && !opts.allow_stale {
            debug!(key = %key, expiry = item.expiry, now, "Cache entry expired");
            self.evict_locked(&mut state, key_fp);
            return None;
        }

        let mut wake = false;
        if state.clock_sane {
            state.index.touch(key_fp, now);
            wake = state.mark_dirty();
        }

        let pending = state
            .pending_write(key_fp)
            .map(|entry| (Arc::clone(&entry.data), entry.content_type.clone()));
        drop(state);
        if wake {
            self.shared.wake.notify_one();
        }

        let (data, len, content_type) = match pending {
            Some((bytes, content_type)) => {
                let Some(mut data) = padded_buffer(bytes.len(), opts.pad) else {
                    warn!(key = %key, pad = opts.pad, "Cannot allocate padded blob");
                    return None;
                };
                data.extend_from_slice(&bytes);
                data.resize(bytes.len() + opts.pad, 0);
                (data, bytes.len(), content_type)
            }
            None => {
                match self.shared.store.read(
                    key_fp,
                    item.content_type_len as usize,
                    item.size as usize,
                    opts.pad,
                ) {
                    Ok(stored) => (stored.data, stored.len, stored.content_type),
                    Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                        warn!(key = %key, pad = opts.pad, error = %e, "Cannot allocate padded blob");
                        return None;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to read cached file, removing entry");
                        self.self_heal(key_fp, &item);
                        return None;
                    }
                }
            }
        };

        Some(Blob {
            data,
            len,
            content_type,
            etag: item.etag,
            modtime: item.modtime as i64,
            stale: expired,
        })
    }

    /// Drop an entry whose file is missing or inconsistent, unless it was
    /// replaced meanwhile.
    fn self_heal(&self, key_fp: u64, seen: &CacheItem) {
        let mut state = self.shared.state.lock();
        let unchanged = state.index.lookup(key_fp).is_some_and(|item| {
            item.content_fingerprint == seen.content_fingerprint && item.size == seen.size
        });
        if unchanged && state.pending_write(key_fp).is_none() {
            self.evict_locked(&mut state, key_fp);
        }
    }

    /// Metadata of a cached entry, without touching the disk.
    pub fn get_metadata(&self, key: &str, stash: &str) -> Option<Metadata> {
        let key_fp = digest_key(key, stash);
        let state = self.shared.state.lock();
        state.index.lookup(key_fp).map(|item| Metadata {
            etag: item.etag.clone(),
            modtime: item.modtime as i64,
        })
    }

    /// Index record for (key, stash), if cached.
    pub fn lookup(&self, key: &str, stash: &str) -> Option<CacheItem> {
        let key_fp = digest_key(key, stash);
        self.shared.state.lock().index.lookup(key_fp).cloned()
    }

    /// Remove an entry regardless of importance. Returns true if it existed.
    pub fn evict(&self, key: &str, stash: &str) -> bool {
        let key_fp = digest_key(key, stash);
        let mut state = self.shared.state.lock();
        let removed = self.evict_locked(&mut state, key_fp);
        if removed {
            debug!(key = %key, stash = %stash, "Evicted cache entry");
        }
        removed
    }

    fn evict_locked(&self, state: &mut State, key_fp: u64) -> bool {
        if state.index.remove(key_fp).is_none() {
            return false;
        }
        state.enqueue_delete(key_fp);
        state.mark_dirty();
        self.shared.wake.notify_one();
        true
    }

    /// Evict every entry and delete every blob file. Returns the entry count.
    pub fn clear_all(&self) -> usize {
        let mut state = self.shared.state.lock();
        let count = state.index.clear();
        state.enqueue_purge();
        state.mark_dirty();
        drop(state);
        self.shared.wake.notify_one();
        info!(count, "Cleared all cached files");
        count
    }

    /// Block until every queued write has landed and the index is saved.
    pub fn sync(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        let ticket = state.request_sync();
        self.shared.wake.notify_one();
        while !state.synced(ticket) && !state.stopped {
            self.shared.idle.wait(&mut state);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        CacheStats {
            entries: state.index.len(),
            total_size: state.index.current_size(),
            pending_writes: state.pending_writes(),
            quota: state.quota,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            clock_sane: state.clock_sane,
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase()
    }

    /// Write pending blobs, save the index and stop the worker.
    ///
    /// Later calls are no-ops. The cache stays readable afterwards but
    /// nothing more reaches the disk.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        self.shared.state.lock().request_stop();
        self.shared.wake.notify_one();
        if worker.join().is_err() {
            warn!("Flush worker panicked");
        }
        info!("Blob cache shut down");
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
