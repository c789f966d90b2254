//! Background write-back worker
//!
//! One thread owns every disk mutation: blob writes, deletions, purges,
//! quota pruning and index snapshots. Callers only touch shared state under
//! the lock and enqueue work; the worker drops the lock around each I/O call.

use crate::clock::epoch32;
use crate::config::CacheConfig;
use crate::index::Index;
use crate::quota::{available_space, compute_quota};
use crate::snapshot;
use crate::store::BlobStore;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A blob accepted by `put` but not yet on disk
#[derive(Debug, Clone)]
pub(crate) struct FlushEntry {
    pub key_fp: u64,
    pub content_fp: u32,
    pub content_type: Option<String>,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub(crate) enum FlushOp {
    Write(FlushEntry),
    Delete(u64),
    Purge,
}

impl FlushOp {
    fn writes(&self, key_fp: u64) -> bool {
        matches!(self, FlushOp::Write(entry) if entry.key_fp == key_fp)
    }
}

#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    op: FlushOp,
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Clock reads before the known-good epoch; expiry is off and hits do
    /// not refresh access times
    AwaitingSaneClock,
    Running,
    /// Draining the queue before the final save
    Stopping,
}

/// Everything guarded by the cache lock
#[derive(Debug)]
pub(crate) struct State {
    pub index: Index,
    queue: VecDeque<Queued>,
    next_seq: u64,
    dirty_since: Option<Instant>,
    pub clock_sane: bool,
    stopping: bool,
    pub stopped: bool,
    pub quota: u64,
    sync_requested: u64,
    sync_done: u64,
}

impl State {
    pub fn new(index: Index, clock_sane: bool, quota: u64) -> Self {
        Self {
            index,
            queue: VecDeque::new(),
            next_seq: 0,
            dirty_since: None,
            clock_sane,
            stopping: false,
            stopped: false,
            quota,
            sync_requested: 0,
            sync_done: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.stopping {
            Phase::Stopping
        } else if self.clock_sane {
            Phase::Running
        } else {
            Phase::AwaitingSaneClock
        }
    }

    /// Returns true when the index was clean before.
    pub fn mark_dirty(&mut self) -> bool {
        if self.dirty_since.is_some() {
            return false;
        }
        self.dirty_since = Some(Instant::now());
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// Queue a write, superseding any older queued write of the same key.
    pub fn enqueue_write(&mut self, entry: FlushEntry) {
        self.drop_writes(entry.key_fp);
        self.push(FlushOp::Write(entry));
    }

    pub fn enqueue_delete(&mut self, key_fp: u64) {
        self.drop_writes(key_fp);
        self.push(FlushOp::Delete(key_fp));
    }

    pub fn enqueue_purge(&mut self) {
        self.queue.retain(|q| !matches!(q.op, FlushOp::Write(_)));
        self.push(FlushOp::Purge);
    }

    /// Newest queued write for `key_fp`.
    pub fn pending_write(&self, key_fp: u64) -> Option<&FlushEntry> {
        self.queue.iter().rev().find_map(|q| match &q.op {
            FlushOp::Write(entry) if entry.key_fp == key_fp => Some(entry),
            _ => None,
        })
    }

    pub fn pending_writes(&self) -> usize {
        self.queue
            .iter()
            .filter(|q| matches!(q.op, FlushOp::Write(_)))
            .count()
    }

    pub fn request_sync(&mut self) -> u64 {
        self.sync_requested += 1;
        self.sync_requested
    }

    pub fn synced(&self, ticket: u64) -> bool {
        self.sync_done >= ticket
    }

    pub fn request_stop(&mut self) {
        self.stopping = true;
    }

    fn drop_writes(&mut self, key_fp: u64) {
        self.queue.retain(|q| !q.op.writes(key_fp));
    }

    fn push(&mut self, op: FlushOp) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(Queued { seq, op });
    }

    /// The oldest op stays queued while it runs so reads can still find it.
    fn front(&self) -> Option<Queued> {
        self.queue.front().cloned()
    }

    fn finish(&mut self, seq: u64) {
        self.queue.retain(|q| q.seq != seq);
    }
}

/// State shared between the public handle and the worker
#[derive(Debug)]
pub(crate) struct Shared {
    pub state: Mutex<State>,
    /// Wakes the worker
    pub wake: Condvar,
    /// Signals completed syncs and worker exit
    pub idle: Condvar,
    pub store: BlobStore,
    pub config: CacheConfig,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl Shared {
    pub fn new(config: CacheConfig, state: State) -> Self {
        Self {
            state: Mutex::new(state),
            wake: Condvar::new(),
            idle: Condvar::new(),
            store: BlobStore::new(config.root.clone()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn clock_is_sane(&self) -> bool {
        self.config.clock.now() > self.config.known_good_epoch
    }

    pub fn current_quota(&self, current_size: u64) -> u64 {
        compute_quota(
            available_space(&self.config.root),
            current_size,
            self.config.min_quota,
            self.config.max_quota,
        )
    }

    /// Worker main loop; returns after the final save.
    pub fn run(&self) {
        let mut state = self.state.lock();
        let mut prune_pending = true;

        loop {
            if !state.clock_sane && self.clock_is_sane() {
                state.clock_sane = true;
                info!("System clock is sane, enabling expiry");
            }

            if prune_pending {
                self.prune(&mut state);
                prune_pending = false;
            }

            if let Some(queued) = state.front() {
                if self.execute(&mut state, queued) {
                    prune_pending = true;
                }
                continue;
            }

            if state.sync_requested > state.sync_done {
                self.save(&mut state);
                state.sync_done = state.sync_requested;
                self.idle.notify_all();
                continue;
            }

            if state.stopping {
                self.save(&mut state);
                break;
            }

            let mut timeout = None;
            if let Some(since) = state.dirty_since {
                let elapsed = since.elapsed();
                if elapsed >= self.config.save_debounce {
                    self.save(&mut state);
                    continue;
                }
                timeout = Some(self.config.save_debounce - elapsed);
            }
            if !state.clock_sane {
                let poll = self.config.clock_poll_interval;
                timeout = Some(timeout.map_or(poll, |t: Duration| t.min(poll)));
            }

            match timeout {
                Some(timeout) => {
                    self.wake.wait_for(&mut state, timeout);
                }
                None => self.wake.wait(&mut state),
            }
        }

        state.stopped = true;
        self.idle.notify_all();
        debug!("Flush worker stopped");
    }

    /// Run one queued op. Returns true if a blob was written.
    fn execute(&self, state: &mut MutexGuard<'_, State>, queued: Queued) -> bool {
        match queued.op {
            FlushOp::Write(entry) => {
                let key_fp = entry.key_fp;
                let result = MutexGuard::unlocked(state, || {
                    self.store
                        .write(key_fp, entry.content_type.as_deref(), &entry.data)
                });
                state.finish(queued.seq);

                let superseded = state.pending_write(key_fp).is_some();
                match result {
                    Ok(()) => {
                        debug!(key_fp = %format!("{:016x}", key_fp), size = entry.data.len(), "Wrote blob");
                        if !superseded && !state.index.contains(key_fp) {
                            // Evicted while the write was in flight
                            MutexGuard::unlocked(state, || self.store.delete(key_fp));
                        }
                    }
                    Err(e) => {
                        warn!(key_fp = %format!("{:016x}", key_fp), error = %e, "Failed to write blob");
                        let stale = state
                            .index
                            .lookup(key_fp)
                            .is_some_and(|item| item.content_fingerprint == entry.content_fp);
                        if stale && !superseded {
                            state.index.remove(key_fp);
                            state.mark_dirty();
                        }
                    }
                }
                true
            }
            FlushOp::Delete(key_fp) => {
                MutexGuard::unlocked(state, || self.store.delete(key_fp));
                state.finish(queued.seq);
                false
            }
            FlushOp::Purge => {
                let removed = MutexGuard::unlocked(state, || self.store.purge());
                state.finish(queued.seq);
                info!(removed, "Purged all blob files");
                false
            }
        }
    }

    /// Recompute the quota and evict LRU items above it.
    fn prune(&self, state: &mut MutexGuard<'_, State>) {
        let free = MutexGuard::unlocked(state, || available_space(&self.config.root));
        let quota = compute_quota(
            free,
            state.index.current_size(),
            self.config.min_quota,
            self.config.max_quota,
        );
        state.quota = quota;

        let victims = state.index.prune_to_size(quota);
        if victims.is_empty() {
            return;
        }
        for key_fp in &victims {
            state.drop_writes(*key_fp);
        }
        state.mark_dirty();
        info!(
            evicted = victims.len(),
            current_size = state.index.current_size(),
            quota,
            "Pruned cache to quota"
        );

        MutexGuard::unlocked(state, || {
            for key_fp in &victims {
                self.store.delete(*key_fp);
            }
        });
    }

    /// Write the index snapshot if anything changed since the last save.
    fn save(&self, state: &mut MutexGuard<'_, State>) {
        if !state.is_dirty() {
            return;
        }

        let data = snapshot::encode(&state.index, epoch32(self.config.clock.now()));
        let items = state.index.len();
        state.dirty_since = None;

        let path = self.config.index_path();
        match MutexGuard::unlocked(state, || snapshot::write_file(&path, &data)) {
            Ok(()) => debug!(items, bytes = data.len(), "Saved index snapshot"),
            Err(e) => {
                warn!(path = ?path, error = %e, "Unable to store index file");
                state.mark_dirty();
            }
        }
    }
}
