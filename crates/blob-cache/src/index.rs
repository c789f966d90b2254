//! In-memory index of cached items

use crate::types::CacheItem;
use std::collections::HashMap;
use tracing::debug;

/// Result of `Index::put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Same content already indexed; only metadata was refreshed
    AlreadyCurrent,
    /// New or changed content; the bytes must be written
    NeedsWrite,
}

/// Key fingerprint to item map, plus the aggregate payload size.
#[derive(Debug, Default)]
pub struct Index {
    items: HashMap<u64, CacheItem>,
    current_size: u64,
    next_seq: u64,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn put(&mut self, mut item: CacheItem) -> PutOutcome {
        if let Some(existing) = self.items.get_mut(&item.key_fingerprint) {
            if existing.content_fingerprint == item.content_fingerprint
                && existing.size == item.size
            {
                existing.modtime = item.modtime;
                existing.expiry = item.expiry;
                existing.last_access = item.last_access;
                existing.important = item.important;
                existing.etag = item.etag;
                return PutOutcome::AlreadyCurrent;
            }

            self.current_size -= existing.size as u64;
            self.current_size += item.size as u64;
            item.seq = existing.seq;
            *existing = item;
            return PutOutcome::NeedsWrite;
        }

        self.insert(item);
        PutOutcome::NeedsWrite
    }

    /// Add an item in insertion order, replacing any item with the same key.
    pub fn insert(&mut self, mut item: CacheItem) {
        item.seq = self.next_seq;
        self.next_seq += 1;
        self.current_size += item.size as u64;
        if let Some(old) = self.items.insert(item.key_fingerprint, item) {
            self.current_size -= old.size as u64;
        }
    }

    pub fn lookup(&self, key_fp: u64) -> Option<&CacheItem> {
        self.items.get(&key_fp)
    }

    pub fn contains(&self, key_fp: u64) -> bool {
        self.items.contains_key(&key_fp)
    }

    pub fn touch(&mut self, key_fp: u64, now: u32) {
        if let Some(item) = self.items.get_mut(&key_fp) {
            item.last_access = now;
        }
    }

    pub fn remove(&mut self, key_fp: u64) -> Option<CacheItem> {
        let item = self.items.remove(&key_fp)?;
        self.current_size -= item.size as u64;
        Some(item)
    }

    /// Drop every item, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        self.current_size = 0;
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheItem> {
        self.items.values()
    }

    /// Items in insertion order.
    pub fn iter_by_seq(&self) -> Vec<&CacheItem> {
        let mut items: Vec<&CacheItem> = self.items.values().collect();
        items.sort_unstable_by_key(|item| item.seq);
        items
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.keys().copied()
    }

    /// Evict least recently used items until the payload total fits `quota`.
    ///
    /// Non-important items go first, oldest access first, ties by insertion
    /// order. Important items are never evicted here. Returns the removed
    /// fingerprints so the caller can delete their files.
    pub fn prune_to_size(&mut self, quota: u64) -> Vec<u64> {
        if self.current_size <= quota {
            return Vec::new();
        }

        let mut order: Vec<(bool, u32, u64, u64)> = self
            .items
            .values()
            .filter(|item| !item.important)
            .map(|item| (item.important, item.last_access, item.seq, item.key_fingerprint))
            .collect();
        order.sort_unstable();

        let mut removed = Vec::new();
        for (_, _, _, key_fp) in order {
            if self.current_size <= quota {
                break;
            }
            if self.remove(key_fp).is_some() {
                removed.push(key_fp);
            }
        }

        debug!(
            removed = removed.len(),
            current_size = self.current_size,
            quota,
            "Pruned index"
        );
        removed
    }
}
