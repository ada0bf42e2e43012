// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Snapshot Cache Module
//!
//! LRU cache of recently computed validator snapshots, keyed by block hash.
//! Internally synchronized so callers on different threads can share it
//! without an outer lock. Two threads missing on the same key may both
//! compute the snapshot; since snapshots are deterministic either result
//! is accepted.

use bft_types::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::snapshot::Snapshot;

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Hit, miss and eviction counts of a [`SnapshotCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU cache of snapshots
pub struct SnapshotCache {
    cache: Mutex<LruCache<Hash, Snapshot>>,
    capacity: usize,
    stats: CacheStats,
}

impl SnapshotCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            stats: CacheStats::default(),
        }
    }

    /// Get a snapshot, updating its recency.
    pub fn get(&self, hash: &Hash) -> Option<Snapshot> {
        let result = self.cache.lock().get(hash).cloned();
        let counter = if result.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Insert or replace. The least recently used entry is evicted when full.
    pub fn put(&self, snapshot: Snapshot) {
        let mut cache = self.cache.lock();
        if let Some((evicted, _)) = cache.push(snapshot.hash, snapshot) {
            if !cache.contains(&evicted) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.cache.lock().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats_snapshot())
            .finish()
    }
}
