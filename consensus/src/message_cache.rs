// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Gossip dedup caches
//!
//! Two independent LRU caches keyed by payload hash:
//! - *self*: messages this node has already processed
//! - *per-peer*: messages each neighbour is known to have
//!
//! Eviction only costs a redundant send or a redundant delivery into the
//! core, which the core tolerates. It never affects correctness.

use bft_types::{Address, Hash};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub struct MessageCache {
    known: Mutex<LruCache<Hash, ()>>,
    recent: Mutex<LruCache<Address, LruCache<Hash, ()>>>,
    message_capacity: NonZeroUsize,
}

impl MessageCache {
    /// `peer_capacity` bounds the number of peers tracked,
    /// `message_capacity` the hashes kept per cache.
    pub fn new(peer_capacity: usize, message_capacity: usize) -> Self {
        let message_capacity = NonZeroUsize::new(message_capacity).unwrap_or(NonZeroUsize::MIN);
        let peer_capacity = NonZeroUsize::new(peer_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            known: Mutex::new(LruCache::new(message_capacity)),
            recent: Mutex::new(LruCache::new(peer_capacity)),
            message_capacity,
        }
    }

    pub fn mark_seen(&self, hash: Hash) {
        self.known.lock().put(hash, ());
    }

    pub fn have_seen_self(&self, hash: &Hash) -> bool {
        self.known.lock().get(hash).is_some()
    }

    /// Mark as seen; `true` if it was not seen before.
    pub fn check_and_mark_seen(&self, hash: Hash) -> bool {
        self.known.lock().put(hash, ()).is_none()
    }

    pub fn have_seen_peer(&self, peer: &Address, hash: &Hash) -> bool {
        self.recent
            .lock()
            .get_mut(peer)
            .map(|seen| seen.get(hash).is_some())
            .unwrap_or(false)
    }

    pub fn mark_seen_peer(&self, peer: Address, hash: Hash) {
        self.check_and_mark_peer(peer, hash);
    }

    /// Mark `hash` as known to `peer`; `true` if the peer did not have it.
    pub fn check_and_mark_peer(&self, peer: Address, hash: Hash) -> bool {
        let mut recent = self.recent.lock();
        let capacity = self.message_capacity;
        let seen = recent.get_or_insert_mut(peer, || LruCache::new(capacity));
        seen.put(hash, ()).is_none()
    }

    /// Undo a peer mark for a message that never left this node.
    pub fn forget_peer(&self, peer: &Address, hash: &Hash) {
        if let Some(seen) = self.recent.lock().peek_mut(peer) {
            seen.pop(hash);
        }
    }

    pub fn known_len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn tracked_peers(&self) -> usize {
        self.recent.lock().len()
    }
}

impl std::fmt::Debug for MessageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCache")
            .field("known", &self.known_len())
            .field("peers", &self.tracked_peers())
            .field("message_capacity", &self.message_capacity)
            .finish()
    }
}
