// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Local seal rendezvous
//!
//! When this node proposes a block the sealer registers the block hash and
//! waits. If consensus later commits a block with that hash, the committed
//! block is handed straight back to the sealer instead of going through
//! import. At most one proposal is pending at a time; preparing a new one
//! supersedes the previous waiter.

use bft_types::{Block, Hash};
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SealError {
    #[error("timed out waiting for commit")]
    TimedOut,

    /// Another proposal was prepared before this one committed
    #[error("superseded by a newer proposal")]
    Superseded,
}

#[derive(Default)]
struct SealState {
    proposed: Option<Hash>,
    commit_tx: Option<oneshot::Sender<Block>>,
}

/// The pending local proposal and its one-shot delivery slot
#[derive(Default)]
pub struct SealSlot {
    state: Mutex<SealState>,
}

impl SealSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hash` as the pending proposal.
    pub fn prepare(&self, hash: Hash) -> SealHandle {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.proposed = Some(hash);
        // Dropping the old sender wakes its waiter with `Superseded`
        state.commit_tx = Some(tx);
        SealHandle { hash, rx }
    }

    /// Claim the delivery slot if `hash` is the pending proposal. The slot
    /// can be claimed once.
    pub fn take_if_pending(&self, hash: &Hash) -> Option<oneshot::Sender<Block>> {
        let mut state = self.state.lock();
        if state.proposed.as_ref() != Some(hash) {
            return None;
        }
        state.proposed = None;
        state.commit_tx.take()
    }

    pub fn pending(&self) -> Option<Hash> {
        self.state.lock().proposed
    }

    /// Forget the pending proposal; its waiter sees `Superseded`.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.proposed = None;
        state.commit_tx = None;
    }
}

impl std::fmt::Debug for SealSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealSlot").field("pending", &self.pending()).finish()
    }
}

/// Waiter side of a prepared seal
#[derive(Debug)]
pub struct SealHandle {
    hash: Hash,
    rx: oneshot::Receiver<Block>,
}

impl SealHandle {
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Wait for the committed block, at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Block, SealError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(_)) => Err(SealError::Superseded),
            Err(_) => Err(SealError::TimedOut),
        }
    }
}
