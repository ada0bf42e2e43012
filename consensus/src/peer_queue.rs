// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Per-peer send queues
//!
//! Every peer handle gets one background task fed by an unbounded queue,
//! so a gossip call only enqueues and returns. Messages to the same peer
//! are sent in enqueue order. A worker is replaced when the transport hands
//! out a different handle for the same address or when the old worker
//! has exited.

use bft_types::Address;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broadcaster::{OutboundMessage, Peer};

struct Worker {
    peer: Arc<dyn Peer>,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

#[derive(Default)]
pub struct PeerQueues {
    workers: DashMap<Address, Worker>,
}

impl PeerQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` for `peer`. Returns `false` if it could not be
    /// queued because no tokio runtime is available.
    pub fn enqueue(&self, peer: &Arc<dyn Peer>, message: OutboundMessage) -> bool {
        let address = peer.address();
        match self.workers.entry(address) {
            Entry::Occupied(mut entry) => {
                let message = if same_peer(&entry.get().peer, peer) {
                    match entry.get().tx.send(message) {
                        Ok(()) => return true,
                        Err(mpsc::error::SendError(message)) => message,
                    }
                } else {
                    message
                };
                match spawn_worker(peer, message) {
                    Some(worker) => {
                        entry.insert(worker);
                        true
                    }
                    None => {
                        entry.remove();
                        false
                    }
                }
            }
            Entry::Vacant(entry) => match spawn_worker(peer, message) {
                Some(worker) => {
                    entry.insert(worker);
                    true
                }
                None => false,
            },
        }
    }

    /// Drop every queue. Workers exit once their pending messages are sent.
    pub fn close(&self) {
        self.workers.clear();
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for PeerQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerQueues").field("workers", &self.len()).finish()
    }
}

fn same_peer(a: &Arc<dyn Peer>, b: &Arc<dyn Peer>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn spawn_worker(peer: &Arc<dyn Peer>, first: OutboundMessage) -> Option<Worker> {
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!(peer = %peer.address(), "No runtime for peer worker, dropping message");
            return None;
        }
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Cannot fail: the receiver is still held here
    let _ = tx.send(first);

    let target = Arc::clone(peer);
    handle.spawn(async move {
        let address = target.address();
        while let Some(message) = rx.recv().await {
            if let Err(e) = target.send(message).await {
                debug!(peer = %address, error = %e, "Consensus send failed");
            }
        }
        debug!(peer = %address, "Peer worker stopped");
    });

    Some(Worker { peer: Arc::clone(peer), tx })
}
