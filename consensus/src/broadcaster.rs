// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Peer transport abstraction
//!
//! The backend never talks to sockets. It asks a `Transport` for live peer
//! handles and hands each one an `OutboundMessage`; the transport also
//! accepts committed blocks for import.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Backend                     │
//! │   gossip() ──▶ PeerQueues ──▶ Peer::send    │
//! │   commit() ──▶ Transport::enqueue           │
//! └──────────────────────┬──────────────────────┘
//!                        │ implements
//!          ┌─────────────┴─────────────┐
//!          │                           │
//!   network transport             MockTransport
//!   (production)                  (testing)
//! ```

use bft_types::{Address, Block};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineMode;

/// Canonical consensus message code understood by every peer
pub const ISTANBUL_MSG: u64 = 0x11;
pub const PREPREPARE_MSG: u64 = 0x12;
pub const PREPARE_MSG: u64 = 0x13;
pub const COMMIT_MSG: u64 = 0x14;
pub const ROUND_CHANGE_MSG: u64 = 0x15;

/// Message codes defined by the current protocol
pub const CURRENT_MESSAGE_CODES: [u64; 4] = [PREPREPARE_MSG, PREPARE_MSG, COMMIT_MSG, ROUND_CHANGE_MSG];

pub fn is_current_code(code: u64) -> bool {
    CURRENT_MESSAGE_CODES.contains(&code)
}

/// Code to put on the wire for `code` under `mode`.
///
/// The legacy protocol wraps everything in `ISTANBUL_MSG`. The current one
/// keeps its own codes and normalizes anything else.
pub fn outbound_code(mode: EngineMode, code: u64) -> u64 {
    match mode {
        EngineMode::Current if is_current_code(code) => code,
        _ => ISTANBUL_MSG,
    }
}

/// Whether an inbound `code` belongs to consensus under `mode`
pub fn is_consensus_code(mode: EngineMode, code: u64) -> bool {
    code == ISTANBUL_MSG || (mode == EngineMode::Current && is_current_code(code))
}

/// Error type for peer operations
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Network error: {0}")]
    NetworkError(String),
}

/// A message on its way to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Envelope the peer should use
    pub mode: EngineMode,
    pub code: u64,
    pub payload: Vec<u8>,
}

/// Handle to a connected peer
#[async_trait::async_trait]
pub trait Peer: Send + Sync + Debug {
    fn address(&self) -> Address;

    async fn send(&self, message: OutboundMessage) -> Result<(), BroadcastError>;
}

/// Peer discovery and block import
pub trait Transport: Send + Sync + Debug {
    /// Live handles for whichever of `targets` are connected
    fn find_peers(&self, targets: &HashSet<Address>) -> HashMap<Address, Arc<dyn Peer>>;

    /// Hand a committed block to the importer. `source` names the consensus
    /// engine delivering it.
    fn enqueue(&self, source: &str, block: Block);
}

/// A peer that records everything sent to it
#[derive(Debug)]
pub struct MockPeer {
    address: Address,
    /// Recorded sends, in arrival order
    pub sent: Mutex<Vec<OutboundMessage>>,
    /// Whether to simulate failures
    pub simulate_failure: AtomicBool,
}

impl MockPeer {
    pub fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            sent: Mutex::new(Vec::new()),
            simulate_failure: AtomicBool::new(false),
        })
    }

    pub fn set_simulate_failure(&self, fail: bool) {
        self.simulate_failure.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Poll until at least `count` messages arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sent_count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait::async_trait]
impl Peer for MockPeer {
    fn address(&self) -> Address {
        self.address
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), BroadcastError> {
        if self.simulate_failure.load(Ordering::SeqCst) {
            return Err(BroadcastError::NetworkError("Simulated failure".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// A transport over a fixed set of mock peers
#[derive(Debug, Default)]
pub struct MockTransport {
    peers: Mutex<HashMap<Address, Arc<MockPeer>>>,
    /// Blocks handed to import with their source
    pub imported: Mutex<Vec<(String, Block)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a new mock peer and return it.
    pub fn connect(&self, address: Address) -> Arc<MockPeer> {
        let peer = MockPeer::new(address);
        self.peers.lock().insert(address, Arc::clone(&peer));
        peer
    }

    pub fn disconnect(&self, address: &Address) {
        self.peers.lock().remove(address);
    }

    pub fn imported(&self) -> Vec<(String, Block)> {
        self.imported.lock().clone()
    }
}

impl Transport for MockTransport {
    fn find_peers(&self, targets: &HashSet<Address>) -> HashMap<Address, Arc<dyn Peer>> {
        self.peers
            .lock()
            .iter()
            .filter(|(address, _)| targets.contains(address))
            .map(|(address, peer)| (*address, Arc::clone(peer) as Arc<dyn Peer>))
            .collect()
    }

    fn enqueue(&self, source: &str, block: Block) {
        self.imported.lock().push((source.to_string(), block));
    }
}
