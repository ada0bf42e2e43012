// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! BFT Consensus Backend
//!
//! Binds pluggable round engines (a legacy protocol and its successor) to
//! the chain, the peer transport and the node identity. It includes:
//! - Validator snapshots replayed from header votes, cached and persisted
//! - Gossip with per-node and per-peer deduplication
//! - Proposal verification and commit routing to the sealer or importer
//! - Engine selection by fork height and a one-way switchover
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Backend                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │ SnapshotCache│  │ MessageCache │  │   SealSlot   │       │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┘       │
//! │         │                 │                                 │
//! │  ┌──────▼───────┐  ┌──────▼───────┐  ┌──────────────┐       │
//! │  │ SnapshotStore│  │  PeerQueues  │  │   EventMux   │──▶ core
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! │  ┌──────────────────────────────────────────────────┐       │
//! │  │   EnginePair (legacy | current) + RoundCore      │       │
//! │  └──────────────────────────────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod broadcaster;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod message_cache;
pub mod mock;
pub mod peer_queue;
pub mod seal;
pub mod snapshot;
pub mod snapshot_cache;
pub mod traits;
pub mod validator;

// Re-export main types
pub use backend::{Backend, BackendBuilder, EngineStatus, IMPORT_SOURCE};
pub use broadcaster::{
    is_consensus_code, outbound_code, BroadcastError, MockPeer, MockTransport, OutboundMessage,
    Peer, Transport, COMMIT_MSG, ISTANBUL_MSG, PREPARE_MSG, PREPREPARE_MSG, ROUND_CHANGE_MSG,
};
pub use checkpoint::{Checkpoint, CheckpointSink, NoopCheckpoints, PrometheusCheckpoints};
pub use config::{BackendConfig, PolicyKind};
pub use engine::{
    select_mode, EngineError, EngineMode, EnginePair, RoundCore, RoundEngine, VerifyOutcome,
};
pub use error::{BackendError, BackendResult};
pub use events::{BackendEvent, EventMux, EventReceiver};
pub use message_cache::MessageCache;
pub use peer_queue::PeerQueues;
pub use seal::{SealError, SealHandle, SealSlot};
pub use snapshot::{MemorySnapshotStore, Snapshot, SnapshotRecord, SnapshotStore, Tally, Vote};
pub use snapshot_cache::{CacheStatsSnapshot, SnapshotCache};
pub use traits::{BackendHandle, ChainReader, ConsensusBackend};
pub use validator::{ProposerPolicy, ValidatorOrdering, ValidatorSet};
