// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Consensus backend
//!
//! The `Backend` sits between a round core and the rest of the node. It
//! answers validator-set queries from replayed snapshots, deduplicates and
//! fans out consensus messages, signs on behalf of the node, and routes
//! committed blocks either back to the local sealer or to import.
//!
//! ## Commit routing
//!
//! ```text
//!             commit(block)
//!                  │
//!        hash == pending proposal?
//!          ┌───────┴────────┐
//!         yes               no
//!          ▼                ▼
//!   SealHandle::wait   Transport::enqueue("istanbul")
//! ```
//!
//! ## Locks
//!
//! - `lifecycle` (Mutex): the running core. Held for the whole of start,
//!   stop and switchover, and never taken by selector queries.
//! - `engine` (RwLock): running and forced-current flags. Only held for a
//!   load or a store, never across a call into a core, so a core may call
//!   back into the backend from `start`.
//! - `candidates` (RwLock): pending membership votes.
//! - `seal` (Mutex, inside `SealSlot`): pending proposal and its slot.
//!
//! Caches carry their own locks. No lock is held across a peer send.

use bft_keys::{recover_address, NodeKey};
use bft_types::{keccak256, Address, Block, Hash, Header, Proposal};
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::broadcaster::{is_consensus_code, outbound_code, OutboundMessage, Transport};
use crate::checkpoint::{Checkpoint, CheckpointSink, NoopCheckpoints, PrometheusCheckpoints};
use crate::config::BackendConfig;
use crate::engine::{select_mode, EngineMode, EnginePair, RoundCore, RoundEngine, VerifyOutcome};
use crate::error::{BackendError, BackendResult};
use crate::events::{BackendEvent, EventMux, EventReceiver};
use crate::message_cache::MessageCache;
use crate::peer_queue::PeerQueues;
use crate::seal::{SealHandle, SealSlot};
use crate::snapshot::{MemorySnapshotStore, Snapshot, SnapshotStore};
use crate::snapshot_cache::{CacheStatsSnapshot, SnapshotCache};
use crate::traits::{BackendHandle, ChainReader, ConsensusBackend};
use crate::validator::{ProposerPolicy, ValidatorOrdering, ValidatorSet};

/// Import source name for blocks committed by this backend
pub const IMPORT_SOURCE: &str = "istanbul";

/// Flags read by selector queries; published in one store
#[derive(Debug, Default, Clone, Copy)]
struct EngineFlags {
    running: bool,
    current_forced: bool,
}

/// Engine state as seen under one read of the engine lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// Engine selected for the current chain head
    pub mode: EngineMode,
    pub running: bool,
    pub current_forced: bool,
}

/// Builder for [`Backend`]
pub struct BackendBuilder {
    config: BackendConfig,
    key: NodeKey,
    chain: Arc<dyn ChainReader>,
    engines: EnginePair,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn SnapshotStore>>,
    checkpoints: Option<Arc<dyn CheckpointSink>>,
    registry: Option<Registry>,
}

impl BackendBuilder {
    pub fn new(config: BackendConfig, key: NodeKey, chain: Arc<dyn ChainReader>, engines: EnginePair) -> Self {
        Self {
            config,
            key,
            chain,
            engines,
            transport: None,
            store: None,
            checkpoints: None,
            registry: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Snapshot persistence; in-memory if unset
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Export checkpoint counters on `registry`, logging each one if
    /// `emit_checkpoints` is set. Ignored when a sink is given explicitly.
    pub fn metrics_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> BackendResult<Arc<Backend>> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let policy = ProposerPolicy::new(config.proposer_policy);
        if config.fork_height == Some(0) {
            policy.use_ordering(ValidatorOrdering::ByBytes);
        }
        let address = self.key.address();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySnapshotStore::new()));
        let checkpoints: Arc<dyn CheckpointSink> = match (self.checkpoints, self.registry) {
            (Some(sink), _) => sink,
            (None, Some(registry)) => Arc::new(
                PrometheusCheckpoints::new(&registry, config.emit_checkpoints)
                    .map_err(|e| BackendError::Metrics(e.to_string()))?,
            ),
            (None, None) => Arc::new(NoopCheckpoints),
        };

        info!(
            address = %address,
            fork_height = ?config.fork_height,
            policy = ?config.proposer_policy,
            "Creating consensus backend"
        );

        Ok(Arc::new_cyclic(|me| Backend {
            me: me.clone(),
            address,
            key: self.key,
            snapshots: SnapshotCache::new(config.snapshot_cache_size),
            messages: MessageCache::new(config.peer_cache_size, config.message_cache_size),
            config,
            engines: self.engines,
            chain: self.chain,
            transport: self.transport,
            store,
            checkpoints,
            policy,
            peer_queues: PeerQueues::new(),
            events: EventMux::new(),
            seal: SealSlot::new(),
            lifecycle: Mutex::new(None),
            engine: RwLock::new(EngineFlags::default()),
            candidates: RwLock::new(HashMap::new()),
        }))
    }
}

/// The consensus backend
pub struct Backend {
    me: Weak<Backend>,
    config: Arc<BackendConfig>,
    key: NodeKey,
    address: Address,
    engines: EnginePair,
    chain: Arc<dyn ChainReader>,
    transport: Option<Arc<dyn Transport>>,
    store: Arc<dyn SnapshotStore>,
    checkpoints: Arc<dyn CheckpointSink>,
    policy: Arc<ProposerPolicy>,
    snapshots: SnapshotCache,
    messages: MessageCache,
    peer_queues: PeerQueues,
    events: EventMux,
    seal: SealSlot,
    lifecycle: Mutex<Option<Box<dyn RoundCore>>>,
    engine: RwLock<EngineFlags>,
    candidates: RwLock<HashMap<Address, bool>>,
}

impl Backend {
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<ProposerPolicy> {
        &self.policy
    }

    fn handle(&self) -> BackendHandle {
        self.me.clone()
    }

    // ========== Validator sets ==========

    /// Validator snapshot after the block `(number, hash)`.
    pub fn snapshot(&self, number: u64, hash: Hash) -> BackendResult<Snapshot> {
        let mut headers: Vec<Header> = Vec::new();
        let (mut number, mut hash) = (number, hash);

        let base = loop {
            if let Some(snapshot) = self.snapshots.get(&hash) {
                break snapshot;
            }

            if number % self.config.checkpoint_interval == 0 {
                match Snapshot::load(self.config.epoch, self.store.as_ref(), &hash, &self.policy) {
                    Ok(Some(snapshot)) => {
                        debug!(number, hash = %hash, "Loaded snapshot from store");
                        break snapshot;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(number, hash = %hash, error = %e, "Failed to load snapshot"),
                }
            }

            if number == 0 {
                let genesis = self
                    .chain
                    .header_by_number(0)
                    .ok_or(BackendError::UnknownAncestor)?;
                let validators = ValidatorSet::new(genesis.extra.validators.clone(), &self.policy);
                let snapshot = Snapshot::new(self.config.epoch, 0, genesis.hash(), validators);
                snapshot.store(self.store.as_ref())?;
                info!(
                    hash = %snapshot.hash,
                    validators = snapshot.validators.size(),
                    "Stored genesis snapshot"
                );
                break snapshot;
            }

            let header = self
                .chain
                .header(&hash, number)
                .ok_or(BackendError::UnknownAncestor)?;
            hash = header.parent_hash;
            number -= 1;
            headers.push(header);
        };

        headers.reverse();
        let snapshot = base.apply(&headers, |header| self.author(header))?;
        self.snapshots.put(snapshot.clone());

        if snapshot.number % self.config.checkpoint_interval == 0 && !headers.is_empty() {
            snapshot.store(self.store.as_ref())?;
            debug!(number = snapshot.number, hash = %snapshot.hash, "Stored snapshot to disk");
        }
        Ok(snapshot)
    }

    /// Validator set after `(number, hash)`; empty if it cannot be computed.
    pub fn validators_for(&self, number: u64, hash: Hash) -> ValidatorSet {
        match self.snapshot(number, hash) {
            Ok(snapshot) => snapshot.validators,
            Err(e) => {
                debug!(number, hash = %hash, error = %e, "No snapshot, using empty validator set");
                ValidatorSet::empty(&self.policy)
            }
        }
    }

    pub fn snapshot_cache_stats(&self) -> CacheStatsSnapshot {
        self.snapshots.stats_snapshot()
    }

    /// Recover the proposer of `header` with the engine for its height.
    pub fn author(&self, header: &Header) -> BackendResult<Address> {
        Ok(self.engine_for_header(Some(header)).author(header)?)
    }

    // ========== Inbound messages ==========

    /// Handle a message received from `peer`.
    ///
    /// Returns `Ok(false)` if `code` is not a consensus message for the
    /// active protocol. A consensus message is delivered to the core at
    /// most once however many peers relay it.
    pub fn handle_message(&self, peer: Address, code: u64, payload: Vec<u8>) -> BackendResult<bool> {
        let flags = *self.engine.read();
        let mode = self.mode_with(flags, None);
        let running = flags.running;
        if !is_consensus_code(mode, code) {
            return Ok(false);
        }
        if !running {
            return Err(BackendError::EngineStopped);
        }

        let hash = keccak256(&payload);
        self.messages.mark_seen_peer(peer, hash);
        if !self.messages.check_and_mark_seen(hash) {
            return Ok(true);
        }
        self.events.post(BackendEvent::Message { code, payload });
        Ok(true)
    }

    /// Tell the running core a new head was imported.
    pub fn handle_new_chain_head(&self) -> BackendResult<()> {
        if !self.engine.read().running {
            return Err(BackendError::EngineStopped);
        }
        self.events.post(BackendEvent::FinalCommitted);
        Ok(())
    }

    // ========== Sealing ==========

    /// Register a locally proposed block and get a handle that resolves
    /// when consensus commits it.
    pub fn prepare_seal(&self, block_hash: Hash) -> SealHandle {
        debug!(hash = %block_hash, "Waiting for proposal to commit");
        self.seal.prepare(block_hash)
    }

    pub fn calc_difficulty(&self, parent: &Header) -> u64 {
        self.engine_for_header(None).calc_difficulty(parent)
    }

    fn import(&self, block: Block) {
        match &self.transport {
            Some(transport) => {
                self.checkpoints.record(Checkpoint::BlockInserted { number: block.number() });
                transport.enqueue(IMPORT_SOURCE, block);
            }
            None => warn!(number = block.number(), "No transport, dropping committed block"),
        }
    }

    // ========== Engine selection ==========

    fn mode_with(&self, flags: EngineFlags, header: Option<&Header>) -> EngineMode {
        let number = match header {
            Some(header) => Some(header.number),
            None => self.chain.current_header().map(|h| h.number),
        };
        select_mode(self.config.fork_height, flags.current_forced, number)
    }

    /// Engine mode for `header`, or for the chain head if `None`.
    pub fn engine_mode(&self, header: Option<&Header>) -> EngineMode {
        let flags = *self.engine.read();
        self.mode_with(flags, header)
    }

    pub fn engine_for_header(&self, header: Option<&Header>) -> Arc<dyn RoundEngine> {
        Arc::clone(self.engines.get(self.engine_mode(header)))
    }

    pub fn engine_status(&self) -> EngineStatus {
        let flags = *self.engine.read();
        EngineStatus {
            mode: self.mode_with(flags, None),
            running: flags.running,
            current_forced: flags.current_forced,
        }
    }

    fn set_running(&self, running: bool) {
        self.engine.write().running = running;
    }

    /// Switch validator ordering to raw bytes. Cached snapshots built under
    /// the old comparator are dropped so a cache hit and a recompute agree.
    fn use_byte_ordering(&self) {
        self.policy.use_ordering(ValidatorOrdering::ByBytes);
        self.snapshots.clear();
    }

    /// Start a round core for the engine selected at the chain head.
    pub fn start(&self) -> BackendResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.engine.read().running {
            return Err(BackendError::EngineStarted);
        }

        let mode = self.engine_mode(None);
        if mode == EngineMode::Current {
            self.use_byte_ordering();
        }
        self.seal.clear();

        let core = self.engines.get(mode).new_core(self.handle());
        core.start()?;
        *lifecycle = Some(core);
        self.set_running(true);
        info!(%mode, "Consensus engine started");
        Ok(())
    }

    pub fn stop(&self) -> BackendResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !self.engine.read().running {
            return Err(BackendError::EngineStopped);
        }
        if let Some(core) = lifecycle.as_ref() {
            core.stop()?;
        }
        *lifecycle = None;
        self.set_running(false);
        self.peer_queues.close();
        info!("Consensus engine stopped");
        Ok(())
    }

    /// Replace the running core with a current-protocol core.
    ///
    /// The lifecycle lock is held throughout. Selector queries keep seeing
    /// the legacy engine until the new core has started, then see the
    /// current engine and a running backend together. On failure no core
    /// is left running and the node has to be restarted.
    pub fn start_switchover(&self) -> BackendResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        info!("Switching to current consensus protocol");

        if let Some(core) = lifecycle.take() {
            self.set_running(false);
            if let Err(e) = core.stop() {
                error!(error = %e, "Failed to stop legacy core during switchover");
                return Err(BackendError::EngineSwitchover(e.to_string()));
            }
        }
        self.set_running(false);

        let core = self.engines.get(EngineMode::Current).new_core(self.handle());
        self.use_byte_ordering();
        if let Err(e) = core.start() {
            error!(error = %e, "Failed to start current core during switchover");
            return Err(BackendError::EngineSwitchover(e.to_string()));
        }

        *lifecycle = Some(core);
        *self.engine.write() = EngineFlags {
            running: true,
            current_forced: true,
        };
        info!("Switched to current consensus protocol");
        Ok(())
    }

    // ========== Candidates ==========

    /// Vote to add (`true`) or remove (`false`) `address` in future proposals.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.candidates.write().insert(address, authorize);
    }

    pub fn discard(&self, address: &Address) {
        self.candidates.write().remove(address);
    }

    pub fn candidates(&self) -> HashMap<Address, bool> {
        self.candidates.read().clone()
    }
}

impl ConsensusBackend for Backend {
    fn address(&self) -> Address {
        self.address
    }

    fn validators(&self, proposal: &dyn Proposal) -> ValidatorSet {
        self.validators_for(proposal.number(), proposal.hash())
    }

    fn parent_validators(&self, proposal: &dyn Proposal) -> ValidatorSet {
        match Block::from_proposal(proposal) {
            Some(block) if block.number() > 0 => self.validators_for(block.number() - 1, block.parent_hash()),
            _ => ValidatorSet::empty(&self.policy),
        }
    }

    fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn broadcast(&self, validators: &ValidatorSet, code: u64, payload: Vec<u8>) {
        self.gossip(validators, code, payload.clone());
        // Our own messages go through the same path as a peer's
        self.events.post(BackendEvent::Message { code, payload });
    }

    fn gossip(&self, validators: &ValidatorSet, code: u64, payload: Vec<u8>) {
        let hash = keccak256(&payload);
        self.messages.mark_seen(hash);

        let targets: HashSet<Address> = validators
            .list()
            .into_iter()
            .filter(|address| *address != self.address)
            .collect();
        let transport = match &self.transport {
            Some(transport) if !targets.is_empty() => transport,
            _ => return,
        };

        let mode = self.engine_mode(None);
        let wire_code = outbound_code(mode, code);
        for (address, peer) in transport.find_peers(&targets) {
            if !self.messages.check_and_mark_peer(address, hash) {
                continue;
            }
            let message = OutboundMessage {
                mode,
                code: wire_code,
                payload: payload.clone(),
            };
            if !self.peer_queues.enqueue(&peer, message) {
                // Not sent, so the peer does not have it yet
                self.messages.forget_peer(&address, &hash);
            }
        }
    }

    fn verify(&self, proposal: &dyn Proposal) -> BackendResult<VerifyOutcome> {
        let block = Block::from_proposal(proposal).ok_or_else(|| {
            error!(?proposal, "Invalid proposal");
            BackendError::InvalidProposal
        })?;

        let hash = block.hash();
        if self.chain.has_bad_block(&hash) {
            return Err(BackendError::BlacklistedBlock(hash));
        }

        let parent_number = block
            .number()
            .checked_sub(1)
            .ok_or(BackendError::UnknownAncestor)?;
        let snapshot = self.snapshot(parent_number, block.parent_hash())?;

        let engine = self.engine_for_header(Some(block.header()));
        let outcome = engine.verify_block_proposal(self.chain.as_ref(), block, &snapshot.validators)?;
        if outcome == VerifyOutcome::Accepted {
            self.checkpoints
                .record(Checkpoint::BlockVotingStarted { number: block.number() });
        }
        Ok(outcome)
    }

    fn commit(&self, proposal: &dyn Proposal, seals: Vec<Vec<u8>>, round: u32) -> BackendResult<()> {
        let block = Block::from_proposal(proposal).ok_or_else(|| {
            error!(?proposal, "Invalid proposal");
            BackendError::InvalidProposal
        })?;

        let mut header = block.header().clone();
        self.engine_for_header(Some(&header))
            .commit_header(&mut header, &seals, round)?;
        let block = block.with_seal(header);
        self.policy.clear_registry();

        let (number, hash) = (block.number(), block.hash());
        info!(number, hash = %hash, round, "Committed");

        match self.seal.take_if_pending(&hash) {
            Some(tx) => match tx.send(block) {
                Ok(()) => {
                    self.checkpoints.record(Checkpoint::BlockCreated { number });
                }
                Err(block) => {
                    debug!(number, hash = %hash, "Sealer gone, importing committed block");
                    self.import(block);
                }
            },
            None => self.import(block),
        }
        Ok(())
    }

    fn sign(&self, data: &[u8]) -> BackendResult<Vec<u8>> {
        Ok(self.key.sign(data)?)
    }

    fn sign_without_hashing(&self, digest: &[u8]) -> BackendResult<Vec<u8>> {
        Ok(self.key.sign_without_hashing(digest)?)
    }

    fn check_signature(&self, data: &[u8], address: &Address, signature: &[u8]) -> BackendResult<()> {
        let signer = recover_address(data, signature)?;
        if signer != *address {
            return Err(BackendError::InvalidSignature);
        }
        Ok(())
    }

    fn last_proposal(&self) -> (Option<Block>, Address) {
        let block = match self.chain.current_block() {
            Some(block) => block,
            None => return (None, Address::ZERO),
        };
        if block.number() == 0 {
            return (Some(block), Address::ZERO);
        }
        match self.author(block.header()) {
            Ok(proposer) => (Some(block), proposer),
            Err(e) => {
                error!(number = block.number(), error = %e, "Failed to recover last proposer");
                (None, Address::ZERO)
            }
        }
    }

    fn has_proposal(&self, hash: &Hash, number: u64) -> bool {
        self.chain.header(hash, number).is_some()
    }

    fn get_proposer(&self, number: u64) -> Address {
        self.chain
            .header_by_number(number)
            .and_then(|header| self.author(&header).ok())
            .unwrap_or(Address::ZERO)
    }

    fn has_bad_proposal(&self, hash: &Hash) -> bool {
        self.chain.has_bad_block(hash)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("status", &self.engine_status())
            .field("snapshots", &self.snapshots)
            .field("messages", &self.messages)
            .finish()
    }
}
