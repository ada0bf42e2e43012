// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! In-memory collaborators
//!
//! A chain held in memory, a round engine that checks proposer seals only,
//! and a round core that records its lifecycle. Used by tests and by
//! single-node setups.

use bft_keys::{recover_address_from_digest, KeyError, NodeKey};
use bft_types::{Address, Block, Hash, Header};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::engine::{EngineError, EngineMode, RoundCore, RoundEngine, VerifyOutcome};
use crate::events::EventReceiver;
use crate::traits::{BackendHandle, ChainReader};
use crate::validator::ValidatorSet;

/// Sign `header` as its proposer.
pub fn seal_header(key: &NodeKey, header: &mut Header) -> Result<(), KeyError> {
    header.extra.proposer_seal = key.sign_without_hashing(header.seal_hash().as_bytes())?;
    Ok(())
}

#[derive(Default)]
struct ChainInner {
    blocks: HashMap<Hash, Block>,
    canonical: Vec<Hash>,
    bad: HashSet<Hash>,
}

/// A chain kept in memory
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    pub fn new(genesis: Block) -> Arc<Self> {
        let chain = Self::default();
        chain.insert(genesis);
        Arc::new(chain)
    }

    /// Insert `block` as the canonical block at its height, dropping
    /// anything above it.
    pub fn insert(&self, block: Block) {
        let mut inner = self.inner.write();
        let number = block.number() as usize;
        let hash = block.hash();
        inner.canonical.truncate(number);
        if inner.canonical.len() == number {
            inner.canonical.push(hash);
        }
        inner.blocks.insert(hash, block);
    }

    pub fn mark_bad(&self, hash: Hash) {
        self.inner.write().bad.insert(hash);
    }

    pub fn height(&self) -> u64 {
        (self.inner.read().canonical.len() as u64).saturating_sub(1)
    }
}

impl ChainReader for MemoryChain {
    fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        self.inner.read().blocks.get(hash).map(|b| b.header().clone())
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(number as usize)?;
        inner.blocks.get(hash).map(|b| b.header().clone())
    }

    fn current_header(&self) -> Option<Header> {
        self.current_block().map(|b| b.header().clone())
    }

    fn current_block(&self) -> Option<Block> {
        let inner = self.inner.read();
        let hash = inner.canonical.last()?;
        inner.blocks.get(hash).cloned()
    }

    fn has_bad_block(&self, hash: &Hash) -> bool {
        self.inner.read().bad.contains(hash)
    }
}

/// What a core learned from the backend while starting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub head: u64,
    pub last_proposer: Address,
    pub parent_validators: usize,
}

/// Lifecycle record of one core built by a [`MockEngine`]
#[derive(Default)]
pub struct CoreRecord {
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    events: Mutex<Option<EventReceiver>>,
    bootstrap: Mutex<Option<Bootstrap>>,
}

impl CoreRecord {
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// The event stream the core subscribed to on start
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().take()
    }

    /// Chain head and parent validators seen when the core started
    pub fn bootstrap(&self) -> Option<Bootstrap> {
        self.bootstrap.lock().clone()
    }
}

/// Round engine that only checks proposer seals
#[derive(Debug)]
pub struct MockEngine {
    mode: EngineMode,
    address: Address,
    fail_start: AtomicBool,
    fail_stop: Arc<AtomicBool>,
    cores_built: AtomicUsize,
    cores: Mutex<Vec<Arc<CoreRecord>>>,
}

impl MockEngine {
    pub fn new(mode: EngineMode, address: Address) -> Arc<Self> {
        Arc::new(Self {
            mode,
            address,
            fail_start: AtomicBool::new(false),
            fail_stop: Arc::new(AtomicBool::new(false)),
            cores_built: AtomicUsize::new(0),
            cores: Mutex::new(Vec::new()),
        })
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Make cores built from now on fail to start.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make every core of this engine fail to stop.
    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn cores_built(&self) -> usize {
        self.cores_built.load(Ordering::SeqCst)
    }

    pub fn cores(&self) -> Vec<Arc<CoreRecord>> {
        self.cores.lock().clone()
    }
}

impl std::fmt::Debug for CoreRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRecord")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl RoundEngine for MockEngine {
    fn address(&self) -> Address {
        self.address
    }

    fn calc_difficulty(&self, _parent: &Header) -> u64 {
        1
    }

    fn author(&self, header: &Header) -> Result<Address, EngineError> {
        recover_address_from_digest(header.seal_hash().as_bytes(), &header.extra.proposer_seal)
            .map_err(|e| EngineError::InvalidSeal(e.to_string()))
    }

    fn verify_block_proposal(
        &self,
        _chain: &dyn ChainReader,
        block: &Block,
        validators: &ValidatorSet,
    ) -> Result<VerifyOutcome, EngineError> {
        let signer = self.author(block.header())?;
        if !validators.contains(&signer) {
            return Err(EngineError::InvalidSeal(format!("{} is not a validator", signer)));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if block.header().timestamp > now {
            return Ok(VerifyOutcome::Deferred {
                retry_after: Duration::from_secs(block.header().timestamp - now),
            });
        }
        Ok(VerifyOutcome::Accepted)
    }

    fn commit_header(&self, header: &mut Header, seals: &[Vec<u8>], round: u32) -> Result<(), EngineError> {
        if seals.is_empty() {
            return Err(EngineError::InvalidCommittedSeals);
        }
        header.extra.committed_seals = seals.to_vec();
        header.extra.round = round;
        Ok(())
    }

    fn new_core(&self, backend: BackendHandle) -> Box<dyn RoundCore> {
        self.cores_built.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(CoreRecord::default());
        self.cores.lock().push(Arc::clone(&record));
        Box::new(MockCore {
            backend,
            record,
            fail_start: self.fail_start.load(Ordering::SeqCst),
            fail_stop: Arc::clone(&self.fail_stop),
        })
    }
}

/// Round core that records start and stop
///
/// Like a real core it seeds its first round on start from the last
/// proposal and the validators that sealed it.
pub struct MockCore {
    backend: BackendHandle,
    record: Arc<CoreRecord>,
    fail_start: bool,
    fail_stop: Arc<AtomicBool>,
}

impl RoundCore for MockCore {
    fn start(&self) -> Result<(), EngineError> {
        if self.fail_start {
            return Err(EngineError::Core("start failed".to_string()));
        }
        if let Some(backend) = self.backend.upgrade() {
            *self.record.events.lock() = Some(backend.subscribe_events());
            if let (Some(head), last_proposer) = backend.last_proposal() {
                let validators = backend.parent_validators(&head);
                *self.record.bootstrap.lock() = Some(Bootstrap {
                    head: head.number(),
                    last_proposer,
                    parent_validators: validators.size(),
                });
            }
        }
        self.record.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineError::Core("stop failed".to_string()));
        }
        self.record.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
