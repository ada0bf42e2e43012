// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Backend Integration Tests
//!
//! Drives a `Backend` wired to an in-memory chain, mock round engines and
//! a mock transport through the flows a round core exercises:
//!
//! - Snapshot replay, caching and persistence
//! - Inbound dedup and outbound gossip
//! - Verify and commit, including the local seal race
//! - Engine lifecycle and the switchover to the current protocol

use bft_backend::mock::{seal_header, Bootstrap, MemoryChain, MockEngine};
use bft_backend::{
    Backend, BackendBuilder, BackendConfig, BackendError, BackendEvent, ChainReader,
    ConsensusBackend, EngineError, EngineMode, EnginePair, MemorySnapshotStore, MockTransport,
    PrometheusCheckpoints, SealError, ValidatorOrdering, VerifyOutcome,
    COMMIT_MSG, IMPORT_SOURCE, ISTANBUL_MSG, PREPARE_MSG,
};
use bft_keys::NodeKey;
use bft_types::{keccak256, Address, BftExtra, Block, Hash, Header, Proposal, ValidatorVote};
use prometheus::Registry;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Initialize tracing for tests
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn key(i: u8) -> NodeKey {
    NodeKey::from_bytes(&[i; 32]).unwrap()
}

fn addr(i: u8) -> Address {
    key(i).address()
}

fn genesis(validators: u8) -> Block {
    let header = Header {
        extra: BftExtra {
            validators: (1..=validators).map(addr).collect(),
            ..Default::default()
        },
        ..Default::default()
    };
    Block::new(header, Vec::new())
}

/// Next block on top of `parent`, sealed by `signer`
fn make_block(parent: &Header, signer: &NodeKey, vote: Option<ValidatorVote>) -> Block {
    let mut header = Header {
        parent_hash: parent.hash(),
        coinbase: signer.address(),
        number: parent.number + 1,
        timestamp: parent.number + 1,
        difficulty: 1,
        extra: BftExtra {
            vote,
            ..Default::default()
        },
    };
    seal_header(signer, &mut header).unwrap();
    Block::new(header, vec![vec![0xab]])
}

fn extend(chain: &MemoryChain, signer: &NodeKey, vote: Option<ValidatorVote>) -> Block {
    let parent = chain.current_header().unwrap();
    let block = make_block(&parent, signer, vote);
    chain.insert(block.clone());
    block
}

fn seals() -> Vec<Vec<u8>> {
    vec![vec![1u8; 65]]
}

/// Run `f` on its own thread, failing the test if it has not returned
/// within `timeout`.
fn returns_within<T: Send + 'static>(timeout: Duration, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout).expect("call did not return in time")
}

struct Net {
    chain: Arc<MemoryChain>,
    legacy: Arc<MockEngine>,
    current: Arc<MockEngine>,
    transport: Arc<MockTransport>,
    store: Arc<MemorySnapshotStore>,
    checkpoints: Arc<PrometheusCheckpoints>,
    backend: Arc<Backend>,
}

impl Net {
    fn new(config: BackendConfig, validators: u8) -> Self {
        Self::on(
            MemoryChain::new(genesis(validators)),
            Arc::new(MemorySnapshotStore::new()),
            config,
        )
    }

    /// Backend for node 1 over an existing chain and store
    fn on(chain: Arc<MemoryChain>, store: Arc<MemorySnapshotStore>, config: BackendConfig) -> Self {
        init_tracing();
        let local = key(1);
        let legacy = MockEngine::new(EngineMode::Legacy, local.address());
        let current = MockEngine::new(EngineMode::Current, local.address());
        let transport = MockTransport::new();
        let checkpoints = Arc::new(PrometheusCheckpoints::new(&Registry::new(), true).unwrap());

        let backend = BackendBuilder::new(
            config,
            local,
            chain.clone(),
            EnginePair::new(legacy.clone(), current.clone()),
        )
        .transport(transport.clone())
        .snapshot_store(store.clone())
        .checkpoints(checkpoints.clone())
        .build()
        .unwrap();

        Self {
            chain,
            legacy,
            current,
            transport,
            store,
            checkpoints,
            backend,
        }
    }

    fn genesis_hash(&self) -> Hash {
        self.chain.header_by_number(0).unwrap().hash()
    }

    fn genesis_header(&self) -> Header {
        self.chain.header_by_number(0).unwrap()
    }
}

fn with_fork(fork_height: Option<u64>) -> BackendConfig {
    BackendConfig {
        fork_height,
        ..Default::default()
    }
}

#[derive(Debug)]
struct NotABlock;

impl Proposal for NotABlock {
    fn number(&self) -> u64 {
        1
    }

    fn hash(&self) -> Hash {
        Hash([1; 32])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ========== Snapshots ==========

#[test]
fn test_votes_in_headers_change_validators() {
    let net = Net::new(BackendConfig::default(), 3);
    let add_four = Some(ValidatorVote { candidate: addr(4), authorize: true });
    extend(&net.chain, &key(1), add_four);
    extend(&net.chain, &key(2), add_four);
    let head = extend(&net.chain, &key(4), None);

    let snapshot = net.backend.snapshot(head.number(), head.hash()).unwrap();
    assert_eq!(snapshot.number, 3);
    assert_eq!(snapshot.validators.size(), 4);
    assert!(snapshot.validators.contains(&addr(4)));
    assert!(snapshot.votes.is_empty());
}

#[test]
fn test_snapshot_is_deterministic() {
    let net = Net::new(BackendConfig::default(), 4);
    let remove_four = Some(ValidatorVote { candidate: addr(4), authorize: false });
    extend(&net.chain, &key(1), remove_four);
    extend(&net.chain, &key(2), None);
    extend(&net.chain, &key(3), remove_four);
    let head = extend(&net.chain, &key(2), remove_four);

    let warm = net.backend.snapshot(head.number(), head.hash()).unwrap();
    let again = net.backend.snapshot(head.number(), head.hash()).unwrap();
    assert_eq!(warm.validators.list(), again.validators.list());
    assert!(!warm.validators.contains(&addr(4)));

    // A cold backend over the same chain, queried from several threads
    let cold = Net::on(net.chain.clone(), Arc::new(MemorySnapshotStore::new()), BackendConfig::default());
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| cold.backend.snapshot(head.number(), head.hash()).unwrap()))
            .collect();
        for handle in handles {
            let snapshot = handle.join().unwrap();
            assert_eq!(snapshot.validators.list(), warm.validators.list());
            assert_eq!(snapshot.to_record(), warm.to_record());
        }
    });
}

#[test]
fn test_unknown_ancestor() {
    let net = Net::new(BackendConfig::default(), 4);
    assert!(matches!(
        net.backend.snapshot(2, Hash([7; 32])),
        Err(BackendError::UnknownAncestor)
    ));
    assert!(net.backend.validators_for(2, Hash([7; 32])).is_empty());
}

#[test]
fn test_snapshots_persisted_at_checkpoints() {
    let config = BackendConfig {
        checkpoint_interval: 2,
        ..Default::default()
    };
    let net = Net::new(config.clone(), 4);
    extend(&net.chain, &key(1), None);
    let head = extend(&net.chain, &key(2), None);

    let snapshot = net.backend.snapshot(2, head.hash()).unwrap();
    // Genesis plus height 2
    assert_eq!(net.store.len(), 2);

    let restarted = Net::on(net.chain.clone(), net.store.clone(), config);
    let loaded = restarted.backend.snapshot(2, head.hash()).unwrap();
    assert_eq!(loaded.to_record(), snapshot.to_record());
    assert_eq!(restarted.store.len(), 2);
}

#[test]
fn test_validator_accessors() {
    let net = Net::new(BackendConfig::default(), 4);
    let block = extend(&net.chain, &key(2), None);

    assert_eq!(net.backend.validators(&block).size(), 4);
    assert_eq!(
        net.backend.parent_validators(&block),
        net.backend.validators_for(0, net.genesis_hash())
    );
    assert!(net.backend.parent_validators(&NotABlock).is_empty());

    assert_eq!(net.backend.get_proposer(1), addr(2));
    assert_eq!(net.backend.get_proposer(50), Address::ZERO);
    // Genesis carries no proposer seal
    assert_eq!(net.backend.get_proposer(0), Address::ZERO);
}

// ========== Inbound messages ==========

#[test]
fn test_inbound_requires_running_core() {
    let net = Net::new(BackendConfig::default(), 4);
    assert!(matches!(
        net.backend.handle_message(addr(2), ISTANBUL_MSG, vec![1]),
        Err(BackendError::EngineStopped)
    ));
    // Non-consensus codes are not ours to judge
    assert!(!net.backend.handle_message(addr(2), 0x01, vec![1]).unwrap());
    assert!(matches!(
        net.backend.handle_new_chain_head(),
        Err(BackendError::EngineStopped)
    ));
}

#[test]
fn test_inbound_delivered_once() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.start().unwrap();
    let mut events = net.legacy.cores()[0].take_events().unwrap();

    let payload = b"prepare".to_vec();
    assert!(net.backend.handle_message(addr(2), ISTANBUL_MSG, payload.clone()).unwrap());
    assert!(net.backend.handle_message(addr(3), ISTANBUL_MSG, payload.clone()).unwrap());

    assert_eq!(
        events.try_recv().unwrap(),
        BackendEvent::Message { code: ISTANBUL_MSG, payload }
    );
    assert!(events.try_recv().is_err());

    // Current-protocol codes are foreign to the legacy engine
    assert!(!net.backend.handle_message(addr(2), COMMIT_MSG, vec![9]).unwrap());

    net.backend.handle_new_chain_head().unwrap();
    assert_eq!(events.try_recv().unwrap(), BackendEvent::FinalCommitted);
}

#[test]
fn test_current_protocol_accepts_its_codes() {
    let net = Net::new(with_fork(Some(0)), 4);
    net.backend.start().unwrap();
    assert_eq!(net.current.cores_built(), 1);
    let mut events = net.current.cores()[0].take_events().unwrap();

    assert!(net.backend.handle_message(addr(2), COMMIT_MSG, vec![3]).unwrap());
    assert_eq!(
        events.try_recv().unwrap(),
        BackendEvent::Message { code: COMMIT_MSG, payload: vec![3] }
    );
}

// ========== Gossip ==========

#[tokio::test]
async fn test_gossip_is_idempotent() {
    let net = Net::new(BackendConfig::default(), 4);
    let peers: Vec<_> = (2..=4).map(|i| net.transport.connect(addr(i))).collect();
    let validators = net.backend.validators_for(0, net.genesis_hash());

    net.backend.gossip(&validators, ISTANBUL_MSG, b"vote".to_vec());
    net.backend.gossip(&validators, ISTANBUL_MSG, b"vote".to_vec());

    for peer in &peers {
        assert!(peer.wait_for(1, Duration::from_secs(2)).await);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for peer in &peers {
        assert_eq!(peer.sent_count(), 1);
    }
}

#[tokio::test]
async fn test_broadcast_skips_self_and_injects_once() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.start().unwrap();
    let mut events = net.legacy.cores()[0].take_events().unwrap();

    // A transport that also knows ourselves must still not be used for self
    let me = net.transport.connect(addr(1));
    let other = net.transport.connect(addr(2));
    let validators = net.backend.validators_for(0, net.genesis_hash());

    let payload = b"preprepare".to_vec();
    net.backend.broadcast(&validators, ISTANBUL_MSG, payload.clone());

    assert!(other.wait_for(1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(me.sent_count(), 0);

    assert_eq!(
        events.try_recv().unwrap(),
        BackendEvent::Message { code: ISTANBUL_MSG, payload: payload.clone() }
    );
    // The echo from a peer is recognized as our own
    assert!(net.backend.handle_message(addr(2), ISTANBUL_MSG, payload).unwrap());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_skips_informed_peer() {
    let net = Net::new(BackendConfig::default(), 5);
    net.backend.start().unwrap();
    let peers: Vec<_> = (2..=5).map(|i| net.transport.connect(addr(i))).collect();
    let validators = net.backend.validators_for(0, net.genesis_hash());

    // Peer 3 sent us the payload first
    let payload = b"commit".to_vec();
    assert!(net.backend.handle_message(addr(3), ISTANBUL_MSG, payload.clone()).unwrap());

    let mut events = net.backend.subscribe_events();
    net.backend.broadcast(&validators, ISTANBUL_MSG, payload.clone());

    for (i, peer) in peers.iter().enumerate() {
        if i != 1 {
            assert!(peer.wait_for(1, Duration::from_secs(2)).await);
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sends: usize = peers.iter().map(|p| p.sent_count()).sum();
    assert_eq!(sends, 3);
    assert_eq!(peers[1].sent_count(), 0);

    assert!(events.try_recv().is_ok());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_outbound_codes_follow_protocol() {
    let net = Net::new(with_fork(Some(0)), 2);
    let peer = net.transport.connect(addr(2));
    let validators = net.backend.validators_for(0, net.genesis_hash());

    net.backend.gossip(&validators, PREPARE_MSG, vec![1]);
    net.backend.gossip(&validators, 0x42, vec![2]);
    assert!(peer.wait_for(2, Duration::from_secs(2)).await);

    let sent = peer.sent();
    assert_eq!(sent[0].code, PREPARE_MSG);
    assert_eq!(sent[1].code, ISTANBUL_MSG);
    assert!(sent.iter().all(|m| m.mode == EngineMode::Current));

    let legacy = Net::new(BackendConfig::default(), 2);
    let peer = legacy.transport.connect(addr(2));
    let validators = legacy.backend.validators_for(0, legacy.genesis_hash());
    legacy.backend.gossip(&validators, PREPARE_MSG, vec![1]);
    assert!(peer.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(peer.sent()[0].code, ISTANBUL_MSG);
}

#[test]
fn test_gossip_outside_runtime_is_sent_later() {
    let net = Net::new(BackendConfig::default(), 2);
    let peer = net.transport.connect(addr(2));
    let validators = net.backend.validators_for(0, net.genesis_hash());

    // No runtime: nothing can be queued, so the peer must not count as informed
    net.backend.gossip(&validators, ISTANBUL_MSG, b"vote".to_vec());
    assert_eq!(peer.sent_count(), 0);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        net.backend.gossip(&validators, ISTANBUL_MSG, b"vote".to_vec());
        assert!(peer.wait_for(1, Duration::from_secs(2)).await);
    });
    assert_eq!(peer.sent_count(), 1);
}

// ========== Verify and commit ==========

#[test]
fn test_verify_outcomes() {
    let net = Net::new(BackendConfig::default(), 4);
    let parent = net.genesis_header();

    let good = make_block(&parent, &key(2), None);
    assert_eq!(net.backend.verify(&good).unwrap(), VerifyOutcome::Accepted);
    assert_eq!(net.checkpoints.voting_started.get(), 1);

    let outsider = make_block(&parent, &key(9), None);
    assert!(matches!(
        net.backend.verify(&outsider),
        Err(BackendError::Engine(EngineError::InvalidSeal(_)))
    ));

    let mut future = make_block(&parent, &key(2), None).header;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    future.timestamp = now + 3600;
    seal_header(&key(2), &mut future).unwrap();
    match net.backend.verify(&Block::new(future, Vec::new())).unwrap() {
        VerifyOutcome::Deferred { retry_after } => assert!(retry_after > Duration::ZERO),
        other => panic!("expected deferral, got {:?}", other),
    }
    assert_eq!(net.checkpoints.voting_started.get(), 1);

    assert!(matches!(net.backend.verify(&NotABlock), Err(BackendError::InvalidProposal)));

    net.chain.mark_bad(good.hash());
    assert!(net.backend.has_bad_proposal(&good.hash()));
    assert!(matches!(
        net.backend.verify(&good),
        Err(BackendError::BlacklistedBlock(h)) if h == good.hash()
    ));
}

#[tokio::test]
async fn test_commit_race_delivers_once_locally() {
    let net = Net::new(BackendConfig::default(), 4);
    let block = make_block(&net.genesis_header(), &key(1), None);
    let handle = net.backend.prepare_seal(block.hash());

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| net.backend.commit(&block, seals(), 1).unwrap());
        }
    });

    let sealed = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(sealed.hash(), block.hash());
    assert_eq!(sealed.header.extra.committed_seals, seals());
    assert_eq!(sealed.header.extra.round, 1);

    let imported = net.transport.imported();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].0, IMPORT_SOURCE);
    assert_eq!(imported[0].1.hash(), block.hash());

    assert_eq!(net.checkpoints.blocks_created.get(), 1);
    assert_eq!(net.checkpoints.blocks_inserted.get(), 1);
}

#[tokio::test]
async fn test_competing_commits_split_between_seal_and_import() {
    let net = Net::new(BackendConfig::default(), 4);
    let mine = make_block(&net.genesis_header(), &key(1), None);
    let theirs = make_block(&net.genesis_header(), &key(2), None);
    assert_ne!(mine.hash(), theirs.hash());
    let handle = net.backend.prepare_seal(mine.hash());

    std::thread::scope(|s| {
        s.spawn(|| net.backend.commit(&mine, seals(), 0).unwrap());
        s.spawn(|| net.backend.commit(&theirs, seals(), 0).unwrap());
    });

    let sealed = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(sealed.hash(), mine.hash());

    let imported = net.transport.imported();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].1.hash(), theirs.hash());

    assert_eq!(net.checkpoints.blocks_created.get(), 1);
    assert_eq!(net.checkpoints.blocks_inserted.get(), 1);
}

#[tokio::test]
async fn test_commit_of_foreign_block_is_imported() {
    let net = Net::new(BackendConfig::default(), 4);
    let mine = make_block(&net.genesis_header(), &key(1), None);
    let theirs = make_block(&net.genesis_header(), &key(2), None);
    let handle = net.backend.prepare_seal(mine.hash());

    net.backend.commit(&theirs, seals(), 0).unwrap();
    assert_eq!(net.transport.imported().len(), 1);
    assert_eq!(
        handle.wait(Duration::from_millis(20)).await.unwrap_err(),
        SealError::TimedOut
    );
}

#[test]
fn test_commit_after_sealer_left_falls_back_to_import() {
    let net = Net::new(BackendConfig::default(), 4);
    let block = make_block(&net.genesis_header(), &key(1), None);
    drop(net.backend.prepare_seal(block.hash()));

    net.backend.commit(&block, seals(), 0).unwrap();
    assert_eq!(net.transport.imported().len(), 1);
    assert_eq!(net.checkpoints.blocks_created.get(), 0);
}

#[test]
fn test_commit_errors() {
    let net = Net::new(BackendConfig::default(), 4);
    let block = make_block(&net.genesis_header(), &key(1), None);
    assert!(matches!(
        net.backend.commit(&NotABlock, seals(), 0),
        Err(BackendError::InvalidProposal)
    ));
    assert!(matches!(
        net.backend.commit(&block, Vec::new(), 0),
        Err(BackendError::Engine(EngineError::InvalidCommittedSeals))
    ));
    assert!(net.transport.imported().is_empty());
}

#[test]
fn test_commit_clears_policy_registry() {
    let net = Net::new(BackendConfig::default(), 4);
    let block = make_block(&net.genesis_header(), &key(1), None);
    let _validators = net.backend.parent_validators(&block);
    assert!(net.backend.policy().registry_len() > 0);

    net.backend.commit(&block, seals(), 0).unwrap();
    assert_eq!(net.backend.policy().registry_len(), 0);
}

#[test]
fn test_last_proposal() {
    let net = Net::new(BackendConfig::default(), 4);
    let (block, proposer) = net.backend.last_proposal();
    assert_eq!(block.unwrap().number(), 0);
    assert_eq!(proposer, Address::ZERO);

    let head = extend(&net.chain, &key(3), None);
    let (block, proposer) = net.backend.last_proposal();
    assert_eq!(block.unwrap().hash(), head.hash());
    assert_eq!(proposer, addr(3));
    assert!(net.backend.has_proposal(&head.hash(), 1));
    assert!(!net.backend.has_proposal(&head.hash(), 2));

    // An unsealed head cannot be attributed
    let mut unsealed = make_block(&head.header, &key(3), None);
    unsealed.header.extra.proposer_seal.clear();
    net.chain.insert(unsealed);
    assert_eq!(net.backend.last_proposal(), (None, Address::ZERO));
}

// ========== Signing ==========

#[test]
fn test_signature_round_trip() {
    let net = Net::new(BackendConfig::default(), 4);
    let data = b"round change";

    let signature = net.backend.sign(data).unwrap();
    assert_eq!(signature.len(), 65);
    net.backend
        .check_signature(data, &net.backend.address(), &signature)
        .unwrap();

    assert!(matches!(
        net.backend.check_signature(data, &addr(2), &signature),
        Err(BackendError::InvalidSignature)
    ));
    assert!(matches!(
        net.backend.check_signature(data, &net.backend.address(), &[0u8; 10]),
        Err(BackendError::Key(_))
    ));

    let prehashed = net
        .backend
        .sign_without_hashing(keccak256(data).as_bytes())
        .unwrap();
    assert_eq!(prehashed, signature);
    assert!(matches!(
        net.backend.sign_without_hashing(&[0u8; 31]),
        Err(BackendError::Key(_))
    ));
}

// ========== Engine lifecycle ==========

#[test]
fn test_start_stop_lifecycle() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.start().unwrap();
    assert!(matches!(net.backend.start(), Err(BackendError::EngineStarted)));

    net.backend.stop().unwrap();
    assert!(matches!(net.backend.stop(), Err(BackendError::EngineStopped)));
    assert!(!net.legacy.cores()[0].is_running());

    net.backend.start().unwrap();
    assert_eq!(net.legacy.cores_built(), 2);
    assert_eq!(net.current.cores_built(), 0);
    assert!(net.backend.engine_status().running);
}

#[test]
fn test_fork_height_selects_engine() {
    let net = Net::new(with_fork(Some(10)), 4);
    let at = |number| Header {
        number,
        ..Default::default()
    };
    assert_eq!(net.backend.engine_mode(Some(&at(10))), EngineMode::Current);
    assert_eq!(net.backend.engine_mode(Some(&at(9))), EngineMode::Legacy);
    assert_eq!(net.backend.engine_mode(None), EngineMode::Legacy);

    net.backend.start().unwrap();
    net.backend.start_switchover().unwrap();
    assert_eq!(net.backend.engine_mode(Some(&at(1))), EngineMode::Current);
}

#[test]
fn test_switchover_is_atomic_for_readers() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.start().unwrap();
    let header = net.chain.header_by_number(0).unwrap();
    let before = net.backend.validators_for(0, net.genesis_hash());
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut seen_current = false;
                while !done.load(Ordering::SeqCst) {
                    let status = net.backend.engine_status();
                    if status.current_forced {
                        assert_eq!(status.mode, EngineMode::Current);
                        assert!(status.running);
                    } else {
                        assert_eq!(status.mode, EngineMode::Legacy);
                    }
                    let mode = net.backend.engine_mode(Some(&header));
                    if seen_current {
                        assert_eq!(mode, EngineMode::Current);
                    }
                    seen_current |= mode == EngineMode::Current;
                }
            });
        }
        std::thread::sleep(Duration::from_millis(10));
        net.backend.start_switchover().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        done.store(true, Ordering::SeqCst);
    });

    let status = net.backend.engine_status();
    assert_eq!(status.mode, EngineMode::Current);
    assert!(status.running && status.current_forced);
    assert!(net.legacy.cores()[0].stopped.load(Ordering::SeqCst));
    assert!(net.current.cores()[0].is_running());

    // Validator sets built before the switch are re-sorted by bytes
    assert_eq!(net.backend.policy().ordering(), ValidatorOrdering::ByBytes);
    let list = before.list();
    let mut sorted = list.clone();
    sorted.sort();
    assert_eq!(list, sorted);
}

#[test]
fn test_core_can_query_backend_while_starting() {
    let net = Net::new(BackendConfig::default(), 4);
    extend(&net.chain, &key(2), None);
    let expected = Bootstrap {
        head: 1,
        last_proposer: addr(2),
        parent_validators: 4,
    };

    let backend = net.backend.clone();
    returns_within(Duration::from_secs(3), move || backend.start()).unwrap();
    assert_eq!(net.legacy.cores()[0].bootstrap(), Some(expected.clone()));

    let backend = net.backend.clone();
    returns_within(Duration::from_secs(3), move || backend.start_switchover()).unwrap();
    assert_eq!(net.current.cores()[0].bootstrap(), Some(expected));

    let status = net.backend.engine_status();
    assert!(status.running && status.current_forced);
}

#[test]
fn test_cached_snapshot_matches_recompute_after_switchover() {
    let net = Net::new(BackendConfig::default(), 40);
    net.backend.start().unwrap();
    net.backend.validators_for(0, net.genesis_hash());

    // Commit forgets registered sets, so the cached one is not re-sorted in place
    let block = make_block(&net.genesis_header(), &key(1), None);
    net.backend.commit(&block, seals(), 0).unwrap();
    net.backend.start_switchover().unwrap();

    let after = net.backend.validators_for(0, net.genesis_hash()).list();
    let mut by_bytes = after.clone();
    by_bytes.sort();
    assert_eq!(after, by_bytes);

    // A node that never cached it picks the same order
    let cold = Net::new(with_fork(Some(0)), 40);
    assert_eq!(cold.genesis_hash(), net.genesis_hash());
    assert_eq!(cold.backend.validators_for(0, cold.genesis_hash()).list(), after);
}

#[test]
fn test_switchover_failure_leaves_no_core() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.start().unwrap();
    net.current.set_fail_start(true);

    assert!(matches!(
        net.backend.start_switchover(),
        Err(BackendError::EngineSwitchover(_))
    ));
    let status = net.backend.engine_status();
    assert!(!status.running);
    assert!(!status.current_forced);
    assert!(net.legacy.cores()[0].stopped.load(Ordering::SeqCst));
    assert!(matches!(net.backend.stop(), Err(BackendError::EngineStopped)));
}

#[test]
fn test_switchover_fails_when_legacy_core_cannot_stop() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.start().unwrap();
    net.legacy.set_fail_stop(true);

    assert!(matches!(
        net.backend.start_switchover(),
        Err(BackendError::EngineSwitchover(_))
    ));
    assert!(!net.backend.engine_status().running);
    assert_eq!(net.current.cores_built(), 0);
}

// ========== Candidates ==========

#[test]
fn test_candidates() {
    let net = Net::new(BackendConfig::default(), 4);
    net.backend.propose(addr(7), true);
    net.backend.propose(addr(2), false);
    net.backend.propose(addr(7), false);

    let candidates = net.backend.candidates();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates.get(&addr(7)), Some(&false));

    net.backend.discard(&addr(7));
    assert!(!net.backend.candidates().contains_key(&addr(7)));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let config = BackendConfig {
        epoch: 0,
        ..Default::default()
    };
    let result = BackendBuilder::new(
        config,
        key(1),
        MemoryChain::new(genesis(1)),
        EnginePair::new(
            MockEngine::new(EngineMode::Legacy, addr(1)),
            MockEngine::new(EngineMode::Current, addr(1)),
        ),
    )
    .build();
    assert!(matches!(result, Err(BackendError::Config(_))));
}

#[test]
fn test_builder_exports_checkpoints_on_registry() {
    init_tracing();
    let registry = Registry::new();
    let config = BackendConfig {
        emit_checkpoints: true,
        ..Default::default()
    };
    let chain = MemoryChain::new(genesis(4));
    let engines = || {
        EnginePair::new(
            MockEngine::new(EngineMode::Legacy, addr(1)),
            MockEngine::new(EngineMode::Current, addr(1)),
        )
    };
    let backend = BackendBuilder::new(config.clone(), key(1), chain.clone(), engines())
        .transport(MockTransport::new())
        .metrics_registry(registry.clone())
        .build()
        .unwrap();

    let block = make_block(&chain.header_by_number(0).unwrap(), &key(2), None);
    backend.commit(&block, seals(), 0).unwrap();

    let inserted = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "bft_checkpoint_block_inserted_total")
        .unwrap();
    assert_eq!(inserted.get_metric()[0].get_counter().get_value(), 1.0);

    // The counters are already registered there
    let again = BackendBuilder::new(config, key(1), chain, engines())
        .metrics_registry(registry)
        .build();
    assert!(matches!(again, Err(BackendError::Metrics(_))));
}

#[test]
fn test_difficulty_comes_from_engine() {
    let net = Net::new(BackendConfig::default(), 1);
    assert_eq!(net.backend.calc_difficulty(&net.genesis_header()), 1);

    net.backend.validators_for(0, net.genesis_hash());
    net.backend.validators_for(0, net.genesis_hash());
    let stats = net.backend.snapshot_cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}
