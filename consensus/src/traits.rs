// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Collaborator interfaces
//!
//! ```text
//!            ┌──────────────────────┐
//!            │   RoundCore (ext.)   │
//!            └──────────┬───────────┘
//!                       │ ConsensusBackend
//!            ┌──────────▼───────────┐
//!            │       Backend        │
//!            └──┬────────┬───────┬──┘
//!   ChainReader │        │       │ Transport
//!               ▼        │       ▼
//!          chain store   │   peer layer
//!                        ▼
//!                  SnapshotStore
//! ```

use bft_types::{Address, Block, Hash, Header, Proposal};
use std::sync::Weak;

use crate::engine::VerifyOutcome;
use crate::error::BackendResult;
use crate::events::EventReceiver;
use crate::validator::ValidatorSet;

/// Read access to the local chain
pub trait ChainReader: Send + Sync {
    fn header_by_hash(&self, hash: &Hash) -> Option<Header>;

    fn header_by_number(&self, number: u64) -> Option<Header>;

    /// Header with the given hash, provided it sits at `number`
    fn header(&self, hash: &Hash, number: u64) -> Option<Header> {
        self.header_by_hash(hash).filter(|h| h.number == number)
    }

    fn current_header(&self) -> Option<Header>;

    fn current_block(&self) -> Option<Block>;

    fn has_bad_block(&self, hash: &Hash) -> bool;
}

/// What a round core may ask of the backend
pub trait ConsensusBackend: Send + Sync {
    fn address(&self) -> Address;

    /// Validator set at the proposal's height
    fn validators(&self, proposal: &dyn Proposal) -> ValidatorSet;

    /// Validator set at the proposal's parent
    fn parent_validators(&self, proposal: &dyn Proposal) -> ValidatorSet;

    /// New receiver on the backend's event stream
    fn subscribe_events(&self) -> EventReceiver;

    /// Send to the validator set and to ourselves
    fn broadcast(&self, validators: &ValidatorSet, code: u64, payload: Vec<u8>);

    /// Send to the validator set, excluding ourselves
    fn gossip(&self, validators: &ValidatorSet, code: u64, payload: Vec<u8>);

    fn verify(&self, proposal: &dyn Proposal) -> BackendResult<VerifyOutcome>;

    fn commit(&self, proposal: &dyn Proposal, seals: Vec<Vec<u8>>, round: u32) -> BackendResult<()>;

    fn sign(&self, data: &[u8]) -> BackendResult<Vec<u8>>;

    fn sign_without_hashing(&self, digest: &[u8]) -> BackendResult<Vec<u8>>;

    fn check_signature(&self, data: &[u8], address: &Address, signature: &[u8]) -> BackendResult<()>;

    /// Chain head and its proposer
    fn last_proposal(&self) -> (Option<Block>, Address);

    fn has_proposal(&self, hash: &Hash, number: u64) -> bool;

    fn get_proposer(&self, number: u64) -> Address;

    fn has_bad_proposal(&self, hash: &Hash) -> bool;
}

/// Handle given to cores. Weak so a backend and its core do not keep
/// each other alive.
pub type BackendHandle = Weak<dyn ConsensusBackend>;
