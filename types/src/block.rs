// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Headers, blocks and the proposal abstraction the round engines work with.
//!
//! The block hash deliberately excludes the committed seals and the commit
//! round: those are filled in after quorum, and the proposer and every
//! committer must agree on the hash of the block being voted on.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::any::Any;
use std::fmt::Debug;

use crate::primitives::{Address, Hash};

/// A vote carried in a header to add or remove a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorVote {
    /// The account being voted on
    pub candidate: Address,
    /// `true` to add, `false` to remove
    pub authorize: bool,
}

/// Consensus-specific header data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BftExtra {
    /// Free-form proposer data
    pub vanity: Vec<u8>,
    /// Validator list; only meaningful on the genesis header
    pub validators: Vec<Address>,
    /// Optional membership vote cast by the proposer
    pub vote: Option<ValidatorVote>,
    /// Round in which the block was committed
    pub round: u32,
    /// Proposer's signature over `Header::seal_hash`
    pub proposer_seal: Vec<u8>,
    /// Commit signatures collected by the round engine
    pub committed_seals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: Hash,
    pub coinbase: Address,
    pub number: u64,
    pub timestamp: u64,
    pub difficulty: u64,
    pub extra: BftExtra,
}

impl Header {
    /// Block identity. Excludes commit round and committed seals.
    pub fn hash(&self) -> Hash {
        let mut hasher = Keccak256::new();
        self.hash_fields(&mut hasher);
        hasher.update(length_prefixed(&self.extra.proposer_seal));
        Hash(hasher.finalize().into())
    }

    /// Digest the proposer signs. Excludes every seal.
    pub fn seal_hash(&self) -> Hash {
        let mut hasher = Keccak256::new();
        self.hash_fields(&mut hasher);
        Hash(hasher.finalize().into())
    }

    fn hash_fields(&self, hasher: &mut Keccak256) {
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.coinbase.as_bytes());
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(length_prefixed(&self.extra.vanity));
        hasher.update((self.extra.validators.len() as u64).to_be_bytes());
        for validator in &self.extra.validators {
            hasher.update(validator.as_bytes());
        }
        match &self.extra.vote {
            Some(vote) => {
                hasher.update([1u8]);
                hasher.update(vote.candidate.as_bytes());
                hasher.update([vote.authorize as u8]);
            }
            None => hasher.update([0u8]),
        }
    }
}

fn length_prefixed(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Vec<u8>>) -> Self {
        Self { header, transactions }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    /// Returns a copy of this block carrying the sealed header.
    pub fn with_seal(&self, header: Header) -> Block {
        Block {
            header,
            transactions: self.transactions.clone(),
        }
    }

    /// Type-checks a proposal as a block.
    pub fn from_proposal(proposal: &dyn Proposal) -> Option<&Block> {
        proposal.as_any().downcast_ref::<Block>()
    }
}

/// Anything a round engine can propose and vote on
pub trait Proposal: Debug + Send + Sync + 'static {
    fn number(&self) -> u64;
    fn hash(&self) -> Hash;
    fn as_any(&self) -> &dyn Any;
}

impl Proposal for Block {
    fn number(&self) -> u64 {
        self.header.number
    }

    fn hash(&self) -> Hash {
        self.header.hash()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
