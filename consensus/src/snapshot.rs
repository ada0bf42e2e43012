// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Validator snapshots
//!
//! A snapshot is the validator set in force after a given block, together
//! with the pending membership votes. It is rebuilt by replaying headers on
//! top of an older snapshot:
//!
//! ```text
//! base snapshot (genesis / checkpoint / cache)
//!      │  apply(header n+1)   reset votes at epoch boundary
//!      │  apply(header n+2)   discard signer's earlier vote, cast new one
//!      │  ...                 majority reached → add / remove validator
//!      ▼
//! snapshot at (n+k, hash)
//! ```
//!
//! Replay is a pure function of the base snapshot and the headers, so the
//! snapshot for a given block hash is always the same.

use bft_types::{Address, Hash, Header};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::PolicyKind;
use crate::error::{BackendError, BackendResult};
use crate::validator::{ProposerPolicy, ValidatorSet};

/// Key prefix for persisted snapshots
pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"bft-snapshot-";

/// A single membership vote from a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Validator that cast the vote
    pub validator: Address,
    /// Block number the vote was cast at
    pub block: u64,
    /// Account being voted on
    pub candidate: Address,
    /// Add (`true`) or remove (`false`)
    pub authorize: bool,
}

/// Running count of votes for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub authorize: bool,
    pub votes: u64,
}

/// Validator set and pending votes at a block
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub epoch: u64,
    pub number: u64,
    pub hash: Hash,
    pub validators: ValidatorSet,
    pub votes: Vec<Vote>,
    pub tally: BTreeMap<Address, Tally>,
}

impl Snapshot {
    pub fn new(epoch: u64, number: u64, hash: Hash, validators: ValidatorSet) -> Self {
        Self {
            epoch,
            number,
            hash,
            validators,
            votes: Vec::new(),
            tally: BTreeMap::new(),
        }
    }

    /// Replay `headers` (oldest first) on top of this snapshot.
    ///
    /// `author_of` recovers the proposer of each header.
    pub fn apply<F>(&self, headers: &[Header], author_of: F) -> BackendResult<Snapshot>
    where
        F: Fn(&Header) -> BackendResult<Address>,
    {
        let (first, last) = match (headers.first(), headers.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(self.clone()),
        };
        if headers.windows(2).any(|pair| pair[1].number != pair[0].number + 1) {
            return Err(BackendError::InvalidVotingChain);
        }
        if first.number != self.number + 1 {
            return Err(BackendError::InvalidVotingChain);
        }

        let mut validators = self.validators.list();
        let mut votes = self.votes.clone();
        let mut tally = self.tally.clone();

        for header in headers {
            if self.epoch != 0 && header.number % self.epoch == 0 {
                votes.clear();
                tally.clear();
            }

            let signer = author_of(header)?;
            if !validators.contains(&signer) {
                return Err(BackendError::UnauthorizedProposer);
            }

            let vote = match header.extra.vote {
                Some(vote) => vote,
                None => continue,
            };

            // A validator has at most one live vote per candidate
            if let Some(pos) = votes
                .iter()
                .position(|v| v.validator == signer && v.candidate == vote.candidate)
            {
                let old = votes.remove(pos);
                uncast(&mut tally, &old.candidate, old.authorize);
            }

            if cast(&validators, &mut tally, vote.candidate, vote.authorize) {
                votes.push(Vote {
                    validator: signer,
                    block: header.number,
                    candidate: vote.candidate,
                    authorize: vote.authorize,
                });
            }

            let passed = match tally.get(&vote.candidate) {
                Some(t) if t.votes as usize > validators.len() / 2 => Some(t.authorize),
                _ => None,
            };
            if let Some(authorize) = passed {
                if authorize {
                    validators.push(vote.candidate);
                } else {
                    validators.retain(|a| a != &vote.candidate);
                    // Votes cast by the removed validator no longer count
                    votes.retain(|v| {
                        if v.validator == vote.candidate {
                            uncast(&mut tally, &v.candidate, v.authorize);
                            false
                        } else {
                            true
                        }
                    });
                }
                votes.retain(|v| v.candidate != vote.candidate);
                tally.remove(&vote.candidate);
            }
        }

        Ok(Snapshot {
            epoch: self.epoch,
            number: last.number,
            hash: last.hash(),
            validators: ValidatorSet::new(validators, self.validators.policy()),
            votes,
            tally,
        })
    }

    pub fn to_record(&self) -> SnapshotRecord {
        SnapshotRecord {
            epoch: self.epoch,
            number: self.number,
            hash: self.hash,
            validators: self.validators.list(),
            policy: self.validators.policy().kind(),
            votes: self.votes.clone(),
            tally: self.tally.iter().map(|(a, t)| (*a, *t)).collect(),
        }
    }

    pub fn from_record(record: SnapshotRecord, policy: &Arc<ProposerPolicy>) -> Self {
        Self {
            epoch: record.epoch,
            number: record.number,
            hash: record.hash,
            validators: ValidatorSet::new(record.validators, policy),
            votes: record.votes,
            tally: record.tally.into_iter().collect(),
        }
    }

    /// Persist as JSON under the snapshot's block hash.
    pub fn store(&self, store: &dyn SnapshotStore) -> BackendResult<()> {
        let blob = serde_json::to_vec(&self.to_record())
            .map_err(|e| BackendError::Store(e.to_string()))?;
        store.put(&snapshot_key(&self.hash), blob)
    }

    /// Load a persisted snapshot; `Ok(None)` if absent.
    pub fn load(
        epoch: u64,
        store: &dyn SnapshotStore,
        hash: &Hash,
        policy: &Arc<ProposerPolicy>,
    ) -> BackendResult<Option<Snapshot>> {
        let blob = match store.get(&snapshot_key(hash)) {
            Some(blob) => blob,
            None => return Ok(None),
        };
        let record: SnapshotRecord =
            serde_json::from_slice(&blob).map_err(|e| BackendError::Store(e.to_string()))?;
        let mut snapshot = Snapshot::from_record(record, policy);
        snapshot.epoch = epoch;
        Ok(Some(snapshot))
    }
}

fn cast(validators: &[Address], tally: &mut BTreeMap<Address, Tally>, candidate: Address, authorize: bool) -> bool {
    // Only votes that would change membership count
    if validators.contains(&candidate) == authorize {
        return false;
    }
    tally
        .entry(candidate)
        .and_modify(|t| t.votes += 1)
        .or_insert(Tally { authorize, votes: 1 });
    true
}

fn uncast(tally: &mut BTreeMap<Address, Tally>, candidate: &Address, authorize: bool) -> bool {
    let exhausted = match tally.get_mut(candidate) {
        Some(t) if t.authorize == authorize => {
            t.votes = t.votes.saturating_sub(1);
            t.votes == 0
        }
        _ => return false,
    };
    if exhausted {
        tally.remove(candidate);
    }
    true
}

fn snapshot_key(hash: &Hash) -> Vec<u8> {
    let mut key = SNAPSHOT_KEY_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Serialized form of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub epoch: u64,
    pub number: u64,
    pub hash: Hash,
    pub validators: Vec<Address>,
    pub policy: PolicyKind,
    pub votes: Vec<Vote>,
    /// Sorted by candidate; JSON object keys must be strings
    pub tally: Vec<(Address, Tally)>,
}

/// Key-value storage for persisted snapshots
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: Vec<u8>) -> BackendResult<()>;
}

/// In-memory snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> BackendResult<()> {
        self.entries.insert(key.to_vec(), value);
        Ok(())
    }
}
