// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Validator sets and proposer selection
//!
//! A `ValidatorSet` has fixed membership. Its ordering follows the
//! comparator of the `ProposerPolicy` it was built with: when the policy
//! switches comparator (on protocol switchover) every set registered since
//! the last `clear_registry()` is re-sorted in place, so engines that still
//! hold a set observe the new order.

use bft_types::Address;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::config::PolicyKind;

/// Comparator used to order validators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorOrdering {
    /// Compare checksummed hex strings (legacy protocol)
    ByChecksumString,
    /// Compare raw address bytes (current protocol)
    ByBytes,
}

impl ValidatorOrdering {
    pub fn sort(&self, validators: &mut [Address]) {
        match self {
            ValidatorOrdering::ByChecksumString => {
                validators.sort_by_cached_key(|a| a.to_checksum_hex())
            }
            ValidatorOrdering::ByBytes => validators.sort(),
        }
    }
}

struct PolicyState {
    ordering: ValidatorOrdering,
    registry: Vec<Weak<ValidatorSetInner>>,
}

/// Proposer-selection policy shared by every validator set of a backend
pub struct ProposerPolicy {
    kind: PolicyKind,
    state: Mutex<PolicyState>,
}

impl ProposerPolicy {
    /// New policy using the legacy comparator.
    pub fn new(kind: PolicyKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(PolicyState {
                ordering: ValidatorOrdering::ByChecksumString,
                registry: Vec::new(),
            }),
        })
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn ordering(&self) -> ValidatorOrdering {
        self.state.lock().ordering
    }

    /// Switch comparator and re-sort all registered sets.
    pub fn use_ordering(&self, ordering: ValidatorOrdering) {
        let mut state = self.state.lock();
        state.ordering = ordering;
        state.registry.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                ordering.sort(&mut inner.validators.write());
                true
            }
            None => false,
        });
    }

    /// Forget registered sets. Called after each commit so the registry
    /// does not grow with the chain.
    pub fn clear_registry(&self) {
        self.state.lock().registry.clear();
    }

    pub fn registry_len(&self) -> usize {
        self.state.lock().registry.len()
    }
}

impl fmt::Debug for ProposerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProposerPolicy")
            .field("kind", &self.kind)
            .field("ordering", &state.ordering)
            .field("registered", &state.registry.len())
            .finish()
    }
}

struct ValidatorSetInner {
    validators: RwLock<Vec<Address>>,
    policy: Arc<ProposerPolicy>,
}

/// Ordered validator addresses plus the policy that picks proposers
#[derive(Clone)]
pub struct ValidatorSet {
    inner: Arc<ValidatorSetInner>,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Address>, policy: &Arc<ProposerPolicy>) -> Self {
        // Sorting and registration happen under the policy lock so a
        // concurrent comparator switch cannot be missed.
        let mut state = policy.state.lock();
        state.ordering.sort(&mut validators);
        let inner = Arc::new(ValidatorSetInner {
            validators: RwLock::new(validators),
            policy: Arc::clone(policy),
        });
        state.registry.push(Arc::downgrade(&inner));
        drop(state);
        Self { inner }
    }

    /// Empty set; used where a snapshot cannot be computed.
    pub fn empty(policy: &Arc<ProposerPolicy>) -> Self {
        Self::new(Vec::new(), policy)
    }

    pub fn list(&self) -> Vec<Address> {
        self.inner.validators.read().clone()
    }

    pub fn size(&self) -> usize {
        self.inner.validators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.inner.validators.read().contains(address)
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.inner.validators.read().iter().position(|a| a == address)
    }

    pub fn get_by_index(&self, index: usize) -> Option<Address> {
        self.inner.validators.read().get(index).copied()
    }

    pub fn policy(&self) -> &Arc<ProposerPolicy> {
        &self.inner.policy
    }

    /// Proposer expected for `round` given the previous block's proposer.
    ///
    /// A zero `last_proposer` means "no previous proposer" (genesis).
    pub fn calc_proposer(&self, last_proposer: &Address, round: u64) -> Option<Address> {
        let validators = self.inner.validators.read();
        if validators.is_empty() {
            return None;
        }
        let offset = validators
            .iter()
            .position(|a| a == last_proposer)
            .unwrap_or(0) as u64;
        let seed = if last_proposer.is_zero() {
            round
        } else {
            match self.inner.policy.kind() {
                PolicyKind::RoundRobin => offset + round + 1,
                PolicyKind::Sticky => offset + round,
            }
        };
        let pick = (seed % validators.len() as u64) as usize;
        validators.get(pick).copied()
    }

    pub fn is_proposer(&self, address: &Address, last_proposer: &Address, round: u64) -> bool {
        self.calc_proposer(last_proposer, round).as_ref() == Some(address)
    }
}

impl PartialEq for ValidatorSet {
    fn eq(&self, other: &Self) -> bool {
        self.list() == other.list()
    }
}

impl Eq for ValidatorSet {}

impl fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorSet")
            .field("validators", &*self.inner.validators.read())
            .field("policy", &self.inner.policy.kind())
            .finish()
    }
}
