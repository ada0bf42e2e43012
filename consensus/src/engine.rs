// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Round engine abstraction and engine selection
//!
//! Two protocol variants exist: the legacy engine and the current one.
//! Exactly one is active for any given header. The choice depends on the
//! header height relative to the configured fork height, unless the
//! switchover has forced the current protocol.
//!
//! ```text
//! current_forced ──yes──▶ Current
//!      │no
//! fork_height unset ─▶ Legacy
//! fork_height == 0 ──▶ Current
//! height >= fork ────▶ Current
//! otherwise ─────────▶ Legacy
//! ```

use bft_types::{Address, Block, Header};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::traits::{BackendHandle, ChainReader};
use crate::validator::ValidatorSet;

/// Which round engine handles a header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMode {
    Legacy,
    Current,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::Legacy => write!(f, "legacy"),
            EngineMode::Current => write!(f, "current"),
        }
    }
}

/// Select the engine for a block at `number`.
///
/// `number` is `None` when neither a header nor a chain head is available.
pub fn select_mode(fork_height: Option<u64>, current_forced: bool, number: Option<u64>) -> EngineMode {
    if current_forced {
        return EngineMode::Current;
    }
    match (fork_height, number) {
        (None, _) => EngineMode::Legacy,
        (Some(0), _) => EngineMode::Current,
        (Some(fork), Some(n)) if n >= fork => EngineMode::Current,
        _ => EngineMode::Legacy,
    }
}

/// Result of a successful proposal check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The proposal is valid now
    Accepted,
    /// Not valid yet; ask again after the given delay (e.g. a block
    /// timestamped in the future)
    Deferred { retry_after: Duration },
}

/// Errors reported by round engines and cores
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid seal: {0}")]
    InvalidSeal(String),

    #[error("invalid committed seals")]
    InvalidCommittedSeals,

    #[error("invalid extra data: {0}")]
    InvalidExtraData(String),

    #[error("core error: {0}")]
    Core(String),
}

/// Header-level operations of one protocol variant
pub trait RoundEngine: Send + Sync + fmt::Debug {
    /// Address of the local validator as the engine sees it
    fn address(&self) -> Address;

    fn calc_difficulty(&self, parent: &Header) -> u64;

    /// Recover the proposer of a sealed header
    fn author(&self, header: &Header) -> Result<Address, EngineError>;

    /// Protocol-specific checks of a proposed block (seal, signer, timing)
    fn verify_block_proposal(
        &self,
        chain: &dyn ChainReader,
        block: &Block,
        validators: &ValidatorSet,
    ) -> Result<VerifyOutcome, EngineError>;

    /// Embed the commit round and committed seals into the header
    fn commit_header(&self, header: &mut Header, seals: &[Vec<u8>], round: u32) -> Result<(), EngineError>;

    /// Build a fresh round state machine for this protocol
    fn new_core(&self, backend: BackendHandle) -> Box<dyn RoundCore>;
}

/// A round state machine instance
pub trait RoundCore: Send + Sync {
    fn start(&self) -> Result<(), EngineError>;
    fn stop(&self) -> Result<(), EngineError>;
}

/// The two protocol variants a backend can route to
#[derive(Debug, Clone)]
pub struct EnginePair {
    legacy: Arc<dyn RoundEngine>,
    current: Arc<dyn RoundEngine>,
}

impl EnginePair {
    pub fn new(legacy: Arc<dyn RoundEngine>, current: Arc<dyn RoundEngine>) -> Self {
        Self { legacy, current }
    }

    pub fn get(&self, mode: EngineMode) -> &Arc<dyn RoundEngine> {
        match mode {
            EngineMode::Legacy => &self.legacy,
            EngineMode::Current => &self.current,
        }
    }
}
