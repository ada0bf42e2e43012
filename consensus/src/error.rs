// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Backend error types

use bft_keys::KeyError;
use bft_types::Hash;
use thiserror::Error;

use crate::engine::EngineError;

/// Errors returned by the consensus backend
///
/// None of these are retried inside the backend. Verification and
/// signature errors go back to the immediate caller; `EngineSwitchover`
/// leaves the node without a running engine.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The proposal is not a block
    #[error("invalid proposal")]
    InvalidProposal,

    /// The block is on the bad-block list
    #[error("blacklisted block: {0}")]
    BlacklistedBlock(Hash),

    /// The snapshot walk reached a header the chain does not have
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// The recovered signer does not match the claimed address
    #[error("invalid signature")]
    InvalidSignature,

    /// Headers handed to a snapshot are not contiguous with it
    #[error("invalid voting chain")]
    InvalidVotingChain,

    /// A header was sealed by an account outside the validator set
    #[error("unauthorized proposer")]
    UnauthorizedProposer,

    #[error("engine already started")]
    EngineStarted,

    #[error("engine not started")]
    EngineStopped,

    /// Switching to the current protocol failed; the node must restart
    #[error("engine switchover failed: {0}")]
    EngineSwitchover(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("snapshot store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint counters could not be registered
    #[error("metrics error: {0}")]
    Metrics(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
