// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Core chain types shared by the BFT backend.

pub mod block;
pub mod primitives;

pub use block::{BftExtra, Block, Header, Proposal, ValidatorVote};
pub use primitives::{keccak256, Address, Hash};

/// Errors produced when parsing primitive types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypesError {
    #[error("Invalid length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Decoding error: {0}")]
    Decoding(String),
}
