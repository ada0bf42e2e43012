// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Node identity for the BFT backend.
//!
//! This crate provides:
//! - A secp256k1 node key with Keccak-256 address derivation
//! - Recoverable signatures and signer recovery
//! - Node key file storage

pub mod crypto;
pub mod error;
pub mod keypair_file;

pub use crypto::{
    public_key_to_address, recover_address, recover_address_from_digest, NodeKey,
    DIGEST_LENGTH, SIGNATURE_LENGTH,
};
pub use error::KeyError;
pub use keypair_file::{read_node_key, write_node_key};
