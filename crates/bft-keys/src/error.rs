// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Error types for node key handling.

use thiserror::Error;

/// Errors that can occur during key operations.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Signer recovery failed: {0}")]
    Recovery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoding error: {0}")]
    Decoding(String),
}
