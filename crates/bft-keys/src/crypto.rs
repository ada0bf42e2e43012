// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Node identity: a secp256k1 signing key and the address derived from it.
//!
//! Signatures are 65 bytes, `r || s || v`, where `v` is the recovery id.
//! The signer of a message is recovered from the signature rather than
//! carried next to it, so a validator's identity on the wire is just its
//! address.

use bft_types::{keccak256, Address};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use std::fmt;

use crate::error::KeyError;

/// Length of a recoverable signature in bytes.
pub const SIGNATURE_LENGTH: usize = 65;

/// Length of a prehashed digest accepted by `sign_without_hashing`.
pub const DIGEST_LENGTH: usize = 32;

/// The node's private signing key.
///
/// The key never leaves this type; callers only ever see signatures and
/// the derived address. `SigningKey` zeroizes its scalar on drop.
pub struct NodeKey {
    signing_key: SigningKey,
    address: Address,
}

impl NodeKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Create from a raw 32-byte secret scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| KeyError::InvalidKeyFormat(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Create from a hex-encoded secret, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = zeroize::Zeroizing::new(
            hex::decode(s).map_err(|e| KeyError::Decoding(e.to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = public_key_to_address(signing_key.verifying_key());
        Self { signing_key, address }
    }

    /// The address derived from this key's public key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Hash `data` with Keccak-256, then sign the digest.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let digest = keccak256(data);
        self.sign_digest(digest.as_bytes())
    }

    /// Sign a digest the caller has already computed.
    pub fn sign_without_hashing(&self, digest: &[u8]) -> Result<Vec<u8>, KeyError> {
        if digest.len() != DIGEST_LENGTH {
            return Err(KeyError::Signing(format!(
                "digest must be {} bytes, got {}",
                DIGEST_LENGTH,
                digest.len()
            )));
        }
        self.sign_digest(digest)
    }

    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, KeyError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte());
        Ok(out)
    }

    /// Hex-encoded secret, for writing key files.
    pub(crate) fn secret_hex(&self) -> zeroize::Zeroizing<String> {
        zeroize::Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Address = last 20 bytes of Keccak-256 over the uncompressed public key
/// without its `0x04` prefix.
pub fn public_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest.as_bytes()[12..]);
    Address(addr)
}

/// Recover the signer of `data` (hashed with Keccak-256) from a
/// 65-byte recoverable signature.
pub fn recover_address(data: &[u8], signature: &[u8]) -> Result<Address, KeyError> {
    let digest = keccak256(data);
    recover_address_from_digest(digest.as_bytes(), signature)
}

/// Recover the signer of an already-hashed digest.
pub fn recover_address_from_digest(digest: &[u8], signature: &[u8]) -> Result<Address, KeyError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(KeyError::InvalidSignatureFormat(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| KeyError::InvalidSignatureFormat(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature[64]).ok_or_else(|| {
        KeyError::InvalidSignatureFormat(format!("invalid recovery id {}", signature[64]))
    })?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|e| KeyError::Recovery(e.to_string()))?;
    Ok(public_key_to_address(&key))
}
