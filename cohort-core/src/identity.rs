// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 signing identities.
//!
//! Every device holds a signing keypair; link signatures and identity-proof
//! challenges are detached Ed25519 signatures made with it. Team, role and
//! member keysets carry signing keypairs of the same shape.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const SIGNING_KEY_SIZE: usize = 32;
pub const VERIFYING_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 secret signing key.
///
/// The raw seed is zeroized on drop and never printed.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SigningKey(#[serde(with = "serde_bytes")] [u8; SIGNING_KEY_SIZE]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; SIGNING_KEY_SIZE] {
        self.0
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        VerifyingKey(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(bytes).to_bytes())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("seed", &"***").finish()
    }
}

/// Ed25519 public verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerifyingKey(#[serde(with = "serde_bytes")] [u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; VERIFYING_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), IdentityError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(bytes, &signature)
            .map_err(|_| IdentityError::VerificationFailed)
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({})", hex::encode(&self.0[..6]))
    }
}

impl FromStr for VerifyingKey {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value).map_err(|_| IdentityError::InvalidPublicKey)?;
        let checked: [u8; VERIFYING_KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(checked))
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..6]))
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("signature does not match public key and payload")]
    VerificationFailed,

    #[error("bytes do not encode a valid ed25519 public key")]
    InvalidPublicKey,
}
