// SPDX-License-Identifier: MIT OR Apache-2.0

//! Foundations shared by every cohort crate: content hashing, device identity
//! keys, canonical CBOR encoding and the cryptographic building blocks
//! (AEAD, key agreement, key derivation, sealed boxes, randomness).
pub mod cbor;
pub mod crypto;
pub mod hash;
pub mod identity;

pub use hash::{Hash, HashError};
pub use identity::{IdentityError, Signature, SigningKey, VerifyingKey};
