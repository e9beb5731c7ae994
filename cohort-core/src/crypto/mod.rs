// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic building blocks.
//!
//! - XChaCha20-Poly1305 AEAD for symmetric encryption
//! - X25519 Diffie-Hellman key agreement
//! - HKDF-SHA256 key derivation
//! - Sealed boxes (ephemeral X25519 + HKDF + AEAD) for asymmetric envelopes
//! - ChaCha20 random number generator, seeded via the operating system
pub mod aead;
pub mod hkdf;
mod rng;
pub mod sealed;
mod secret;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
