// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sealed boxes: asymmetric envelopes readable only by the holder of a
//! specific X25519 secret key.
//!
//! Sealing generates an ephemeral X25519 keypair, derives an AEAD key from
//! the Diffie-Hellman shared secret via HKDF and encrypts the payload with
//! XChaCha20-Poly1305. The ephemeral public key and nonce travel with the
//! ciphertext; the ephemeral secret is discarded, so not even the sender can
//! open the box afterwards.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aead::{AeadError, AeadKey, AeadNonce, aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};

const SEALED_BOX_INFO: &[u8] = b"cohort sealed box v1";

/// An asymmetric envelope addressed to one X25519 public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Ephemeral public half generated for this envelope.
    pub ephemeral_key: PublicKey,

    /// Random AEAD nonce.
    #[serde(with = "serde_bytes")]
    pub nonce: [u8; 24],

    /// Encrypted payload with appended authentication tag.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Encrypt a payload to the holder of `recipient`'s secret key.
pub fn seal(
    recipient: &PublicKey,
    plaintext: &[u8],
    rng: &Rng,
) -> Result<SealedBox, SealedBoxError> {
    let ephemeral_secret = SecretKey::from_bytes(rng.random_array()?);
    let ephemeral_key = ephemeral_secret.public_key();

    let key = derive_key(
        &ephemeral_secret.diffie_hellman(recipient),
        &ephemeral_key,
        recipient,
    )?;
    let nonce: AeadNonce = rng.random_array()?;
    let ciphertext = aead_encrypt(&key, plaintext, nonce, Some(SEALED_BOX_INFO))?;

    Ok(SealedBox {
        ephemeral_key,
        nonce,
        ciphertext,
    })
}

/// Decrypt an envelope with the recipient's secret key.
///
/// Fails with [`SealedBoxError::Aead`] when the envelope was sealed to a
/// different key or has been tampered with.
pub fn open(sealed: &SealedBox, recipient_secret: &SecretKey) -> Result<Vec<u8>, SealedBoxError> {
    let recipient = recipient_secret.public_key();
    let key = derive_key(
        &recipient_secret.diffie_hellman(&sealed.ephemeral_key),
        &sealed.ephemeral_key,
        &recipient,
    )?;
    let plaintext = aead_decrypt(&key, &sealed.ciphertext, sealed.nonce, Some(SEALED_BOX_INFO))?;
    Ok(plaintext)
}

/// Bind the AEAD key to both public halves so an envelope cannot be re-routed
/// to another recipient.
fn derive_key(
    shared_secret: &[u8; 32],
    ephemeral_key: &PublicKey,
    recipient: &PublicKey,
) -> Result<AeadKey, SealedBoxError> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_key.as_bytes());
    salt.extend_from_slice(recipient.as_bytes());
    let key = hkdf(&salt, shared_secret, Some(SEALED_BOX_INFO))?;
    Ok(key)
}

#[derive(Debug, Error)]
pub enum SealedBoxError {
    #[error(transparent)]
    Rand(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Aead(#[from] AeadError),
}
