// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated symmetric encryption with additional data
//! (AEAD) with 256-bit key, 128-bit tag and 192-bit nonce.
//!
//! The extended nonce is large enough to be drawn at random per message
//! without bookkeeping.
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use thiserror::Error;

pub const AEAD_KEY_SIZE: usize = 32;
pub const AEAD_NONCE_SIZE: usize = 24;

pub type AeadKey = [u8; AEAD_KEY_SIZE];

pub type AeadNonce = [u8; AEAD_NONCE_SIZE];

pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: aad.unwrap_or_default(),
            },
        )
        .map_err(|_| AeadError::Encrypt)?;
    Ok(ciphertext)
}

pub fn aead_decrypt(
    key: &AeadKey,
    ciphertext: &[u8],
    nonce: AeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: aad.unwrap_or_default(),
            },
        )
        .map_err(|_| AeadError::Decrypt)?;
    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("could not encrypt with aead")]
    Encrypt,

    /// Authentication tag verification failed; the ciphertext was made with a
    /// different key or has been tampered with.
    #[error("could not decrypt with aead")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{AeadError, AeadKey, AeadNonce, aead_decrypt, aead_encrypt};

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);

        let key: AeadKey = rng.random_array().unwrap();
        let nonce: AeadNonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, b"Hello, cohort!", nonce, None).unwrap();
        let plaintext = aead_decrypt(&key, &ciphertext, nonce, None).unwrap();

        assert_eq!(plaintext, b"Hello, cohort!");
    }

    #[test]
    fn decryption_failed() {
        let rng = Rng::from_seed([1; 32]);

        let key: AeadKey = rng.random_array().unwrap();
        let nonce: AeadNonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, b"Hello, cohort!", nonce, None).unwrap();

        let invalid_key: AeadKey = rng.random_array().unwrap();
        let result = aead_decrypt(&invalid_key, &ciphertext, nonce, None);

        assert!(matches!(result, Err(AeadError::Decrypt)));
    }

    #[test]
    fn aad_needs_to_match() {
        let rng = Rng::from_seed([2; 32]);

        let key: AeadKey = rng.random_array().unwrap();
        let nonce: AeadNonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, b"Hello, cohort!", nonce, Some(b"context")).unwrap();
        let result = aead_decrypt(&key, &ciphertext, nonce, Some(b"other context"));

        assert!(matches!(result, Err(AeadError::Decrypt)));
    }
}
