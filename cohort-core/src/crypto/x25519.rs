// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 Diffie-Hellman key agreement over Curve25519.
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key, zeroized on drop.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretKey(#[serde(with = "serde_bytes")] [u8; SECRET_KEY_SIZE]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Compute the shared secret between this key and a remote public key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        let their_public = x25519_dalek::PublicKey::from(their_public.0);
        secret.diffie_hellman(&their_public).to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey").field("key", &"***").finish()
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::SecretKey;

    #[test]
    fn shared_secret_agreement() {
        let rng = Rng::from_seed([1; 32]);

        let alice = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob = SecretKey::from_bytes(rng.random_array().unwrap());

        let alice_shared = alice.diffie_hellman(&bob.public_key());
        let bob_shared = bob.diffie_hellman(&alice.public_key());

        assert_eq!(alice_shared, bob_shared);
    }
}
