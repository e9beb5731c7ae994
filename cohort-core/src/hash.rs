// SPDX-License-Identifier: MIT OR Apache-2.0

//! BLAKE3 content hashes.
//!
//! Every link in a membership graph is addressed by the hash of its canonical
//! byte encoding, so `Hash` doubles as the node identifier in all graph
//! algorithms. It is `Copy` and totally ordered over its raw bytes, which
//! gives merge tie-breaking a stable, implementation-independent order.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a BLAKE3 digest in bytes.
pub const HASH_LEN: usize = 32;

/// 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "serde_bytes")] [u8; HASH_LEN]);

impl Hash {
    /// Hash the given bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buf.as_ref()).as_bytes())
    }

    /// Derive a hash from input key material in a named context.
    ///
    /// Used wherever a value needs to be bound to its purpose (invitation
    /// ids, session keys) so that material derived for one context can never
    /// be confused with another.
    pub fn derive(context: &str, material: &[u8]) -> Self {
        Self(blake3::derive_key(context, material))
    }

    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let checked: [u8; HASH_LEN] = value
            .try_into()
            .map_err(|_| HashError::InvalidLength(value.len(), HASH_LEN))?;
        Ok(Self(checked))
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(hex::decode(value)?.as_slice())
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.fmt_short())
    }
}

/// Error types for `Hash`.
#[derive(Debug, Error)]
pub enum HashError {
    /// Byte slice has the wrong length for a digest.
    #[error("invalid hash length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),

    /// Hash string contains invalid hexadecimal characters.
    #[error("invalid hex encoding in hash string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::{Hash, HashError};

    #[test]
    fn hashing_is_stable() {
        let hash = Hash::new(b"a very important message");
        let same = Hash::new(b"a very important message");
        let other = Hash::new(b"a different message");

        assert_eq!(hash, same);
        assert_ne!(hash, other);
    }

    #[test]
    fn hex_round_trip() {
        let hash = Hash::new([1, 2, 3]);
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn derivation_is_domain_separated() {
        let a = Hash::derive("cohort test context a", b"seed");
        let b = Hash::derive("cohort test context b", b"seed");
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_length() {
        let bytes = vec![254, 100, 4, 7];
        let result: Result<Hash, HashError> = bytes.as_slice().try_into();
        assert!(matches!(result, Err(HashError::InvalidLength(4, 32))));
    }

    #[test]
    fn invalid_hex_encoding() {
        let result: Result<Hash, HashError> = "notreallyahexstring".parse();
        assert!(matches!(result, Err(HashError::InvalidHexEncoding(_))));
    }
}
