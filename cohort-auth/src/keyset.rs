// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generational keysets.
//!
//! A keyset bundles a signing keypair and an encryption keypair under a
//! *scope*: the team itself, a role, a member, a device, a server or an
//! ephemeral principal such as an invitation. Every scope starts at
//! generation 0; each rotation mints fresh key material one generation up.
//! Generations only ever move forward, which is what lets peers agree on
//! "current keys" without coordination.
use std::fmt;

use cohort_core::crypto::x25519;
use cohort_core::crypto::{Rng, RngError};
use cohort_core::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed name of the team scope.
pub const TEAM_SCOPE_NAME: &str = "TEAM";

/// What a keyset belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScopeType {
    Team,
    Role,
    Member,
    Device,
    Server,
    Ephemeral,
}

/// The subject a keyset is bound to.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub name: String,
}

impl Scope {
    pub fn team() -> Self {
        Self {
            scope_type: ScopeType::Team,
            name: TEAM_SCOPE_NAME.to_string(),
        }
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Role,
            name: name.into(),
        }
    }

    pub fn member(user_id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Member,
            name: user_id.into(),
        }
    }

    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Device,
            name: device_id.into(),
        }
    }

    pub fn server(host: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Server,
            name: host.into(),
        }
    }

    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Ephemeral,
            name: name.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.scope_type {
            ScopeType::Team => "team",
            ScopeType::Role => "role",
            ScopeType::Member => "member",
            ScopeType::Device => "device",
            ScopeType::Server => "server",
            ScopeType::Ephemeral => "ephemeral",
        };
        write!(f, "{prefix}:{}", self.name)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({self})")
    }
}

/// Public halves of a keyset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetPublic {
    pub scope: Scope,
    pub generation: u32,
    pub signing: VerifyingKey,
    pub encryption: x25519::PublicKey,
}

/// A keyset including its secret halves.
///
/// Never serialized outside a lockbox or a sealed keyring; secrets zeroize
/// when the containing key types drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeysetWithSecrets {
    pub scope: Scope,
    pub generation: u32,
    pub signing: SigningKey,
    pub encryption: x25519::SecretKey,
}

impl KeysetWithSecrets {
    /// Generate a fresh generation-0 keyset for the given scope.
    pub fn generate(scope: Scope, rng: &Rng) -> Result<Self, KeysetError> {
        Ok(Self {
            scope,
            generation: 0,
            signing: SigningKey::from_bytes(rng.random_array()?),
            encryption: x25519::SecretKey::from_bytes(rng.random_array()?),
        })
    }

    /// Derive a keyset deterministically from a seed.
    ///
    /// Both parties to an invitation derive the same starter keys from the
    /// shared seed, so possession of the seed is provable without any prior
    /// key exchange.
    pub fn from_seed(scope: Scope, seed: &[u8]) -> Self {
        let mut material = Vec::with_capacity(seed.len() + scope.name.len() + 1);
        material.extend_from_slice(scope.name.as_bytes());
        material.push(0x00);
        material.extend_from_slice(seed);

        let signing = cohort_core::Hash::derive("cohort seed signing key", &material);
        let encryption = cohort_core::Hash::derive("cohort seed encryption key", &material);

        Self {
            scope,
            generation: 0,
            signing: SigningKey::from_bytes(*signing.as_bytes()),
            encryption: x25519::SecretKey::from_bytes(*encryption.as_bytes()),
        }
    }

    /// Mint the next generation of this keyset with fresh key material.
    pub fn rotated(&self, rng: &Rng) -> Result<Self, KeysetError> {
        Ok(Self {
            scope: self.scope.clone(),
            generation: self.generation + 1,
            signing: SigningKey::from_bytes(rng.random_array()?),
            encryption: x25519::SecretKey::from_bytes(rng.random_array()?),
        })
    }

    pub fn public(&self) -> KeysetPublic {
        KeysetPublic {
            scope: self.scope.clone(),
            generation: self.generation,
            signing: self.signing.verifying_key(),
            encryption: self.encryption.public_key(),
        }
    }
}

impl fmt::Debug for KeysetWithSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysetWithSecrets")
            .field("scope", &self.scope)
            .field("generation", &self.generation)
            .field("secrets", &"***")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeysetError {
    #[error(transparent)]
    Rand(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use cohort_core::crypto::Rng;

    use super::{KeysetWithSecrets, Scope};

    #[test]
    fn seed_derivation_is_deterministic() {
        let a = KeysetWithSecrets::from_seed(Scope::ephemeral("inv"), b"duckduckgoosecat");
        let b = KeysetWithSecrets::from_seed(Scope::ephemeral("inv"), b"duckduckgoosecat");
        let c = KeysetWithSecrets::from_seed(Scope::ephemeral("inv"), b"anotherseedvalue");

        assert_eq!(a.public(), b.public());
        assert_ne!(a.public(), c.public());
    }

    #[test]
    fn rotation_increments_generation() {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeysetWithSecrets::generate(Scope::team(), &rng).unwrap();
        let next = keys.rotated(&rng).unwrap();

        assert_eq!(keys.generation, 0);
        assert_eq!(next.generation, 1);
        assert_eq!(next.scope, keys.scope);
        assert_ne!(next.public().signing, keys.public().signing);
    }
}
