// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lockboxes deliver keyset secrets to the holder of another keyset.
//!
//! A lockbox is a sealed envelope whose plaintext is a [`KeysetWithSecrets`]
//! and whose recipient is the encryption key of a different keyset. The set
//! of lockboxes carried on a team's graph forms a directed graph over
//! scopes: a device keyset opens its member's lockbox, the member keyset
//! opens the team and role lockboxes, and so on. Key rotation replaces the
//! affected lockboxes one generation up while leaving earlier generations in
//! place, so old ciphertext stays readable.
use std::collections::{HashSet, VecDeque};

use cohort_core::cbor;
use cohort_core::crypto::sealed::{self, SealedBox, SealedBoxError};
use cohort_core::crypto::{Rng, RngError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keyset::{KeysetPublic, KeysetWithSecrets, Scope};

/// The keyset a lockbox is addressed to, identified by scope, generation and
/// public encryption key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockboxRecipient {
    pub scope: Scope,
    pub generation: u32,
    pub encryption_key: cohort_core::crypto::x25519::PublicKey,
}

/// A sealed keyset envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockbox {
    pub recipient: LockboxRecipient,

    /// Scope of the keyset inside; visible so peers can reason about the
    /// lockbox graph without opening anything.
    pub contents_scope: Scope,

    /// Generation of the keyset inside.
    pub contents_generation: u32,

    sealed: SealedBox,
}

impl Lockbox {
    /// Seal `contents` to the holder of `recipient`'s encryption key.
    pub fn create(
        contents: &KeysetWithSecrets,
        recipient: &KeysetPublic,
        rng: &Rng,
    ) -> Result<Self, LockboxError> {
        if contents.scope == recipient.scope {
            return Err(LockboxError::SelfAddressed(contents.scope.clone()));
        }

        let plaintext = cbor::encode(contents).expect("keyset is serializable");
        let sealed = sealed::seal(&recipient.encryption, &plaintext, rng)?;

        Ok(Self {
            recipient: LockboxRecipient {
                scope: recipient.scope.clone(),
                generation: recipient.generation,
                encryption_key: recipient.encryption,
            },
            contents_scope: contents.scope.clone(),
            contents_generation: contents.generation,
            sealed,
        })
    }

    /// Open the lockbox with the recipient keyset's secrets.
    pub fn open(&self, recipient: &KeysetWithSecrets) -> Result<KeysetWithSecrets, LockboxError> {
        if recipient.scope != self.recipient.scope
            || recipient.generation != self.recipient.generation
            || recipient.encryption.public_key() != self.recipient.encryption_key
        {
            return Err(LockboxError::WrongRecipient {
                expected: self.recipient.scope.clone(),
                actual: recipient.scope.clone(),
            });
        }

        let plaintext = sealed::open(&self.sealed, &recipient.encryption)
            .map_err(|_| LockboxError::InvalidCiphertext)?;
        let contents: KeysetWithSecrets =
            cbor::decode(&plaintext).map_err(|_| LockboxError::InvalidCiphertext)?;

        // The cleartext metadata must agree with what was actually sealed.
        if contents.scope != self.contents_scope || contents.generation != self.contents_generation
        {
            return Err(LockboxError::InvalidCiphertext);
        }

        Ok(contents)
    }

    /// Replace this lockbox with one carrying a newer generation of the same
    /// scope's keyset.
    pub fn rotate(
        &self,
        new_contents: &KeysetWithSecrets,
        recipient: &KeysetPublic,
        rng: &Rng,
    ) -> Result<Self, LockboxError> {
        if new_contents.scope != self.contents_scope {
            return Err(LockboxError::RotationScopeMismatch {
                old: self.contents_scope.clone(),
                new: new_contents.scope.clone(),
            });
        }
        Self::create(new_contents, recipient, rng)
    }
}

/// All scopes transitively reachable from `scope` by following lockboxes.
///
/// The starting scope itself is not included.
pub fn visible_scopes(lockboxes: &[Lockbox], scope: &Scope) -> Vec<Scope> {
    let mut visible = Vec::new();
    let mut seen: HashSet<Scope> = HashSet::new();
    seen.insert(scope.clone());

    let mut queue: VecDeque<Scope> = VecDeque::new();
    queue.push_back(scope.clone());

    while let Some(current) = queue.pop_front() {
        for lockbox in lockboxes {
            if lockbox.recipient.scope == current && seen.insert(lockbox.contents_scope.clone()) {
                visible.push(lockbox.contents_scope.clone());
                queue.push_back(lockbox.contents_scope.clone());
            }
        }
    }

    visible
}

/// All keysets (with secrets) reachable from the given keyset.
///
/// Walks the lockbox graph breadth-first, opening every lockbox addressed to
/// a keyset already in hand. Lockboxes that fail to open are skipped; a
/// recipient holding current keys never depends on being able to open
/// envelopes addressed to someone else.
pub fn visible_keys(lockboxes: &[Lockbox], keyset: &KeysetWithSecrets) -> Vec<KeysetWithSecrets> {
    let mut opened: Vec<KeysetWithSecrets> = Vec::new();
    let mut seen: HashSet<(Scope, u32)> = HashSet::new();
    seen.insert((keyset.scope.clone(), keyset.generation));

    let mut queue: VecDeque<KeysetWithSecrets> = VecDeque::new();
    queue.push_back(keyset.clone());

    while let Some(current) = queue.pop_front() {
        for lockbox in lockboxes {
            if lockbox.recipient.scope != current.scope
                || lockbox.recipient.generation != current.generation
            {
                continue;
            }
            if seen.contains(&(lockbox.contents_scope.clone(), lockbox.contents_generation)) {
                continue;
            }
            match lockbox.open(&current) {
                Ok(contents) => {
                    seen.insert((contents.scope.clone(), contents.generation));
                    opened.push(contents.clone());
                    queue.push_back(contents);
                }
                Err(err) => {
                    tracing::debug!(%err, recipient = %lockbox.recipient.scope, "skipping unopenable lockbox");
                }
            }
        }
    }

    opened
}

#[derive(Debug, Error)]
pub enum LockboxError {
    /// A lockbox must be addressed to a different scope than its contents.
    #[error("lockbox for {0} cannot be addressed to its own scope")]
    SelfAddressed(Scope),

    /// The lockbox was made for a different keyset.
    #[error("lockbox was sealed for {expected}, not {actual}")]
    WrongRecipient { expected: Scope, actual: Scope },

    /// Authentication failed when opening the envelope.
    #[error("lockbox ciphertext is invalid")]
    InvalidCiphertext,

    /// Rotation must keep the contents scope identical.
    #[error("cannot rotate lockbox for {old} to contents for {new}")]
    RotationScopeMismatch { old: Scope, new: Scope },

    #[error(transparent)]
    Sealed(#[from] SealedBoxError),

    #[error(transparent)]
    Rand(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use cohort_core::crypto::Rng;

    use crate::keyset::{KeysetWithSecrets, Scope};

    use super::{Lockbox, LockboxError, visible_keys, visible_scopes};

    fn keyset(scope: Scope, rng: &Rng) -> KeysetWithSecrets {
        KeysetWithSecrets::generate(scope, rng).unwrap()
    }

    #[test]
    fn create_and_open() {
        let rng = Rng::from_seed([1; 32]);
        let team = keyset(Scope::team(), &rng);
        let member = keyset(Scope::member("alice"), &rng);

        let lockbox = Lockbox::create(&team, &member.public(), &rng).unwrap();
        let contents = lockbox.open(&member).unwrap();

        assert_eq!(contents.scope, Scope::team());
        assert_eq!(contents.public(), team.public());
    }

    #[test]
    fn wrong_recipient() {
        let rng = Rng::from_seed([1; 32]);
        let team = keyset(Scope::team(), &rng);
        let alice = keyset(Scope::member("alice"), &rng);
        let bob = keyset(Scope::member("bob"), &rng);

        let lockbox = Lockbox::create(&team, &alice.public(), &rng).unwrap();
        let result = lockbox.open(&bob);

        assert!(matches!(result, Err(LockboxError::WrongRecipient { .. })));
    }

    #[test]
    fn self_addressed_rejected() {
        let rng = Rng::from_seed([1; 32]);
        let team = keyset(Scope::team(), &rng);

        let result = Lockbox::create(&team, &team.public(), &rng);
        assert!(matches!(result, Err(LockboxError::SelfAddressed(_))));
    }

    #[test]
    fn rotation_keeps_scope() {
        let rng = Rng::from_seed([1; 32]);
        let team = keyset(Scope::team(), &rng);
        let member = keyset(Scope::member("alice"), &rng);

        let lockbox = Lockbox::create(&team, &member.public(), &rng).unwrap();

        let team_next = team.rotated(&rng).unwrap();
        let rotated = lockbox.rotate(&team_next, &member.public(), &rng).unwrap();
        assert_eq!(rotated.contents_generation, 1);

        let role = keyset(Scope::role("managers"), &rng);
        let result = lockbox.rotate(&role, &member.public(), &rng);
        assert!(matches!(
            result,
            Err(LockboxError::RotationScopeMismatch { .. })
        ));
    }

    #[test]
    fn visibility_is_transitive() {
        let rng = Rng::from_seed([1; 32]);
        let team = keyset(Scope::team(), &rng);
        let member = keyset(Scope::member("alice"), &rng);
        let device = keyset(Scope::device("alice laptop"), &rng);

        let lockboxes = vec![
            Lockbox::create(&team, &member.public(), &rng).unwrap(),
            Lockbox::create(&member, &device.public(), &rng).unwrap(),
        ];

        let scopes = visible_scopes(&lockboxes, &Scope::device("alice laptop"));
        assert_eq!(scopes, vec![Scope::member("alice"), Scope::team()]);

        let keys = visible_keys(&lockboxes, &device);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].scope, Scope::member("alice"));
        assert_eq!(keys[1].scope, Scope::team());
    }
}
