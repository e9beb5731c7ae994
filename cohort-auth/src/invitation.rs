// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-use invitation tokens.
//!
//! An invitation is a random 16-character seed shared out-of-band. From the
//! seed both sides derive the invitation id and an ephemeral signing keypair;
//! the inviter posts the public half on the graph, the invitee proves
//! possession of the seed by signing their own name with the derived secret.
//! No prior key exchange is needed and the seed never travels on the wire.
use cohort_core::cbor;
use cohort_core::crypto::{Rng, RngError};
use cohort_core::{Hash, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keyset::{KeysetWithSecrets, Scope};

/// Normalized length of an invitation seed.
pub const SEED_LENGTH: usize = 16;

const SEED_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Derived invitation identifier, posted on the graph.
pub type InvitationId = Hash;

/// The public record of an invitation, carried in an `Invite` action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,

    /// Public half of the seed-derived ephemeral signing key.
    pub public_key: VerifyingKey,

    /// Expiration as milliseconds since the epoch; 0 means no expiration.
    pub expiration: u64,

    pub max_uses: u32,

    /// Restricts the invitation to a specific user when set.
    pub user_id: Option<String>,
}

/// Proof that the presenter holds the invitation seed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfInvitation {
    pub id: InvitationId,
    pub user_id: String,
    pub signature: cohort_core::Signature,
}

/// Generate a fresh random seed in normalized form.
pub fn random_seed(rng: &Rng) -> Result<String, RngError> {
    let bytes: [u8; SEED_LENGTH] = rng.random_array()?;
    let seed = bytes
        .iter()
        .map(|byte| SEED_ALPHABET[*byte as usize % SEED_ALPHABET.len()] as char)
        .collect();
    Ok(seed)
}

/// Normalize a user-entered seed: strip whitespace and separators, lowercase,
/// enforce the fixed 16-letter shape.
pub fn normalize_seed(raw: &str) -> Result<String, InvitationError> {
    let seed: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();

    if seed.len() != SEED_LENGTH || !seed.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(InvitationError::InvalidSeed);
    }

    Ok(seed)
}

/// Derive the invitation id from a normalized seed.
pub fn derive_id(seed: &str) -> InvitationId {
    Hash::derive("cohort invitation id", seed.as_bytes())
}

/// Derive the ephemeral signing key from a normalized seed.
fn derive_signing_key(seed: &str) -> SigningKey {
    let bytes = Hash::derive("cohort invitation signing key", seed.as_bytes());
    SigningKey::from_bytes(*bytes.as_bytes())
}

/// Derive the starter member keyset an invitee uses until their first key
/// rotation.
pub fn starter_keys(seed: &str, user_id: &str) -> KeysetWithSecrets {
    KeysetWithSecrets::from_seed(Scope::member(user_id), seed.as_bytes())
}

/// Derive the starter device keyset for the invitee's first device.
pub fn starter_device_keys(seed: &str, device_id: &str) -> KeysetWithSecrets {
    KeysetWithSecrets::from_seed(Scope::device(device_id), seed.as_bytes())
}

/// Build the public invitation record for a normalized seed.
pub fn create(
    seed: &str,
    max_uses: u32,
    expiration: u64,
    user_id: Option<String>,
) -> Result<Invitation, InvitationError> {
    let seed = normalize_seed(seed)?;
    Ok(Invitation {
        id: derive_id(&seed),
        public_key: derive_signing_key(&seed).verifying_key(),
        expiration,
        max_uses,
        user_id,
    })
}

/// Produce a proof of invitation for the given user name.
pub fn generate_proof(seed: &str, user_id: &str) -> Result<ProofOfInvitation, InvitationError> {
    let seed = normalize_seed(seed)?;
    let id = derive_id(&seed);
    let signature = derive_signing_key(&seed).sign(&proof_payload(&id, user_id));
    Ok(ProofOfInvitation {
        id,
        user_id: user_id.to_string(),
        signature,
    })
}

/// Check a proof against the posted invitation record.
///
/// `now` is the observer's clock in milliseconds; during reduction it is the
/// admitting link's timestamp so that all peers agree on the outcome.
pub fn validate_proof(
    proof: &ProofOfInvitation,
    invitation: &Invitation,
    now: u64,
) -> Result<(), InvitationError> {
    if proof.id != invitation.id {
        return Err(InvitationError::ProofInvalid);
    }

    if invitation.expiration != 0 && now > invitation.expiration {
        return Err(InvitationError::Expired);
    }

    if let Some(user_id) = &invitation.user_id
        && user_id != &proof.user_id
    {
        return Err(InvitationError::ProofInvalid);
    }

    invitation
        .public_key
        .verify(&proof_payload(&proof.id, &proof.user_id), &proof.signature)
        .map_err(|_| InvitationError::ProofInvalid)
}

fn proof_payload(id: &InvitationId, user_id: &str) -> Vec<u8> {
    cbor::encode(&(id, user_id)).expect("proof payload is serializable")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvitationError {
    #[error("no invitation found for this id")]
    NotFound,

    #[error("invitation has been revoked")]
    Revoked,

    #[error("invitation has no uses left")]
    Exhausted,

    #[error("invitation has expired")]
    Expired,

    #[error("proof of invitation is not valid")]
    ProofInvalid,

    #[error("invitation belongs to a different team")]
    WrongTeam,

    #[error("seed must be 16 letters")]
    InvalidSeed,
}

#[cfg(test)]
mod tests {
    use cohort_core::crypto::Rng;

    use super::{
        InvitationError, create, derive_id, generate_proof, normalize_seed, random_seed,
        validate_proof,
    };

    #[test]
    fn normalization() {
        assert_eq!(
            normalize_seed(" Duck DUCK-goose cat ").unwrap(),
            "duckduckgoosecat"
        );
        assert!(matches!(
            normalize_seed("too short"),
            Err(InvitationError::InvalidSeed)
        ));
        assert!(matches!(
            normalize_seed("1234567890123456"),
            Err(InvitationError::InvalidSeed)
        ));
    }

    #[test]
    fn random_seed_is_normalized() {
        let rng = Rng::from_seed([1; 32]);
        let seed = random_seed(&rng).unwrap();
        assert_eq!(normalize_seed(&seed).unwrap(), seed);
    }

    #[test]
    fn proof_round_trip() {
        let seed = "duckduckgoosecat";
        let invitation = create(seed, 1, 0, None).unwrap();
        let proof = generate_proof(seed, "charlie").unwrap();

        assert_eq!(proof.id, derive_id(seed));
        assert!(validate_proof(&proof, &invitation, 100).is_ok());
    }

    #[test]
    fn wrong_seed_rejected() {
        let invitation = create("duckduckgoosecat", 1, 0, None).unwrap();
        let proof = generate_proof("anotherseedvalue", "charlie").unwrap();

        assert_eq!(
            validate_proof(&proof, &invitation, 100),
            Err(InvitationError::ProofInvalid)
        );
    }

    #[test]
    fn altered_user_rejected() {
        let seed = "duckduckgoosecat";
        let invitation = create(seed, 1, 0, None).unwrap();
        let mut proof = generate_proof(seed, "charlie").unwrap();
        proof.user_id = "mallory".to_string();

        assert_eq!(
            validate_proof(&proof, &invitation, 100),
            Err(InvitationError::ProofInvalid)
        );
    }

    #[test]
    fn expiration_enforced() {
        let seed = "duckduckgoosecat";
        let invitation = create(seed, 1, 50, None).unwrap();
        let proof = generate_proof(seed, "charlie").unwrap();

        assert!(validate_proof(&proof, &invitation, 40).is_ok());
        assert_eq!(
            validate_proof(&proof, &invitation, 60),
            Err(InvitationError::Expired)
        );
    }

    #[test]
    fn restricted_user_enforced() {
        let seed = "duckduckgoosecat";
        let invitation = create(seed, 1, 0, Some("charlie".to_string())).unwrap();

        let proof = generate_proof(seed, "charlie").unwrap();
        assert!(validate_proof(&proof, &invitation, 0).is_ok());

        let proof = generate_proof(seed, "mallory").unwrap();
        assert_eq!(
            validate_proof(&proof, &invitation, 0),
            Err(InvitationError::ProofInvalid)
        );
    }
}
