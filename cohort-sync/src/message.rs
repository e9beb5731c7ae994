// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire messages exchanged between two peers.
//!
//! Every message travels in an [`Envelope`] carrying a per-sender
//! monotonically increasing index; the connection releases envelopes to the
//! protocol strictly in index order, so the transport may reorder freely.
use cohort_auth::{Device, Link, ProofOfInvitation, Scope};
use cohort_core::crypto::sealed::SealedBox;
use cohort_core::{Hash, Signature};
use serde::{Deserialize, Serialize};

/// Opaque peer identifier assigned by the transport.
pub type PeerId = String;

/// Ordered wrapper around every wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub index: u64,
    pub payload: Message,
}

/// The identity a peer presents in its hello.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub user_id: String,
    pub device: Device,
}

/// A freshly generated identity challenge.
///
/// The prover signs the canonical encoding of the whole challenge, binding
/// the response to this scope, nonce and moment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub scope: Scope,
    #[serde(with = "serde_bytes")]
    pub nonce: [u8; 32],
    pub timestamp: u64,
}

/// Error kinds reported across the wire and in local events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The presented invitation was invalid, revoked or spent.
    RejectInvitation,
    /// The identity claim does not match the team.
    RejectIdentity,
    /// The delivered graph does not contain our invitation.
    RejectTeam,
    /// Both peers presented invitations; nobody can vouch for the team.
    NeitherIsMember,
    /// A state deadline elapsed.
    Timeout,
    /// A message arrived that the current state cannot accept.
    Unexpected,
    /// Graph synchronization failed integrity checks or stalled.
    SyncFailed,
    /// An internal failure on this side.
    Internal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Opening message of every connection.
    Hello {
        claim: IdentityClaim,
        proof_of_invitation: Option<ProofOfInvitation>,
    },

    /// Member → invitee: the serialized team graph after a valid proof.
    AcceptInvitation {
        #[serde(with = "serde_bytes")]
        graph: Vec<u8>,
    },

    ChallengeIdentity {
        challenge: Challenge,
    },

    ProveIdentity {
        challenge: Challenge,
        signature: Signature,
    },

    /// Challenge passed; carries the sender's session-key seed, sealed to
    /// the prover's device encryption key.
    AcceptIdentity {
        sealed_seed: SealedBox,
    },

    /// Announce our current graph shape.
    Update {
        root: Hash,
        head: Hash,
        hashes: Vec<Hash>,
    },

    /// Links the sender has and the recipient reported missing.
    MissingLinks {
        head: Hash,
        links: Vec<Link>,
    },

    /// The sender's session-key seed, sealed to the recipient's device
    /// encryption key; used on paths that skip the identity challenge.
    Seed {
        sealed_seed: SealedBox,
    },

    /// Injected locally when the team emits an update; never sent to peers.
    LocalUpdate {
        head: Hash,
    },

    Disconnect,

    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Message {
    /// Short name for log output.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::AcceptInvitation { .. } => "accept-invitation",
            Message::ChallengeIdentity { .. } => "challenge-identity",
            Message::ProveIdentity { .. } => "prove-identity",
            Message::AcceptIdentity { .. } => "accept-identity",
            Message::Update { .. } => "update",
            Message::MissingLinks { .. } => "missing-links",
            Message::Seed { .. } => "seed",
            Message::LocalUpdate { .. } => "local-update",
            Message::Disconnect => "disconnect",
            Message::Error { .. } => "error",
        }
    }
}
