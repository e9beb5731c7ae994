// SPDX-License-Identifier: MIT OR Apache-2.0

//! The pairwise connection protocol.
//!
//! One [`Connection`] per remote peer. The machine is pure with respect to
//! time and transport: callers feed it envelopes (`deliver`), local team
//! updates (`local_update`) and clock readings; it queues outgoing envelopes
//! and events which the caller drains after every input. Timeouts are
//! expressed as a deadline the driver is expected to watch.
//!
//! Protocol phases: hello (with optional invitation handoff), mutual
//! identity challenge, graph synchronization, session-key negotiation, then
//! live updates until either side disconnects.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use cohort_auth::{ProofOfInvitation, Scope, Team};
use cohort_core::cbor;
use cohort_core::crypto::sealed::{self, SealedBox};
use cohort_core::crypto::{Rng, Secret};
use cohort_core::Hash;
use tracing::{debug, warn};

use crate::message::{Challenge, Envelope, ErrorKind, IdentityClaim, Message, PeerId};

/// Deadline for every state that expects a message, in milliseconds.
pub const TIMEOUT_MS: u64 = 7_000;

/// Consecutive no-progress update exchanges tolerated before giving up.
const MAX_STALLED_ROUNDS: u32 = 3;

/// Progress of proving our identity to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProveStatus {
    AwaitingChallenge,
    AwaitingAcceptance,
    Done,
}

/// Progress of verifying the peer's identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyStatus {
    AwaitingHello,
    AwaitingProof,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We asked to stop.
    LocalRequest,
    /// The peer sent a disconnect.
    RemoteRequest,
    /// The peer (or we ourselves) no longer appear in the team.
    PeerRemoved,
    /// A protocol failure; details in the accompanying error event.
    Error(ErrorKind),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// We presented an invitation and wait for the team graph.
    AwaitingAcceptance,
    /// Mutual identity verification, both directions in parallel.
    Connecting {
        proving: ProveStatus,
        verifying: VerifyStatus,
    },
    Synchronizing,
    /// Heads agree; waiting for the peer's session-key seed.
    Negotiating,
    Connected,
    Disconnected { reason: DisconnectReason },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected { .. })
    }

    /// Short name for log output.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AwaitingAcceptance => "awaiting-acceptance",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Synchronizing => "synchronizing",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected { .. } => "disconnected",
        }
    }
}

/// Events surfaced to the application.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
        details: String,
    },
    /// We detected a failure.
    LocalError { kind: ErrorKind, details: String },
    /// The peer reported a failure.
    RemoteError { kind: ErrorKind, details: String },
    /// The team changed as a result of links received on this connection.
    Updated { head: Hash },
}

/// Shared handle to the team a connection reads and appends to.
///
/// `None` until an invitee has adopted the graph delivered to them.
pub type TeamHandle = Arc<RwLock<Option<Team>>>;

/// A per-peer connection state machine.
pub struct Connection {
    local_id: PeerId,
    peer_id: PeerId,
    team: TeamHandle,
    /// Present when we are joining by invitation.
    invitation_seed: Option<String>,
    context: cohort_auth::LocalContext,
    rng: Rng,

    state: ConnectionState,
    out_index: u64,
    next_in: u64,
    pending: BTreeMap<u64, Envelope>,

    our_seed: Secret<32>,
    their_seed: Option<Secret<32>>,
    session_key: Option<Secret<32>>,

    their_claim: Option<IdentityClaim>,
    issued_challenge: Option<Challenge>,
    their_head: Option<Hash>,
    stalled_rounds: u32,

    deadline: Option<u64>,
    outbox: VecDeque<Envelope>,
    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    /// Connection for an existing team member.
    pub fn new_member(
        local_id: PeerId,
        peer_id: PeerId,
        team: TeamHandle,
        rng: Rng,
    ) -> Result<Self, ConnectionError> {
        let context = {
            let guard = team.read().map_err(|_| ConnectionError::Poisoned)?;
            let team = guard.as_ref().ok_or(ConnectionError::NoTeam)?;
            team.context().clone()
        };
        Self::new(local_id, peer_id, team, None, context, rng)
    }

    /// Connection for an invitee holding a seed; `team` is filled once the
    /// peer accepts the invitation.
    pub fn new_invitee(
        local_id: PeerId,
        peer_id: PeerId,
        team: TeamHandle,
        seed: impl Into<String>,
        context: cohort_auth::LocalContext,
        rng: Rng,
    ) -> Result<Self, ConnectionError> {
        Self::new(local_id, peer_id, team, Some(seed.into()), context, rng)
    }

    fn new(
        local_id: PeerId,
        peer_id: PeerId,
        team: TeamHandle,
        invitation_seed: Option<String>,
        context: cohort_auth::LocalContext,
        rng: Rng,
    ) -> Result<Self, ConnectionError> {
        let our_seed = Secret::from_bytes(rng.random_array().map_err(|_| ConnectionError::Rng)?);
        Ok(Self {
            local_id,
            peer_id,
            team,
            invitation_seed,
            context,
            rng,
            state: ConnectionState::Idle,
            out_index: 0,
            next_in: 0,
            pending: BTreeMap::new(),
            our_seed,
            their_seed: None,
            session_key: None,
            their_claim: None,
            issued_challenge: None,
            their_head: None,
            stalled_rounds: 0,
            deadline: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The negotiated session key, available once connected.
    pub fn session_key(&self) -> Option<&Secret<32>> {
        self.session_key.as_ref()
    }

    /// When the current wait expires, in milliseconds.
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Drain queued outgoing envelopes.
    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    /// Drain queued events.
    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    /// Open the connection: introduce ourselves, with proof of invitation if
    /// we hold one.
    pub fn start(&mut self, now: u64) {
        let proof = match self.proof_of_invitation() {
            Ok(proof) => proof,
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        };
        let claim = IdentityClaim {
            user_id: self.context.user.user_id.clone(),
            device: self.context.device.to_device(),
        };
        self.send(Message::Hello {
            claim,
            proof_of_invitation: proof.clone(),
        });

        self.state = if proof.is_some() {
            ConnectionState::AwaitingAcceptance
        } else {
            ConnectionState::Connecting {
                proving: ProveStatus::AwaitingChallenge,
                verifying: VerifyStatus::AwaitingHello,
            }
        };
        self.arm_deadline(now);
    }

    /// Feed one envelope from the transport.
    ///
    /// Envelopes are buffered and released strictly in index order; an
    /// envelope from the past is dropped as a duplicate.
    pub fn deliver(&mut self, envelope: Envelope, now: u64) {
        if self.state.is_disconnected() {
            return;
        }
        if envelope.index < self.next_in {
            debug!(index = envelope.index, "dropping duplicate envelope");
            return;
        }
        self.pending.insert(envelope.index, envelope);
        while let Some(envelope) = self.pending.remove(&self.next_in) {
            self.next_in += 1;
            self.on_message(envelope.payload, now);
            if self.state.is_disconnected() {
                self.pending.clear();
                break;
            }
        }
    }

    /// The local team changed; push our new head to the peer.
    pub fn local_update(&mut self, head: Hash, now: u64) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Synchronizing => {
                debug!(head = %head.fmt_short(), "announcing local update");
                self.send_update();
                if self.state.is_connected() {
                    self.state = ConnectionState::Synchronizing;
                    self.arm_deadline(now);
                }
            }
            _ => {}
        }
    }

    /// Close the connection deliberately.
    pub fn stop(&mut self, now: u64) {
        if self.state.is_disconnected() {
            return;
        }
        self.send(Message::Disconnect);
        self.disconnect(DisconnectReason::LocalRequest, "stopped locally", now);
    }

    /// The driver observed the deadline pass.
    pub fn on_timeout(&mut self, now: u64) {
        let expired = self.deadline.is_some_and(|deadline| now >= deadline);
        if expired && !self.state.is_connected() && !self.state.is_disconnected() {
            self.fail(
                ErrorKind::Timeout,
                format!("timed out in state \"{}\"", self.state.name()),
                now,
            );
        }
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    fn on_message(&mut self, message: Message, now: u64) {
        debug!(
            peer = %self.peer_id,
            state = self.state.name(),
            message = message.name(),
            "handling message"
        );
        match message {
            Message::Hello {
                claim,
                proof_of_invitation,
            } => self.on_hello(claim, proof_of_invitation, now),
            Message::AcceptInvitation { graph } => self.on_accept_invitation(&graph, now),
            Message::ChallengeIdentity { challenge } => self.on_challenge(challenge, now),
            Message::ProveIdentity {
                challenge,
                signature,
            } => self.on_prove(challenge, signature, now),
            Message::AcceptIdentity { sealed_seed } => self.on_seed(sealed_seed, now),
            Message::Seed { sealed_seed } => self.on_seed(sealed_seed, now),
            Message::Update { root, head, hashes } => self.on_update(root, head, hashes, now),
            Message::MissingLinks { head, links } => self.on_missing_links(head, links, now),
            Message::LocalUpdate { head } => self.local_update(head, now),
            Message::Disconnect => {
                self.disconnect(DisconnectReason::RemoteRequest, "peer disconnected", now);
            }
            Message::Error { kind, message } => {
                self.events.push_back(ConnectionEvent::RemoteError {
                    kind,
                    details: message.clone(),
                });
                self.disconnect(DisconnectReason::Error(kind), &message, now);
            }
        }
    }

    fn on_hello(
        &mut self,
        claim: IdentityClaim,
        proof: Option<ProofOfInvitation>,
        now: u64,
    ) {
        self.their_claim = Some(claim.clone());

        if let Some(proof) = proof {
            if self.invitation_seed.is_some() {
                self.send_error(
                    ErrorKind::NeitherIsMember,
                    "both peers presented invitations",
                    now,
                );
                return;
            }
            self.admit_peer(claim, proof, now);
            return;
        }

        if self.invitation_seed.is_some() {
            // The member's own hello; we keep waiting for the graph.
            return;
        }

        // Member to member: the claimed user and device must be active in
        // our copy of the team.
        let check = self.with_team(|team| {
            let state = team.state();
            if !state.has_member(&claim.user_id) {
                if state.removed_members.contains_key(&claim.user_id) {
                    return Err((ErrorKind::RejectIdentity, "member was removed from the team"));
                }
                return Err((ErrorKind::RejectIdentity, "claimed member is not on the team"));
            }
            if state.device(&claim.device.device_id).is_none() {
                if state.removed_devices.contains_key(&claim.device.device_id) {
                    return Err((ErrorKind::RejectIdentity, "device was removed from the team"));
                }
                return Err((ErrorKind::RejectIdentity, "claimed device is not on the team"));
            }
            Ok(())
        });
        match check {
            Ok(Ok(())) => {}
            Ok(Err((kind, details))) => {
                self.send_error(kind, details, now);
                return;
            }
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        }

        let challenge = Challenge {
            scope: Scope::device(claim.device.device_id.clone()),
            nonce: match self.rng.random_array() {
                Ok(nonce) => nonce,
                Err(err) => {
                    self.fail(ErrorKind::Internal, err.to_string(), now);
                    return;
                }
            },
            timestamp: now,
        };
        self.issued_challenge = Some(challenge.clone());
        self.send(Message::ChallengeIdentity { challenge });

        if let ConnectionState::Connecting { verifying, .. } = &mut self.state {
            *verifying = VerifyStatus::AwaitingProof;
        }
        self.arm_deadline(now);
    }

    /// Validate an invitee's proof and hand them the team.
    fn admit_peer(&mut self, claim: IdentityClaim, proof: ProofOfInvitation, now: u64) {
        let outcome = self.with_team(|team| {
            let state = team.state();
            let Some(entry) = state.invitation(&proof.id) else {
                return Err("no such invitation");
            };
            if entry.revoked {
                return Err("invitation was revoked");
            }
            if entry.remaining_uses == 0 {
                return Err("invitation is spent");
            }
            if cohort_auth::invitation::validate_proof(&proof, &entry.invitation, now).is_err() {
                return Err("proof of invitation is invalid");
            }
            team.save().map_err(|_| "could not serialize team")
        });
        match outcome {
            Ok(Ok(graph)) => {
                debug!(peer = %self.peer_id, invitee = %claim.user_id, "accepting invitation");
                self.send(Message::AcceptInvitation { graph });
                self.send_our_seed(&claim, now);
                self.enter_synchronizing(now);
            }
            Ok(Err(details)) => {
                self.send_error(ErrorKind::RejectInvitation, details, now);
            }
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
            }
        }
    }

    /// We are the invitee and the peer handed us the team graph.
    fn on_accept_invitation(&mut self, graph: &[u8], now: u64) {
        if self.state != ConnectionState::AwaitingAcceptance {
            self.send_error(ErrorKind::Unexpected, "not awaiting an invitation", now);
            return;
        }
        let Some(seed) = self.invitation_seed.clone() else {
            self.send_error(ErrorKind::Unexpected, "no invitation seed", now);
            return;
        };

        let child_rng = match self.rng.random_array() {
            Ok(seed_bytes) => Rng::from_seed(seed_bytes),
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        };
        let team = match Team::join(graph, &seed, self.context.clone(), child_rng) {
            Ok(team) => team,
            Err(err) => {
                self.send_error(ErrorKind::RejectTeam, &err.to_string(), now);
                return;
            }
        };

        let write_ok = {
            let write_result = self.team.write();
            match write_result {
                Ok(mut slot) => {
                    *slot = Some(team);
                    true
                }
                Err(_) => false,
            }
        };
        if !write_ok {
            self.fail(ErrorKind::Internal, "team handle poisoned", now);
            return;
        }

        if let Some(claim) = self.their_claim.clone() {
            self.send_our_seed(&claim, now);
        }
        self.enter_synchronizing(now);
    }

    /// The peer challenged us; sign and return.
    fn on_challenge(&mut self, challenge: Challenge, now: u64) {
        if challenge.scope != Scope::device(&self.context.device.device_id) {
            self.send_error(ErrorKind::RejectIdentity, "challenge names another device", now);
            return;
        }
        let payload = challenge_payload(&challenge);
        let signature = self.context.device.keys.signing.sign(&payload);
        self.send(Message::ProveIdentity {
            challenge,
            signature,
        });
        if let ConnectionState::Connecting { proving, .. } = &mut self.state {
            *proving = ProveStatus::AwaitingAcceptance;
        }
        self.arm_deadline(now);
    }

    /// The peer answered our challenge.
    fn on_prove(&mut self, challenge: Challenge, signature: cohort_core::Signature, now: u64) {
        let Some(issued) = self.issued_challenge.clone() else {
            self.send_error(ErrorKind::Unexpected, "no challenge outstanding", now);
            return;
        };
        if challenge != issued {
            self.send_error(ErrorKind::RejectIdentity, "answered a different challenge", now);
            return;
        }
        if now.saturating_sub(issued.timestamp) > TIMEOUT_MS {
            self.send_error(ErrorKind::RejectIdentity, "challenge has expired", now);
            return;
        }

        // Verify against the device key recorded on the team, never the one
        // the peer claims.
        let device_id = issued.scope.name.clone();
        let verified = self.with_team(|team| {
            let Some(device) = team.state().device(&device_id) else {
                return false;
            };
            device
                .keys
                .signing
                .verify(&challenge_payload(&issued), &signature)
                .is_ok()
        });
        match verified {
            Ok(true) => {}
            Ok(false) => {
                self.send_error(ErrorKind::RejectIdentity, "challenge response mismatch", now);
                return;
            }
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        }

        let Some(claim) = self.their_claim.clone() else {
            self.send_error(ErrorKind::Unexpected, "prove before hello", now);
            return;
        };
        let sealed = match sealed::seal(
            &claim.device.keys.encryption,
            self.our_seed.as_bytes(),
            &self.rng,
        ) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        };
        self.send(Message::AcceptIdentity { sealed_seed: sealed });

        if let ConnectionState::Connecting { verifying, .. } = &mut self.state {
            *verifying = VerifyStatus::Done;
        }
        self.maybe_finish_connecting(now);
    }

    /// The peer's seed half arrived (identity acceptance or explicit seed).
    fn on_seed(&mut self, sealed_seed: SealedBox, now: u64) {
        let opened = sealed::open(&sealed_seed, &self.context.device.keys.encryption);
        let seed = match opened {
            Ok(bytes) => match <[u8; 32]>::try_from(bytes.as_slice()) {
                Ok(bytes) => Secret::from_bytes(bytes),
                Err(_) => {
                    self.send_error(ErrorKind::RejectIdentity, "seed has the wrong shape", now);
                    return;
                }
            },
            Err(_) => {
                self.send_error(ErrorKind::RejectIdentity, "seed was not sealed to us", now);
                return;
            }
        };
        self.their_seed = Some(seed);

        if let ConnectionState::Connecting { proving, .. } = &mut self.state {
            *proving = ProveStatus::Done;
        }
        self.maybe_finish_connecting(now);
        self.try_negotiate(now);
    }

    fn on_update(&mut self, root: Hash, head: Hash, hashes: Vec<Hash>, now: u64) {
        match self.state {
            ConnectionState::Synchronizing
            | ConnectionState::Negotiating
            | ConnectionState::Connected => {}
            _ => {
                self.send_error(ErrorKind::Unexpected, "update before identity", now);
                return;
            }
        }

        let comparison = self.with_team(|team| {
            let graph = team.graph();
            if graph.root() != root {
                return Err("update names a different team");
            }
            let theirs: std::collections::HashSet<Hash> = hashes.into_iter().collect();
            Ok((graph.head(), graph.links_missing_from(&theirs)))
        });
        let (our_head, missing) = match comparison {
            Ok(Ok(result)) => result,
            Ok(Err(details)) => {
                self.send_error(ErrorKind::RejectTeam, details, now);
                return;
            }
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        };

        let head_changed = self.their_head != Some(head);
        self.their_head = Some(head);

        if head == our_head {
            self.try_negotiate(now);
            return;
        }

        if self.state.is_connected() {
            self.state = ConnectionState::Synchronizing;
        }

        if missing.is_empty() {
            // Nothing to offer; announce our own shape so the peer can
            // compute what we lack. Watch for stalls.
            if head_changed {
                self.stalled_rounds = 0;
                self.send_update();
            } else {
                self.stalled_rounds += 1;
                if self.stalled_rounds > MAX_STALLED_ROUNDS {
                    self.fail(ErrorKind::SyncFailed, "synchronization stalled", now);
                    return;
                }
            }
        } else {
            self.stalled_rounds = 0;
            self.send(Message::MissingLinks {
                head: our_head,
                links: missing,
            });
        }
        self.arm_deadline(now);
    }

    fn on_missing_links(&mut self, head: Hash, links: Vec<cohort_auth::Link>, now: u64) {
        if !matches!(
            self.state,
            ConnectionState::Synchronizing | ConnectionState::Negotiating | ConnectionState::Connected
        ) {
            self.send_error(ErrorKind::Unexpected, "links before identity", now);
            return;
        }

        let merged = self.with_team_mut(|team| team.merge_links(links, head));
        let new_head = match merged {
            Ok(Ok(head)) => head,
            Ok(Err(err)) => {
                warn!(%err, "rejecting links from peer");
                self.send_error(ErrorKind::SyncFailed, &err.to_string(), now);
                return;
            }
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        };

        self.stalled_rounds = 0;
        self.their_head = Some(head);
        self.events
            .push_back(ConnectionEvent::Updated { head: new_head });

        // The merge may have revealed that someone lost their seat.
        if let Some(removed) = self.removed_party() {
            self.send(Message::Disconnect);
            self.disconnect(DisconnectReason::PeerRemoved, &removed, now);
            return;
        }

        self.send_update();
        self.try_negotiate(now);
        if !self.state.is_disconnected() && !self.state.is_connected() {
            self.arm_deadline(now);
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn maybe_finish_connecting(&mut self, now: u64) {
        if let ConnectionState::Connecting {
            proving: ProveStatus::Done,
            verifying: VerifyStatus::Done,
        } = self.state
        {
            self.enter_synchronizing(now);
        }
    }

    fn enter_synchronizing(&mut self, now: u64) {
        debug!(peer = %self.peer_id, "synchronizing");
        self.state = ConnectionState::Synchronizing;
        self.send_update();
        self.arm_deadline(now);
    }

    /// Once heads agree and both seeds are in hand, derive the session key.
    fn try_negotiate(&mut self, now: u64) {
        if self.state.is_connected() || self.state.is_disconnected() {
            return;
        }
        let heads_agree = match self.with_team(|team| Some(team.graph().head()) == self.their_head)
        {
            Ok(agree) => agree,
            Err(_) => false,
        };
        if !heads_agree {
            return;
        }

        let Some(their_seed) = &self.their_seed else {
            self.state = ConnectionState::Negotiating;
            self.arm_deadline(now);
            return;
        };

        // Order-independent: both sides concatenate the smaller seed first.
        let ours = self.our_seed.as_bytes();
        let theirs = their_seed.as_bytes();
        let (first, second) = if ours <= theirs {
            (ours, theirs)
        } else {
            (theirs, ours)
        };
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(first);
        material.extend_from_slice(second);
        let key = Hash::derive("cohort session key", &material);
        let first_time = self.session_key.is_none();
        self.session_key = Some(Secret::from_bytes(*key.as_bytes()));

        self.state = ConnectionState::Connected;
        self.deadline = None;
        if first_time {
            self.events.push_back(ConnectionEvent::Connected);
        }
        debug!(peer = %self.peer_id, "connected");
    }

    fn disconnect(&mut self, reason: DisconnectReason, details: &str, _now: u64) {
        if self.state.is_disconnected() {
            return;
        }
        debug!(peer = %self.peer_id, ?reason, details, "disconnecting");
        self.state = ConnectionState::Disconnected {
            reason: reason.clone(),
        };
        self.deadline = None;
        self.pending.clear();
        // The session key dies with the connection.
        self.session_key = None;
        self.events.push_back(ConnectionEvent::Disconnected {
            reason,
            details: details.to_string(),
        });
    }

    /// We detected a failure: tell the peer, emit, disconnect.
    fn fail(&mut self, kind: ErrorKind, details: impl Into<String>, now: u64) {
        let details = details.into();
        self.events.push_back(ConnectionEvent::LocalError {
            kind,
            details: details.clone(),
        });
        self.send(Message::Error {
            kind,
            message: details.clone(),
        });
        self.disconnect(DisconnectReason::Error(kind), &details, now);
    }

    fn send_error(&mut self, kind: ErrorKind, details: &str, now: u64) {
        self.fail(kind, details, now);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn proof_of_invitation(&self) -> Result<Option<ProofOfInvitation>, ConnectionError> {
        match &self.invitation_seed {
            Some(seed) => {
                let proof =
                    cohort_auth::invitation::generate_proof(seed, &self.context.user.user_id)
                        .map_err(|_| ConnectionError::BadSeed)?;
                Ok(Some(proof))
            }
            None => Ok(None),
        }
    }

    fn send_our_seed(&mut self, claim: &IdentityClaim, now: u64) {
        let sealed = match sealed::seal(
            &claim.device.keys.encryption,
            self.our_seed.as_bytes(),
            &self.rng,
        ) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.fail(ErrorKind::Internal, err.to_string(), now);
                return;
            }
        };
        self.send(Message::Seed { sealed_seed: sealed });
    }

    fn send_update(&mut self) {
        let update = self.with_team(|team| {
            let graph = team.graph();
            Message::Update {
                root: graph.root(),
                head: graph.head(),
                hashes: graph.hashes(),
            }
        });
        if let Ok(update) = update {
            self.send(update);
        }
    }

    /// Check whether either party disappeared from the team after a merge.
    fn removed_party(&self) -> Option<String> {
        let peer_user = self.their_claim.as_ref().map(|claim| claim.user_id.clone());
        self.with_team(|team| {
            let state = team.state();
            if let Some(peer_user) = &peer_user
                && !state.has_member(peer_user)
            {
                return Some(format!("{peer_user} is no longer on the team"));
            }
            if !state.has_member(&self.context.user.user_id) {
                return Some("we are no longer on the team".to_string());
            }
            None
        })
        .ok()
        .flatten()
    }

    fn send(&mut self, payload: Message) {
        let envelope = Envelope {
            sender: self.local_id.clone(),
            recipient: self.peer_id.clone(),
            index: self.out_index,
            payload,
        };
        self.out_index += 1;
        self.outbox.push_back(envelope);
    }

    fn arm_deadline(&mut self, now: u64) {
        if !self.state.is_connected() && !self.state.is_disconnected() {
            self.deadline = Some(now + TIMEOUT_MS);
        }
    }

    fn with_team<R>(
        &self,
        f: impl FnOnce(&Team) -> R,
    ) -> Result<R, ConnectionError> {
        let guard = self.team.read().map_err(|_| ConnectionError::Poisoned)?;
        let team = guard.as_ref().ok_or(ConnectionError::NoTeam)?;
        Ok(f(team))
    }

    fn with_team_mut<R>(
        &self,
        f: impl FnOnce(&mut Team) -> R,
    ) -> Result<R, ConnectionError> {
        let mut guard = self.team.write().map_err(|_| ConnectionError::Poisoned)?;
        let team = guard.as_mut().ok_or(ConnectionError::NoTeam)?;
        Ok(f(team))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_id)
            .field("state", &self.state.name())
            .finish()
    }
}

/// Canonical bytes a challenge response signs.
fn challenge_payload(challenge: &Challenge) -> Vec<u8> {
    cbor::encode(challenge).expect("challenge is serializable")
}

/// Internal failures of the connection plumbing; protocol-level failures are
/// reported through events instead.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("team handle is poisoned")]
    Poisoned,

    #[error("no team available yet")]
    NoTeam,

    #[error("invitation seed is malformed")]
    BadSeed,

    #[error("random generator failed")]
    Rng,
}

/// The shared surface of authenticated and anonymous connections, used by
/// the coordinator to drive a heterogeneous set of peers.
pub trait ConnectionLike: Send {
    fn start(&mut self, now: u64);
    fn deliver(&mut self, envelope: Envelope, now: u64);
    fn local_update(&mut self, head: Hash, now: u64);
    fn stop(&mut self, now: u64);
    fn on_timeout(&mut self, now: u64);
    fn deadline(&self) -> Option<u64>;
    fn is_connected(&self) -> bool;
    fn peer_id(&self) -> &PeerId;
    fn take_outbox(&mut self) -> Vec<Envelope>;
    fn take_events(&mut self) -> Vec<ConnectionEvent>;
}

impl ConnectionLike for Connection {
    fn start(&mut self, now: u64) {
        Connection::start(self, now);
    }

    fn deliver(&mut self, envelope: Envelope, now: u64) {
        Connection::deliver(self, envelope, now);
    }

    fn local_update(&mut self, head: Hash, now: u64) {
        Connection::local_update(self, head, now);
    }

    fn stop(&mut self, now: u64) {
        Connection::stop(self, now);
    }

    fn on_timeout(&mut self, now: u64) {
        Connection::on_timeout(self, now);
    }

    fn deadline(&self) -> Option<u64> {
        Connection::deadline(self)
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn peer_id(&self) -> &PeerId {
        Connection::peer_id(self)
    }

    fn take_outbox(&mut self) -> Vec<Envelope> {
        Connection::take_outbox(self)
    }

    fn take_events(&mut self) -> Vec<ConnectionEvent> {
        Connection::take_events(self)
    }
}
