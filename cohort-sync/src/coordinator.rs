// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multiplexing many shares over one transport.
//!
//! The coordinator owns a set of shares, each either a private team or a
//! public anonymous group. When the transport announces a peer it
//! optimistically opens one connection per share; at most one will
//! authenticate and reach `connected`. Inbound envelopes for connections
//! that do not exist yet are buffered until they do. Outbound application
//! traffic for a peer is routed to the connected share with the lowest id.
use std::collections::{BTreeMap, HashMap, VecDeque};

use cohort_auth::keyset::{KeysetWithSecrets, Scope};
use cohort_core::crypto::sealed::{self, SealedBox};
use cohort_core::crypto::{Rng, Secret};
use cohort_core::Hash;
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionLike, DisconnectReason, TIMEOUT_MS,
    TeamHandle,
};
use crate::message::{Envelope, ErrorKind, IdentityClaim, Message, PeerId};

/// Identifies one share within the coordinator; ordering decides routing
/// preference.
pub type ShareId = String;

/// What a share holds.
pub enum Share {
    /// A private team; `None` inside the handle until an invitee has joined.
    Team(TeamHandle),
    /// An anonymous public group: knowing the share id is the capability.
    Public,
}

struct ShareEntry {
    share: Share,
    /// Document ids the application associates with this share.
    documents: Vec<String>,
}

/// Envelope tagged with the share it belongs to.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShareEnvelope {
    pub share_id: ShareId,
    pub envelope: Envelope,
}

/// The per-process connection coordinator.
pub struct Coordinator {
    local_id: PeerId,
    rng: Rng,
    shares: BTreeMap<ShareId, ShareEntry>,
    connections: BTreeMap<(ShareId, PeerId), Box<dyn ConnectionLike>>,
    buffered: HashMap<(ShareId, PeerId), Vec<Envelope>>,
    outgoing: VecDeque<ShareEnvelope>,
    events: VecDeque<(ShareId, PeerId, ConnectionEvent)>,
}

impl Coordinator {
    pub fn new(local_id: impl Into<PeerId>, rng: Rng) -> Self {
        Self {
            local_id: local_id.into(),
            rng,
            shares: BTreeMap::new(),
            connections: BTreeMap::new(),
            buffered: HashMap::new(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Register a share. Connections for it are opened as peers appear.
    pub fn add_share(&mut self, share_id: impl Into<ShareId>, share: Share) {
        self.shares.insert(
            share_id.into(),
            ShareEntry {
                share,
                documents: Vec::new(),
            },
        );
    }

    /// Associate an application document with a share.
    pub fn add_document(&mut self, share_id: &str, document_id: impl Into<String>) {
        if let Some(entry) = self.shares.get_mut(share_id) {
            entry.documents.push(document_id.into());
        }
    }

    pub fn documents(&self, share_id: &str) -> &[String] {
        self.shares
            .get(share_id)
            .map(|entry| entry.documents.as_slice())
            .unwrap_or(&[])
    }

    /// Drop a share and every connection belonging to it.
    pub fn remove_share(&mut self, share_id: &str, now: u64) {
        self.shares.remove(share_id);
        let keys: Vec<(ShareId, PeerId)> = self
            .connections
            .keys()
            .filter(|(id, _)| id == share_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut connection) = self.connections.remove(&key) {
                connection.stop(now);
                self.collect(&key.0, &mut connection);
            }
        }
    }

    /// A new peer candidate appeared on the transport: optimistically open
    /// one connection per share and flush anything buffered for it.
    pub fn on_peer_candidate(&mut self, peer_id: &PeerId, now: u64) {
        let share_ids: Vec<ShareId> = self.shares.keys().cloned().collect();
        for share_id in share_ids {
            if self.connections.contains_key(&(share_id.clone(), peer_id.clone())) {
                continue;
            }
            match self.open_connection(&share_id, peer_id) {
                Ok(mut connection) => {
                    debug!(%share_id, %peer_id, "opening connection");
                    connection.start(now);
                    let key = (share_id.clone(), peer_id.clone());
                    for envelope in self.buffered.remove(&key).unwrap_or_default() {
                        connection.deliver(envelope, now);
                    }
                    self.collect(&share_id, &mut connection);
                    self.connections.insert(key, connection);
                }
                Err(err) => {
                    warn!(%share_id, %peer_id, %err, "could not open connection");
                }
            }
        }
    }

    fn open_connection(
        &self,
        share_id: &ShareId,
        peer_id: &PeerId,
    ) -> Result<Box<dyn ConnectionLike>, ConnectionError> {
        let entry = self.shares.get(share_id).ok_or(ConnectionError::NoTeam)?;
        let child_rng = Rng::from_seed(self.rng.random_array().map_err(|_| ConnectionError::Rng)?);
        match &entry.share {
            Share::Team(team) => Ok(Box::new(Connection::new_member(
                self.local_id.clone(),
                peer_id.clone(),
                team.clone(),
                child_rng,
            )?)),
            Share::Public => Ok(Box::new(AnonymousConnection::new(
                self.local_id.clone(),
                peer_id.clone(),
                child_rng,
            )?)),
        }
    }

    /// Deliver an inbound envelope, buffering it when no connection exists
    /// for its share and sender yet.
    pub fn deliver(&mut self, message: ShareEnvelope, now: u64) {
        let key = (message.share_id.clone(), message.envelope.sender.clone());
        if let Some(mut connection) = self.connections.remove(&key) {
            connection.deliver(message.envelope, now);
            self.collect(&key.0, &mut connection);
            self.connections.insert(key, connection);
        } else {
            debug!(share_id = %message.share_id, peer = %message.envelope.sender, "buffering early envelope");
            self.buffered.entry(key).or_default().push(message.envelope);
        }
    }

    /// Tell every connection of a share about a local team update.
    pub fn local_update(&mut self, share_id: &str, head: Hash, now: u64) {
        let keys: Vec<(ShareId, PeerId)> = self
            .connections
            .keys()
            .filter(|(id, _)| id == share_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut connection) = self.connections.remove(&key) {
                connection.local_update(head, now);
                self.collect(&key.0, &mut connection);
                self.connections.insert(key, connection);
            }
        }
    }

    /// The share an outbound message for this peer should use: the lowest
    /// connected share id.
    pub fn route(&self, peer_id: &PeerId) -> Option<&ShareId> {
        self.connections
            .iter()
            .filter(|((_, peer), connection)| peer == peer_id && connection.is_connected())
            .map(|((share_id, _), _)| share_id)
            .next()
    }

    /// Advance deadline timers.
    pub fn tick(&mut self, now: u64) {
        let keys: Vec<(ShareId, PeerId)> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                connection
                    .deadline()
                    .is_some_and(|deadline| now >= deadline)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(mut connection) = self.connections.remove(&key) {
                connection.on_timeout(now);
                self.collect(&key.0, &mut connection);
                self.connections.insert(key, connection);
            }
        }
    }

    /// Stop every connection to a peer (transport loss).
    pub fn on_peer_lost(&mut self, peer_id: &PeerId, now: u64) {
        let keys: Vec<(ShareId, PeerId)> = self
            .connections
            .keys()
            .filter(|(_, peer)| peer == peer_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut connection) = self.connections.remove(&key) {
                connection.stop(now);
                self.collect(&key.0, &mut connection);
            }
        }
    }

    /// Drain outgoing envelopes for the transport.
    pub fn take_outgoing(&mut self) -> Vec<ShareEnvelope> {
        self.outgoing.drain(..).collect()
    }

    /// Drain connection events for the application.
    pub fn take_events(&mut self) -> Vec<(ShareId, PeerId, ConnectionEvent)> {
        self.events.drain(..).collect()
    }

    /// The state of one connection, if it exists.
    pub fn is_connected(&self, share_id: &str, peer_id: &PeerId) -> bool {
        self.connections
            .get(&(share_id.to_string(), peer_id.clone()))
            .is_some_and(|connection| connection.is_connected())
    }

    fn collect(&mut self, share_id: &ShareId, connection: &mut Box<dyn ConnectionLike>) {
        for envelope in connection.take_outbox() {
            self.outgoing.push_back(ShareEnvelope {
                share_id: share_id.clone(),
                envelope,
            });
        }
        let peer_id = connection.peer_id().clone();
        for event in connection.take_events() {
            self.events
                .push_back((share_id.clone(), peer_id.clone(), event));
        }
    }
}

/// Connection for anonymous public shares.
///
/// No team backs these; holding the share id is the capability. Both sides
/// present an ephemeral keyset in their hello and exchange sealed seeds, so
/// the session still gets a fresh key.
pub struct AnonymousConnection {
    local_id: PeerId,
    peer_id: PeerId,
    keys: KeysetWithSecrets,
    rng: Rng,

    state: AnonymousState,
    out_index: u64,
    next_in: u64,
    pending: BTreeMap<u64, Envelope>,

    our_seed: Secret<32>,
    their_seed: Option<Secret<32>>,
    session_key: Option<Secret<32>>,
    their_claim: Option<IdentityClaim>,

    deadline: Option<u64>,
    outbox: VecDeque<Envelope>,
    events: VecDeque<ConnectionEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AnonymousState {
    Idle,
    AwaitingSeed,
    Connected,
    Disconnected,
}

impl AnonymousConnection {
    pub fn new(local_id: PeerId, peer_id: PeerId, rng: Rng) -> Result<Self, ConnectionError> {
        let keys = KeysetWithSecrets::generate(Scope::ephemeral(&local_id), &rng)
            .map_err(|_| ConnectionError::Rng)?;
        let our_seed = Secret::from_bytes(rng.random_array().map_err(|_| ConnectionError::Rng)?);
        Ok(Self {
            local_id,
            peer_id,
            keys,
            rng,
            state: AnonymousState::Idle,
            out_index: 0,
            next_in: 0,
            pending: BTreeMap::new(),
            our_seed,
            their_seed: None,
            session_key: None,
            their_claim: None,
            deadline: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn session_key(&self) -> Option<&Secret<32>> {
        self.session_key.as_ref()
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

    fn on_message(&mut self, message: Message, now: u64) {
        match message {
            Message::Hello { claim, .. } => {
                let sealed = match sealed::seal(
                    &claim.device.keys.encryption,
                    self.our_seed.as_bytes(),
                    &self.rng,
                ) {
                    Ok(sealed) => sealed,
                    Err(_) => {
                        self.disconnect(DisconnectReason::Error(ErrorKind::Internal), now);
                        return;
                    }
                };
                self.their_claim = Some(claim);
                self.send(Message::Seed { sealed_seed: sealed });
                self.try_connect(now);
            }
            Message::Seed { sealed_seed } => self.on_seed(sealed_seed, now),
            Message::Disconnect => self.disconnect(DisconnectReason::RemoteRequest, now),
            Message::Error { kind, message } => {
                self.events.push_back(ConnectionEvent::RemoteError {
                    kind,
                    details: message,
                });
                self.disconnect(DisconnectReason::Error(kind), now);
            }
            other => {
                debug!(message = other.name(), "anonymous connection ignoring message");
            }
        }
    }

    fn on_seed(&mut self, sealed_seed: SealedBox, now: u64) {
        match sealed::open(&sealed_seed, &self.keys.encryption) {
            Ok(bytes) => {
                if let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    self.their_seed = Some(Secret::from_bytes(bytes));
                    self.try_connect(now);
                }
            }
            Err(_) => {
                self.events.push_back(ConnectionEvent::LocalError {
                    kind: ErrorKind::RejectIdentity,
                    details: "seed was not sealed to us".to_string(),
                });
                self.disconnect(DisconnectReason::Error(ErrorKind::RejectIdentity), now);
            }
        }
    }

    fn try_connect(&mut self, _now: u64) {
        if self.state == AnonymousState::Connected {
            return;
        }
        let (Some(their_seed), Some(_)) = (&self.their_seed, &self.their_claim) else {
            return;
        };
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
        self.session_key = Some(Secret::from_bytes(*key.as_bytes()));
        self.state = AnonymousState::Connected;
        self.deadline = None;
        self.events.push_back(ConnectionEvent::Connected);
    }

    fn disconnect(&mut self, reason: DisconnectReason, _now: u64) {
        if self.state == AnonymousState::Disconnected {
            return;
        }
        self.state = AnonymousState::Disconnected;
        self.session_key = None;
        self.deadline = None;
        self.pending.clear();
        self.events.push_back(ConnectionEvent::Disconnected {
            reason,
            details: String::new(),
        });
    }
}

impl ConnectionLike for AnonymousConnection {
    fn start(&mut self, now: u64) {
        let claim = IdentityClaim {
            user_id: "*".to_string(),
            device: cohort_auth::Device {
                device_id: self.local_id.clone(),
                user_id: "*".to_string(),
                keys: self.keys.public(),
            },
        };
        self.send(Message::Hello {
            claim,
            proof_of_invitation: None,
        });
        self.state = AnonymousState::AwaitingSeed;
        self.deadline = Some(now + TIMEOUT_MS);
    }

    fn deliver(&mut self, envelope: Envelope, now: u64) {
        if self.state == AnonymousState::Disconnected || envelope.index < self.next_in {
            return;
        }
        self.pending.insert(envelope.index, envelope);
        while let Some(envelope) = self.pending.remove(&self.next_in) {
            self.next_in += 1;
            self.on_message(envelope.payload, now);
            if self.state == AnonymousState::Disconnected {
                self.pending.clear();
                break;
            }
        }
    }

    fn local_update(&mut self, _head: Hash, _now: u64) {
        // Anonymous groups carry no team to update.
    }

    fn stop(&mut self, now: u64) {
        if self.state != AnonymousState::Disconnected {
            self.send(Message::Disconnect);
            self.disconnect(DisconnectReason::LocalRequest, now);
        }
    }

    fn on_timeout(&mut self, now: u64) {
        let expired = self.deadline.is_some_and(|deadline| now >= deadline);
        if expired && self.state == AnonymousState::AwaitingSeed {
            self.events.push_back(ConnectionEvent::LocalError {
                kind: ErrorKind::Timeout,
                details: "timed out waiting for peer".to_string(),
            });
            self.disconnect(DisconnectReason::Error(ErrorKind::Timeout), now);
        }
    }

    fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    fn is_connected(&self) -> bool {
        self.state == AnonymousState::Connected
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn take_outbox(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    fn take_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use cohort_auth::Team;
    use cohort_auth::test_utils::{context_for, member_record};
    use cohort_core::crypto::Rng;

    use crate::connection::{Connection, ConnectionEvent};

    use super::{Coordinator, Share, ShareEnvelope};

    /// Shuttle envelopes between two coordinators until both go quiet.
    fn pump(a: &mut Coordinator, b: &mut Coordinator, now: u64) {
        for _ in 0..100 {
            let from_a = a.take_outgoing();
            let from_b = b.take_outgoing();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for message in from_a {
                b.deliver(message, now);
            }
            for message in from_b {
                a.deliver(message, now);
            }
        }
        panic!("coordinators never went quiet");
    }

    #[test]
    fn anonymous_shares_connect_and_route_to_lowest_id() {
        let mut a = Coordinator::new("peer-a", Rng::from_seed([1; 32]));
        let mut b = Coordinator::new("peer-b", Rng::from_seed([2; 32]));
        for coordinator in [&mut a, &mut b] {
            coordinator.add_share("alpha", Share::Public);
            coordinator.add_share("beta", Share::Public);
        }

        a.on_peer_candidate(&"peer-b".to_string(), 0);
        b.on_peer_candidate(&"peer-a".to_string(), 0);
        pump(&mut a, &mut b, 0);

        assert!(a.is_connected("alpha", &"peer-b".to_string()));
        assert!(a.is_connected("beta", &"peer-b".to_string()));
        assert_eq!(a.route(&"peer-b".to_string()), Some(&"alpha".to_string()));
        assert_eq!(b.route(&"peer-a".to_string()), Some(&"alpha".to_string()));
    }

    #[test]
    fn early_envelopes_are_buffered_until_the_connection_exists() {
        let mut alice_team =
            Team::create("spies", context_for("alice"), Rng::from_seed([1; 32])).unwrap();
        alice_team
            .add_member(member_record("bob", false), vec![])
            .unwrap();
        let bytes = alice_team.save().unwrap();
        let bob_team = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

        let mut coordinator = Coordinator::new("alice-laptop", Rng::from_seed([3; 32]));
        coordinator.add_share("team-share", Share::Team(Arc::new(RwLock::new(Some(alice_team)))));

        // bob's first messages arrive before the transport announces him.
        let mut bob = Connection::new_member(
            "bob-laptop".into(),
            "alice-laptop".into(),
            Arc::new(RwLock::new(Some(bob_team))),
            Rng::from_seed([4; 32]),
        )
        .unwrap();
        bob.start(0);
        for envelope in bob.take_outbox() {
            coordinator.deliver(
                ShareEnvelope {
                    share_id: "team-share".to_string(),
                    envelope,
                },
                0,
            );
        }
        assert!(
            coordinator.take_outgoing().is_empty(),
            "nothing happens before the peer is announced"
        );

        coordinator.on_peer_candidate(&"bob-laptop".to_string(), 0);

        // The buffered hello was processed: drive the handshake to the end.
        for _ in 0..20 {
            let outgoing = coordinator.take_outgoing();
            if outgoing.is_empty() && bob.take_outbox().is_empty() {
                break;
            }
            for message in outgoing {
                bob.deliver(message.envelope, 0);
            }
            for envelope in bob.take_outbox() {
                coordinator.deliver(
                    ShareEnvelope {
                        share_id: "team-share".to_string(),
                        envelope,
                    },
                    0,
                );
            }
        }

        assert!(bob.state().is_connected());
        assert!(coordinator.is_connected("team-share", &"bob-laptop".to_string()));
        assert!(
            coordinator
                .take_events()
                .iter()
                .any(|(_, _, event)| matches!(event, ConnectionEvent::Connected))
        );
    }

    #[test]
    fn timeouts_fire_through_tick() {
        let mut coordinator = Coordinator::new("peer-a", Rng::from_seed([1; 32]));
        coordinator.add_share("alpha", Share::Public);
        coordinator.on_peer_candidate(&"peer-b".to_string(), 0);
        let _ = coordinator.take_outgoing();

        coordinator.tick(crate::connection::TIMEOUT_MS + 1);

        assert!(!coordinator.is_connected("alpha", &"peer-b".to_string()));
        assert!(coordinator.take_events().iter().any(|(_, _, event)| {
            matches!(
                event,
                ConnectionEvent::Disconnected { .. } | ConnectionEvent::LocalError { .. }
            )
        }));
    }

    #[test]
    fn removing_a_share_stops_its_connections() {
        let mut a = Coordinator::new("peer-a", Rng::from_seed([1; 32]));
        let mut b = Coordinator::new("peer-b", Rng::from_seed([2; 32]));
        a.add_share("alpha", Share::Public);
        b.add_share("alpha", Share::Public);

        a.on_peer_candidate(&"peer-b".to_string(), 0);
        b.on_peer_candidate(&"peer-a".to_string(), 0);
        pump(&mut a, &mut b, 0);
        assert!(a.is_connected("alpha", &"peer-b".to_string()));

        a.remove_share("alpha", 10);
        assert_eq!(a.route(&"peer-b".to_string()), None);

        // The disconnect reaches the peer.
        pump(&mut a, &mut b, 10);
        assert!(!b.is_connected("alpha", &"peer-a".to_string()));
    }
}
