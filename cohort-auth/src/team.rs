// SPDX-License-Identifier: MIT OR Apache-2.0

//! The team facade.
//!
//! Holds the signed graph, the reduced state and the local user/device
//! context. Every mutation builds a payload (with any lockboxes it implies),
//! appends a signed link, folds the new link into the current state and
//! notifies subscribers. Merging a peer's links triggers a full replay since
//! the linearization may have changed behind the new head.
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use cohort_core::cbor;
use cohort_core::crypto::aead::{AeadError, AeadNonce, aead_decrypt, aead_encrypt};
use cohort_core::crypto::{Rng, RngError};
use cohort_core::{Hash, Signature};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::action::{Action, Author};
use crate::graph::{Graph, GraphError, Link};
use crate::invitation::{self, InvitationError, InvitationId, ProofOfInvitation};
use crate::keyset::{KeysetError, KeysetPublic, KeysetWithSecrets, Scope};
use crate::lockbox::{Lockbox, LockboxError, visible_keys};
use crate::reducer::{self, MembershipError};
use crate::resolver::StrongRemove;
use crate::state::{ADMIN_ROLE, Device, Member, Role, Server, TeamState};

/// The local user: identity plus member keyset secrets.
#[derive(Clone, Debug)]
pub struct LocalUser {
    pub user_id: String,
    pub keys: KeysetWithSecrets,
}

impl LocalUser {
    /// Create a user with fresh member keys.
    pub fn generate(user_id: impl Into<String>, rng: &Rng) -> Result<Self, KeysetError> {
        let user_id = user_id.into();
        let keys = KeysetWithSecrets::generate(Scope::member(&user_id), rng)?;
        Ok(Self { user_id, keys })
    }
}

/// The local device: identity plus device keyset secrets.
#[derive(Clone, Debug)]
pub struct LocalDevice {
    pub user_id: String,
    pub device_id: String,
    pub keys: KeysetWithSecrets,
}

impl LocalDevice {
    /// Create a device with fresh device keys.
    pub fn generate(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        rng: &Rng,
    ) -> Result<Self, KeysetError> {
        let user_id = user_id.into();
        let device_id = device_id.into();
        let keys = KeysetWithSecrets::generate(Scope::device(&device_id), rng)?;
        Ok(Self {
            user_id,
            device_id,
            keys,
        })
    }

    /// The device's public record for membership payloads.
    pub fn to_device(&self) -> Device {
        Device {
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            keys: self.keys.public(),
        }
    }
}

/// Who is operating this copy of the team.
#[derive(Clone, Debug)]
pub struct LocalContext {
    pub user: LocalUser,
    pub device: LocalDevice,
}

impl LocalContext {
    pub fn author(&self) -> Author {
        Author {
            user_id: self.user.user_id.clone(),
            device_id: self.device.device_id.clone(),
        }
    }
}

/// Every keyset-with-secrets this copy of the team can reach, indexed by
/// scope and generation. Old generations stay available so ciphertext sealed
/// under them keeps decrypting.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Keyring {
    keys: BTreeMap<(Scope, u32), KeysetWithSecrets>,
}

impl Keyring {
    pub fn insert(&mut self, keys: KeysetWithSecrets) {
        self.keys
            .insert((keys.scope.clone(), keys.generation), keys);
    }

    pub fn get(&self, scope: &Scope, generation: u32) -> Option<&KeysetWithSecrets> {
        self.keys.get(&(scope.clone(), generation))
    }

    /// The newest generation held for a scope.
    pub fn latest(&self, scope: &Scope) -> Option<&KeysetWithSecrets> {
        self.keys
            .range((scope.clone(), 0)..=(scope.clone(), u32::MAX))
            .next_back()
            .map(|(_, keys)| keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Ciphertext produced by [`Team::encrypt`]; records which scope and
/// generation sealed it so any holder of that key can open it later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Encrypted {
    pub scope: Scope,
    pub generation: u32,
    #[serde(with = "serde_bytes")]
    pub nonce: [u8; 24],
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Emitted to subscribers after every state change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeamEvent {
    Updated { head: Hash },
}

type Listener = Box<dyn Fn(&TeamEvent) + Send + Sync>;

/// A team: the graph, its reduced state and the local context operating it.
pub struct Team {
    graph: Graph,
    state: TeamState,
    context: LocalContext,
    keyring: Keyring,
    resolver: StrongRemove,
    rng: Rng,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("team_name", &self.state.team_name)
            .field("head", &self.graph.head())
            .field("members", &self.state.members.len())
            .finish()
    }
}

impl Team {
    /// Found a new team. The local user becomes the first member and admin.
    pub fn create(
        team_name: impl Into<String>,
        context: LocalContext,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        let team_keys = KeysetWithSecrets::generate(Scope::team(), &rng)?;
        let admin_keys = KeysetWithSecrets::generate(Scope::role(ADMIN_ROLE), &rng)?;

        let member_public = context.user.keys.public();
        let founder = Member {
            user_id: context.user.user_id.clone(),
            keys: member_public.clone(),
            roles: [ADMIN_ROLE.to_string()].into(),
            devices: [(
                context.device.device_id.clone(),
                context.device.to_device(),
            )]
            .into(),
        };

        let lockboxes = vec![
            Lockbox::create(&team_keys, &member_public, &rng)?,
            Lockbox::create(&admin_keys, &member_public, &rng)?,
            Lockbox::create(&context.user.keys, &context.device.keys.public(), &rng)?,
        ];

        let graph = Graph::create(
            Action::Root {
                team_name: team_name.into(),
                founder,
                lockboxes,
            },
            context.author(),
            now_millis(),
            &context.device.keys.signing,
        )?;

        let mut team = Self {
            state: reducer::reduce(&graph, &StrongRemove)?,
            graph,
            context,
            keyring: Keyring::default(),
            resolver: StrongRemove,
            rng,
            listeners: Vec::new(),
        };
        team.refresh_keyring();
        Ok(team)
    }

    /// Adopt a serialized graph as an existing member of the team.
    pub fn load(bytes: &[u8], context: LocalContext, rng: Rng) -> Result<Self, TeamError> {
        let graph = Graph::deserialize(bytes)?;
        let state = reducer::reduce(&graph, &StrongRemove)?;
        let mut team = Self {
            graph,
            state,
            context,
            keyring: Keyring::default(),
            resolver: StrongRemove,
            rng,
            listeners: Vec::new(),
        };
        team.refresh_keyring();
        Ok(team)
    }

    /// Join a team by consuming an invitation.
    ///
    /// Validates that our invitation is actually on the graph, opens the
    /// team keys sealed to the seed-derived starter keyset, then posts our
    /// self-admission carrying the member record, the first device and the
    /// lockboxes that wire our keys into the team's lockbox graph.
    pub fn join(
        bytes: &[u8],
        seed: &str,
        context: LocalContext,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        let seed = invitation::normalize_seed(seed)?;
        let graph = Graph::deserialize(bytes)?;
        let state = reducer::reduce(&graph, &StrongRemove)?;

        let id = invitation::derive_id(&seed);
        let Some(entry) = state.invitation(&id) else {
            return Err(TeamError::Invitation(InvitationError::WrongTeam));
        };
        if entry.revoked {
            return Err(TeamError::Invitation(InvitationError::Revoked));
        }
        if entry.remaining_uses == 0 {
            return Err(TeamError::Invitation(InvitationError::Exhausted));
        }

        // The invitation lockboxes hold the team keys, sealed to the starter
        // keyset both sides derive from the seed.
        let starter = starter_keyset(&seed, &id);
        let reachable = visible_keys(&state.lockboxes, &starter);
        let team_keys = reachable
            .iter()
            .find(|keys| keys.scope == Scope::team())
            .cloned()
            .ok_or(TeamError::Invitation(InvitationError::WrongTeam))?;

        let proof = invitation::generate_proof(&seed, &context.user.user_id)?;
        let member_public = context.user.keys.public();
        let member = Member {
            user_id: context.user.user_id.clone(),
            keys: member_public.clone(),
            roles: BTreeSet::new(),
            devices: [(
                context.device.device_id.clone(),
                context.device.to_device(),
            )]
            .into(),
        };
        let lockboxes = vec![
            Lockbox::create(&team_keys, &member_public, &rng)?,
            Lockbox::create(&context.user.keys, &context.device.keys.public(), &rng)?,
        ];

        let mut team = Self {
            graph,
            state,
            context,
            keyring: Keyring::default(),
            resolver: StrongRemove,
            rng,
            listeners: Vec::new(),
        };
        team.append(Action::Admit {
            id,
            proof,
            member,
            lockboxes,
        })?;
        Ok(team)
    }

    /// Serialize the graph for storage or transfer.
    pub fn save(&self) -> Result<Vec<u8>, TeamError> {
        Ok(self.graph.serialize()?)
    }

    pub fn state(&self) -> &TeamState {
        &self.state
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn context(&self) -> &LocalContext {
        &self.context
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn team_name(&self) -> &str {
        &self.state.team_name
    }

    pub fn head(&self) -> Hash {
        self.graph.head()
    }

    /// Register a callback fired after every state change.
    pub fn on_update(&mut self, listener: impl Fn(&TeamEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add a member whose keys are already known (e.g. out-of-band exchange).
    pub fn add_member(&mut self, member: Member, roles: Vec<String>) -> Result<Hash, TeamError> {
        let mut lockboxes = vec![Lockbox::create(
            &self.team_keys()?,
            &member.keys,
            &self.rng,
        )?];
        for role_name in &roles {
            lockboxes.push(Lockbox::create(
                &self.role_keys(role_name)?,
                &member.keys,
                &self.rng,
            )?);
        }
        self.append(Action::AddMember {
            member,
            roles,
            lockboxes,
        })
    }

    /// Remove a member and rotate every key they could reach.
    pub fn remove_member(&mut self, user_id: &str) -> Result<Hash, TeamError> {
        let Some(member) = self.state.member(user_id).cloned() else {
            return Err(TeamError::Membership(MembershipError::UnknownMember(
                user_id.to_string(),
            )));
        };
        if self.state.is_admin(user_id) && self.state.admins().len() == 1 {
            return Err(TeamError::Membership(MembershipError::CannotRemoveOnlyAdmin(
                user_id.to_string(),
            )));
        }

        let mut lockboxes = self.rotate_team_keys(Some(user_id))?;
        for role_name in &member.roles {
            lockboxes.extend(self.rotate_role_keys(role_name, Some(user_id))?);
        }

        self.append(Action::RemoveMember {
            user_id: user_id.to_string(),
            lockboxes,
        })
    }

    /// Create a role. Its keys are sealed to the admin keyset so any admin
    /// can later grant them.
    pub fn add_role(&mut self, role_name: &str) -> Result<Hash, TeamError> {
        let role_keys = KeysetWithSecrets::generate(Scope::role(role_name), &self.rng)?;
        let lockboxes = vec![Lockbox::create(
            &role_keys,
            &self.admin_keys()?.public(),
            &self.rng,
        )?];
        self.append(Action::AddRole {
            role: Role {
                name: role_name.to_string(),
            },
            lockboxes,
        })
    }

    pub fn remove_role(&mut self, role_name: &str) -> Result<Hash, TeamError> {
        if role_name == ADMIN_ROLE {
            return Err(TeamError::Membership(MembershipError::CannotRemoveAdminRole));
        }
        self.append(Action::RemoveRole {
            role_name: role_name.to_string(),
        })
    }

    /// Grant a role; the grantee receives the role keys.
    pub fn add_member_role(&mut self, user_id: &str, role_name: &str) -> Result<Hash, TeamError> {
        let Some(member_keys) = self.state.member(user_id).map(|member| member.keys.clone())
        else {
            return Err(TeamError::Membership(MembershipError::UnknownMember(
                user_id.to_string(),
            )));
        };
        let lockboxes = vec![Lockbox::create(
            &self.role_keys(role_name)?,
            &member_keys,
            &self.rng,
        )?];
        self.append(Action::AddMemberRole {
            user_id: user_id.to_string(),
            role_name: role_name.to_string(),
            lockboxes,
        })
    }

    /// Revoke a role and rotate its keys away from the demoted member.
    pub fn remove_member_role(
        &mut self,
        user_id: &str,
        role_name: &str,
    ) -> Result<Hash, TeamError> {
        if role_name == ADMIN_ROLE
            && self.state.is_admin(user_id)
            && self.state.admins().len() == 1
        {
            return Err(TeamError::Membership(MembershipError::CannotRemoveOnlyAdmin(
                user_id.to_string(),
            )));
        }
        let lockboxes = self.rotate_role_keys(role_name, Some(user_id))?;
        self.append(Action::RemoveMemberRole {
            user_id: user_id.to_string(),
            role_name: role_name.to_string(),
            lockboxes,
        })
    }

    /// Announce one of our own devices.
    pub fn add_device(&mut self, device: Device) -> Result<Hash, TeamError> {
        let lockboxes = vec![Lockbox::create(
            &self.context.user.keys,
            &device.keys,
            &self.rng,
        )?];
        self.append(Action::AddDevice { device, lockboxes })
    }

    /// Remove one of our devices and rotate everything it could reach: our
    /// member keys, then (via [`Team::change_keys`]) the team and role keys.
    pub fn remove_device(&mut self, device_id: &str) -> Result<Hash, TeamError> {
        let own_devices = self
            .state
            .member(&self.context.user.user_id)
            .map(|member| member.devices.len())
            .unwrap_or(0);
        if own_devices <= 1 {
            return Err(TeamError::Membership(MembershipError::CannotRemoveLastDevice(
                device_id.to_string(),
            )));
        }

        let member_next = self.context.user.keys.rotated(&self.rng)?;
        let mut lockboxes = Vec::new();
        if let Some(member) = self.state.member(&self.context.user.user_id) {
            for device in member.devices.values() {
                if device.device_id == device_id {
                    continue;
                }
                lockboxes.push(Lockbox::create(&member_next, &device.keys, &self.rng)?);
            }
        }
        let hash = self.append(Action::RemoveDevice {
            device_id: device_id.to_string(),
            lockboxes,
        })?;

        // The compromised device could read our member keys and everything
        // behind them; rotate the lot.
        self.change_keys_to(member_next, true)?;
        Ok(hash)
    }

    /// Rotate our own member keys.
    pub fn change_keys(&mut self) -> Result<Hash, TeamError> {
        let member_next = self.context.user.keys.rotated(&self.rng)?;
        self.change_keys_to(member_next, false)
    }

    fn change_keys_to(
        &mut self,
        member_next: KeysetWithSecrets,
        compromise: bool,
    ) -> Result<Hash, TeamError> {
        let mut lockboxes = Vec::new();

        // New member keys go to each of our remaining devices.
        if let Some(member) = self.state.member(&self.context.user.user_id) {
            for device in member.devices.values() {
                lockboxes.push(Lockbox::create(&member_next, &device.keys, &self.rng)?);
            }
        }

        let member_public = member_next.public();
        if compromise {
            // Everything the old member keys could open gets a fresh
            // generation, sealed to the new member keys and to everyone else
            // who held it.
            lockboxes.extend(self.rotate_team_keys_with_self(&member_public)?);
            let roles: Vec<String> = self
                .state
                .member(&self.context.user.user_id)
                .map(|member| member.roles.iter().cloned().collect())
                .unwrap_or_default();
            for role_name in roles {
                lockboxes.extend(self.rotate_role_keys_with_self(&role_name, &member_public)?);
            }
        } else {
            // No compromise: reseal the current keys to the new member keys.
            lockboxes.push(Lockbox::create(&self.team_keys()?, &member_public, &self.rng)?);
            let roles: Vec<String> = self
                .state
                .member(&self.context.user.user_id)
                .map(|member| member.roles.iter().cloned().collect())
                .unwrap_or_default();
            for role_name in roles {
                lockboxes.push(Lockbox::create(
                    &self.role_keys(&role_name)?,
                    &member_public,
                    &self.rng,
                )?);
            }
        }

        let hash = self.append(Action::ChangeMemberKeys {
            keys: member_public,
            lockboxes,
        })?;
        self.context.user.keys = member_next;
        self.refresh_keyring();
        Ok(hash)
    }

    /// Add a server principal.
    pub fn add_server(&mut self, server: Server) -> Result<Hash, TeamError> {
        let lockboxes = vec![Lockbox::create(
            &self.team_keys()?,
            &server.keys,
            &self.rng,
        )?];
        self.append(Action::AddServer { server, lockboxes })
    }

    /// Remove a server and rotate the team keys it held.
    pub fn remove_server(&mut self, host: &str) -> Result<Hash, TeamError> {
        let lockboxes = self.rotate_team_keys(None)?;
        self.append(Action::RemoveServer {
            host: host.to_string(),
            lockboxes,
        })
    }

    /// Post an invitation. Returns the normalized seed to share out-of-band
    /// and the id under which the invitation is recorded.
    pub fn invite(
        &mut self,
        seed: Option<&str>,
        max_uses: u32,
        expiration: u64,
        user_id: Option<String>,
    ) -> Result<(String, InvitationId), TeamError> {
        let seed = match seed {
            Some(seed) => invitation::normalize_seed(seed)?,
            None => invitation::random_seed(&self.rng)?,
        };
        let invitation = invitation::create(&seed, max_uses, expiration, user_id)?;
        let id = invitation.id;

        // Team keys travel with the invitation, sealed to the starter keyset
        // only the seed holder can derive.
        let starter = starter_keyset(&seed, &id);
        let lockboxes = vec![Lockbox::create(
            &self.team_keys()?,
            &starter.public(),
            &self.rng,
        )?];

        self.append(Action::Invite {
            invitation,
            lockboxes,
        })?;
        Ok((seed, id))
    }

    pub fn revoke_invitation(&mut self, id: InvitationId) -> Result<Hash, TeamError> {
        self.append(Action::RevokeInvitation { id })
    }

    /// Admit an invitee on their behalf after validating their proof; used
    /// by admins admitting someone whose claim arrived out-of-band.
    pub fn admit(&mut self, proof: ProofOfInvitation, member: Member) -> Result<Hash, TeamError> {
        // A proof only vouches for the user it names.
        if member.user_id != proof.user_id {
            return Err(TeamError::Invitation(InvitationError::ProofInvalid));
        }
        let entry = self
            .state
            .invitation(&proof.id)
            .ok_or(TeamError::Invitation(InvitationError::NotFound))?;
        invitation::validate_proof(&proof, &entry.invitation, now_millis())?;

        let lockboxes = vec![Lockbox::create(
            &self.team_keys()?,
            &member.keys,
            &self.rng,
        )?];
        self.append(Action::Admit {
            id: proof.id,
            proof,
            member,
            lockboxes,
        })
    }

    pub fn set_team_name(&mut self, team_name: &str) -> Result<Hash, TeamError> {
        self.append(Action::SetTeamName {
            team_name: team_name.to_string(),
        })
    }

    pub fn add_message(&mut self, message: Vec<u8>) -> Result<Hash, TeamError> {
        self.append(Action::AddMessage {
            message: serde_bytes::ByteBuf::from(message),
        })
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Merge a peer's graph and replay.
    pub fn merge(&mut self, other: &Graph) -> Result<Hash, TeamError> {
        let before = self.graph.head();
        let head = self.graph.merge(other)?;
        if head != before {
            self.replay()?;
        }
        Ok(head)
    }

    /// Merge loose links received from a peer and replay.
    pub fn merge_links(&mut self, links: Vec<Link>, their_head: Hash) -> Result<Hash, TeamError> {
        let before = self.graph.head();
        let head = self.graph.merge_links(links, their_head)?;
        if head != before {
            self.replay()?;
        }
        Ok(head)
    }

    fn replay(&mut self) -> Result<(), TeamError> {
        self.graph.validate()?;
        self.state = reducer::reduce(&self.graph, &self.resolver)?;
        self.refresh_keyring();
        debug!(head = %self.graph.head().fmt_short(), "replayed team graph");
        self.emit_updated();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Crypto surface
    // ------------------------------------------------------------------

    /// Encrypt to a scope under its current key generation.
    pub fn encrypt(&self, scope: &Scope, plaintext: &[u8]) -> Result<Encrypted, TeamError> {
        let generation = self.state.generation(scope);
        let keys = self
            .keyring
            .get(scope, generation)
            .ok_or_else(|| TeamError::UnknownScope(scope.clone()))?;
        let nonce: AeadNonce = self.rng.random_array()?;
        let ciphertext = aead_encrypt(&scope_key(keys), plaintext, nonce, None)?;
        Ok(Encrypted {
            scope: scope.clone(),
            generation,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt ciphertext sealed to any scope generation we can reach.
    pub fn decrypt(&self, encrypted: &Encrypted) -> Result<Vec<u8>, TeamError> {
        let keys = self
            .keyring
            .get(&encrypted.scope, encrypted.generation)
            .ok_or_else(|| TeamError::UnknownScope(encrypted.scope.clone()))?;
        Ok(aead_decrypt(
            &scope_key(keys),
            &encrypted.ciphertext,
            encrypted.nonce,
            None,
        )?)
    }

    /// Sign with the local device key.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.context.device.keys.signing.sign(bytes)
    }

    /// Verify a signature against a member's current signing key.
    pub fn verify_member(
        &self,
        user_id: &str,
        bytes: &[u8],
        signature: &Signature,
    ) -> Result<(), TeamError> {
        let member = self
            .state
            .member(user_id)
            .ok_or_else(|| TeamError::UnknownScope(Scope::member(user_id)))?;
        member
            .keys
            .signing
            .verify(bytes, signature)
            .map_err(|_| TeamError::BadSignature)
    }

    /// Verify a signature against a device's current signing key.
    pub fn verify_device(
        &self,
        device_id: &str,
        bytes: &[u8],
        signature: &Signature,
    ) -> Result<(), TeamError> {
        let device = self
            .state
            .device(device_id)
            .ok_or_else(|| TeamError::UnknownScope(Scope::device(device_id)))?;
        device
            .keys
            .signing
            .verify(bytes, signature)
            .map_err(|_| TeamError::BadSignature)
    }

    /// The team keyset at its current generation.
    pub fn team_keys(&self) -> Result<KeysetWithSecrets, TeamError> {
        self.scope_keys(&Scope::team())
    }

    /// The admin role keyset at its current generation.
    pub fn admin_keys(&self) -> Result<KeysetWithSecrets, TeamError> {
        self.scope_keys(&Scope::role(ADMIN_ROLE))
    }

    /// A role keyset at its current generation.
    pub fn role_keys(&self, role_name: &str) -> Result<KeysetWithSecrets, TeamError> {
        self.scope_keys(&Scope::role(role_name))
    }

    fn scope_keys(&self, scope: &Scope) -> Result<KeysetWithSecrets, TeamError> {
        let generation = self.state.generation(scope);
        self.keyring
            .get(scope, generation)
            .cloned()
            .ok_or_else(|| TeamError::UnknownScope(scope.clone()))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn append(&mut self, action: Action) -> Result<Hash, TeamError> {
        let hash = self.graph.append(
            action,
            self.context.author(),
            now_millis(),
            &self.context.device.keys.signing,
        )?;
        let link = self.graph.link(&hash)?.clone();
        self.state = reducer::apply(std::mem::take(&mut self.state), &link);
        self.refresh_keyring();
        self.emit_updated();
        Ok(hash)
    }

    /// Rotate the team keyset, sealing the next generation to every current
    /// member except `excluded`.
    fn rotate_team_keys(&self, excluded: Option<&str>) -> Result<Vec<Lockbox>, TeamError> {
        let team_next = self.team_keys()?.rotated(&self.rng)?;
        let mut lockboxes = Vec::new();
        for member in self.state.members.values() {
            if Some(member.user_id.as_str()) == excluded {
                continue;
            }
            lockboxes.push(Lockbox::create(&team_next, &member.keys, &self.rng)?);
        }
        for server in self.state.servers.values() {
            lockboxes.push(Lockbox::create(&team_next, &server.keys, &self.rng)?);
        }
        Ok(lockboxes)
    }

    /// Rotate the team keyset when our own member keys change: everyone else
    /// keeps their recorded keys, we use the replacement.
    fn rotate_team_keys_with_self(
        &self,
        own_next: &KeysetPublic,
    ) -> Result<Vec<Lockbox>, TeamError> {
        let team_next = self.team_keys()?.rotated(&self.rng)?;
        let mut lockboxes = Vec::new();
        for member in self.state.members.values() {
            let recipient = if member.user_id == self.context.user.user_id {
                own_next
            } else {
                &member.keys
            };
            lockboxes.push(Lockbox::create(&team_next, recipient, &self.rng)?);
        }
        Ok(lockboxes)
    }

    /// Rotate a role keyset, sealing the next generation to every member
    /// holding the role except `excluded`. The admin keyset always receives
    /// role keys so admins can keep granting them.
    fn rotate_role_keys(
        &self,
        role_name: &str,
        excluded: Option<&str>,
    ) -> Result<Vec<Lockbox>, TeamError> {
        let role_next = self.role_keys(role_name)?.rotated(&self.rng)?;
        let mut lockboxes = Vec::new();
        for member in self.state.members_in_role(role_name) {
            if Some(member.user_id.as_str()) == excluded {
                continue;
            }
            lockboxes.push(Lockbox::create(&role_next, &member.keys, &self.rng)?);
        }
        if role_name != ADMIN_ROLE {
            lockboxes.push(Lockbox::create(
                &role_next,
                &self.admin_keys()?.public(),
                &self.rng,
            )?);
        }
        Ok(lockboxes)
    }

    fn rotate_role_keys_with_self(
        &self,
        role_name: &str,
        own_next: &KeysetPublic,
    ) -> Result<Vec<Lockbox>, TeamError> {
        let role_next = self.role_keys(role_name)?.rotated(&self.rng)?;
        let mut lockboxes = Vec::new();
        for member in self.state.members_in_role(role_name) {
            let recipient = if member.user_id == self.context.user.user_id {
                own_next
            } else {
                &member.keys
            };
            lockboxes.push(Lockbox::create(&role_next, recipient, &self.rng)?);
        }
        if role_name != ADMIN_ROLE {
            lockboxes.push(Lockbox::create(
                &role_next,
                &self.admin_keys()?.public(),
                &self.rng,
            )?);
        }
        Ok(lockboxes)
    }

    /// Re-open everything reachable from our device and member keys.
    fn refresh_keyring(&mut self) {
        let mut keyring = std::mem::take(&mut self.keyring);
        keyring.insert(self.context.device.keys.clone());
        keyring.insert(self.context.user.keys.clone());
        for keys in visible_keys(&self.state.lockboxes, &self.context.device.keys) {
            keyring.insert(keys);
        }
        for keys in visible_keys(&self.state.lockboxes, &self.context.user.keys) {
            keyring.insert(keys);
        }
        self.keyring = keyring;
    }

    fn emit_updated(&self) {
        let event = TeamEvent::Updated {
            head: self.graph.head(),
        };
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

/// The starter keyset shared through the seed, scoped to the invitation id.
fn starter_keyset(seed: &str, id: &InvitationId) -> KeysetWithSecrets {
    KeysetWithSecrets::from_seed(Scope::ephemeral(id.to_hex()), seed.as_bytes())
}

/// Symmetric key for scope-level encryption, bound to the keyset's secret
/// encryption half.
fn scope_key(keys: &KeysetWithSecrets) -> [u8; 32] {
    *Hash::derive("cohort scope symmetric key", &keys.encryption.to_bytes()).as_bytes()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors surfaced by the team facade.
#[derive(Debug, Error)]
pub enum TeamError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error(transparent)]
    Lockbox(#[from] LockboxError),

    #[error(transparent)]
    Keyset(#[from] KeysetError),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Rand(#[from] RngError),

    #[error(transparent)]
    Encode(#[from] cbor::EncodeError),

    #[error("no keys available for {0}")]
    UnknownScope(Scope),

    #[error("signature verification failed")]
    BadSignature,
}
