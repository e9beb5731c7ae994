// SPDX-License-Identifier: MIT OR Apache-2.0

//! Materialized team state.
//!
//! `TeamState` is the value produced by replaying a linearized membership
//! graph through the reducer. It is never mutated in place by callers; the
//! reducer consumes a state and returns the next one.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::invitation::{Invitation, InvitationId};
use crate::keyset::{KeysetPublic, Scope};
use crate::lockbox::Lockbox;

/// Name of the built-in administrator role.
pub const ADMIN_ROLE: &str = "ADMIN";

/// A person on the team, with their devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub keys: KeysetPublic,
    pub roles: BTreeSet<String>,
    pub devices: BTreeMap<String, Device>,
}

/// A device belonging to a member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub keys: KeysetPublic,
}

/// A named role; `ADMIN` is built in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
}

/// A non-voting principal addressed by host name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub keys: KeysetPublic,
}

/// Mutable bookkeeping for a posted invitation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationState {
    pub invitation: Invitation,
    pub remaining_uses: u32,
    pub revoked: bool,
    pub used: bool,
}

/// The state of a team as derived from its membership graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    pub team_name: String,

    pub members: BTreeMap<String, Member>,
    pub removed_members: BTreeMap<String, Member>,
    pub removed_devices: BTreeMap<String, Device>,

    pub roles: BTreeMap<String, Role>,

    pub servers: BTreeMap<String, Server>,
    pub removed_servers: BTreeMap<String, Server>,

    pub invitations: BTreeMap<InvitationId, InvitationState>,

    /// The full lockbox graph posted on the chain so far.
    pub lockboxes: Vec<Lockbox>,

    /// Current key generation per scope; monotone non-decreasing.
    pub generations: BTreeMap<Scope, u32>,

    /// Opaque application messages in sequence order.
    pub messages: Vec<serde_bytes::ByteBuf>,
}

impl TeamState {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.get(user_id)
    }

    /// Active members holding the given role.
    pub fn members_in_role(&self, role_name: &str) -> Vec<&Member> {
        self.members
            .values()
            .filter(|member| member.roles.contains(role_name))
            .collect()
    }

    pub fn admins(&self) -> Vec<&Member> {
        self.members_in_role(ADMIN_ROLE)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.members
            .get(user_id)
            .is_some_and(|member| member.roles.contains(ADMIN_ROLE))
    }

    pub fn has_role(&self, role_name: &str) -> bool {
        self.roles.contains_key(role_name)
    }

    /// Look up an active device and its owner.
    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.members
            .values()
            .find_map(|member| member.devices.get(device_id))
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.device(device_id).is_some()
    }

    /// The user a device id belongs or ever belonged to.
    ///
    /// Device ids are a single namespace across the whole team history;
    /// looking through removed members and devices too keeps an id from
    /// being reclaimed by someone else after its owner leaves.
    pub fn device_owner(&self, device_id: &str) -> Option<&str> {
        if let Some(device) = self.removed_devices.get(device_id) {
            return Some(device.user_id.as_str());
        }
        self.members
            .values()
            .chain(self.removed_members.values())
            .find(|member| member.devices.contains_key(device_id))
            .map(|member| member.user_id.as_str())
    }

    pub fn has_server(&self, host: &str) -> bool {
        self.servers.contains_key(host)
    }

    pub fn invitation(&self, id: &InvitationId) -> Option<&InvitationState> {
        self.invitations.get(id)
    }

    /// Current generation for a scope; scopes start at generation 0.
    pub fn generation(&self, scope: &Scope) -> u32 {
        self.generations.get(scope).copied().unwrap_or(0)
    }

    /// Record a batch of lockboxes carried on a link and advance the
    /// generation counters they imply.
    pub(crate) fn apply_lockboxes(&mut self, lockboxes: &[Lockbox]) {
        for lockbox in lockboxes {
            let entry = self
                .generations
                .entry(lockbox.contents_scope.clone())
                .or_insert(0);
            if lockbox.contents_generation > *entry {
                *entry = lockbox.contents_generation;
            }
            self.lockboxes.push(lockbox.clone());
        }
    }
}
