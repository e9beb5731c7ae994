// SPDX-License-Identifier: MIT OR Apache-2.0

//! Actions for creating a team and modifying its membership.
//!
//! The closed set of payloads a link can carry. The reducer is a total
//! function over this enum; adding a variant is a protocol change.
use serde::{Deserialize, Serialize};

use crate::invitation::{Invitation, InvitationId, ProofOfInvitation};
use crate::keyset::KeysetPublic;
use crate::lockbox::Lockbox;
use crate::state::{Device, Member, Role, Server};

/// The author context recorded on every signed link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub user_id: String,
    pub device_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// First link of every team: names the team and installs the founder as
    /// its first admin.
    Root {
        team_name: String,
        founder: Member,
        lockboxes: Vec<Lockbox>,
    },

    AddMember {
        member: Member,
        roles: Vec<String>,
        lockboxes: Vec<Lockbox>,
    },

    /// Removal rotates the team keys; the replacement lockboxes ride along.
    RemoveMember {
        user_id: String,
        lockboxes: Vec<Lockbox>,
    },

    AddRole {
        role: Role,
        lockboxes: Vec<Lockbox>,
    },

    RemoveRole {
        role_name: String,
    },

    AddMemberRole {
        user_id: String,
        role_name: String,
        lockboxes: Vec<Lockbox>,
    },

    RemoveMemberRole {
        user_id: String,
        role_name: String,
        lockboxes: Vec<Lockbox>,
    },

    AddDevice {
        device: Device,
        lockboxes: Vec<Lockbox>,
    },

    RemoveDevice {
        device_id: String,
        lockboxes: Vec<Lockbox>,
    },

    ChangeMemberKeys {
        keys: KeysetPublic,
        lockboxes: Vec<Lockbox>,
    },

    ChangeDeviceKeys {
        keys: KeysetPublic,
        lockboxes: Vec<Lockbox>,
    },

    AddServer {
        server: Server,
        lockboxes: Vec<Lockbox>,
    },

    RemoveServer {
        host: String,
        lockboxes: Vec<Lockbox>,
    },

    ChangeServerKeys {
        keys: KeysetPublic,
        lockboxes: Vec<Lockbox>,
    },

    /// Posts an invitation; the lockboxes seal current team keys to the
    /// seed-derived starter keyset so the invitee can read team ciphertext
    /// as soon as they hold the seed and the graph.
    Invite {
        invitation: Invitation,
        lockboxes: Vec<Lockbox>,
    },

    RevokeInvitation {
        id: InvitationId,
    },

    /// Consumes one use of an invitation and introduces the invitee.
    Admit {
        id: InvitationId,
        proof: ProofOfInvitation,
        member: Member,
        lockboxes: Vec<Lockbox>,
    },

    SetTeamName {
        team_name: String,
    },

    AddMessage {
        message: serde_bytes::ByteBuf,
    },
}

impl Action {
    /// Return `true` if this is the root action.
    pub fn is_root(&self) -> bool {
        matches!(self, Action::Root { .. })
    }

    /// Lockboxes carried by this action, if any.
    pub fn lockboxes(&self) -> &[Lockbox] {
        match self {
            Action::Root { lockboxes, .. }
            | Action::AddMember { lockboxes, .. }
            | Action::RemoveMember { lockboxes, .. }
            | Action::AddRole { lockboxes, .. }
            | Action::AddMemberRole { lockboxes, .. }
            | Action::RemoveMemberRole { lockboxes, .. }
            | Action::AddDevice { lockboxes, .. }
            | Action::RemoveDevice { lockboxes, .. }
            | Action::ChangeMemberKeys { lockboxes, .. }
            | Action::ChangeDeviceKeys { lockboxes, .. }
            | Action::AddServer { lockboxes, .. }
            | Action::RemoveServer { lockboxes, .. }
            | Action::ChangeServerKeys { lockboxes, .. }
            | Action::Invite { lockboxes, .. }
            | Action::Admit { lockboxes, .. } => lockboxes,
            Action::RemoveRole { .. }
            | Action::RevokeInvitation { .. }
            | Action::SetTeamName { .. }
            | Action::AddMessage { .. } => &[],
        }
    }

    /// Short name for log output.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Root { .. } => "root",
            Action::AddMember { .. } => "add-member",
            Action::RemoveMember { .. } => "remove-member",
            Action::AddRole { .. } => "add-role",
            Action::RemoveRole { .. } => "remove-role",
            Action::AddMemberRole { .. } => "add-member-role",
            Action::RemoveMemberRole { .. } => "remove-member-role",
            Action::AddDevice { .. } => "add-device",
            Action::RemoveDevice { .. } => "remove-device",
            Action::ChangeMemberKeys { .. } => "change-member-keys",
            Action::ChangeDeviceKeys { .. } => "change-device-keys",
            Action::AddServer { .. } => "add-server",
            Action::RemoveServer { .. } => "remove-server",
            Action::ChangeServerKeys { .. } => "change-server-keys",
            Action::Invite { .. } => "invite",
            Action::RevokeInvitation { .. } => "revoke-invitation",
            Action::Admit { .. } => "admit",
            Action::SetTeamName { .. } => "set-team-name",
            Action::AddMessage { .. } => "add-message",
        }
    }
}
