// SPDX-License-Identifier: MIT OR Apache-2.0

//! The membership reducer.
//!
//! A pure fold of the linearized graph into a [`TeamState`]. Every link is
//! checked against the authorization rules before its effect is applied; a
//! link that fails the check is skipped with a warning and reduction
//! continues. Peers that disagree about nothing but delivery order therefore
//! converge on the same state.
use cohort_core::Hash;
use thiserror::Error;
use tracing::warn;

use crate::action::{Action, Author};
use crate::graph::{Graph, GraphError, Link, SignedLink};
use crate::invitation::{self, InvitationError};
use crate::keyset::{Scope, ScopeType};
use crate::resolver::Resolver;
use crate::state::{ADMIN_ROLE, InvitationState, TeamState};

/// Replay the whole graph into a team state.
pub fn reduce(graph: &Graph, resolver: &impl Resolver) -> Result<TeamState, GraphError> {
    let sequence = graph.sequence(resolver)?;
    let mut state = TeamState::default();
    for hash in &sequence {
        state = apply(state, graph.link(hash)?);
    }
    Ok(state)
}

/// Apply a single link to the state.
///
/// Merge links are structural and have no effect. A signed link that fails
/// authorization or validation leaves the state untouched.
pub fn apply(state: TeamState, link: &Link) -> TeamState {
    let Link::Signed(signed) = link else {
        return state;
    };

    let mut state = state;
    match apply_signed(&mut state, signed) {
        Ok(()) => state,
        Err(error) => {
            warn!(
                link = %signed.hash().fmt_short(),
                action = signed.body.action.name(),
                author = %signed.body.author.user_id,
                %error,
                "skipping link"
            );
            state
        }
    }
}

/// Check and apply one signed link. Every branch validates fully before the
/// first mutation so an error always leaves `state` unchanged.
fn apply_signed(state: &mut TeamState, signed: &SignedLink) -> Result<(), MembershipError> {
    let author = &signed.body.author;
    let action = &signed.body.action;

    if let Action::Root {
        team_name,
        founder,
        lockboxes,
    } = action
    {
        if !state.members.is_empty() || !state.team_name.is_empty() {
            return Err(MembershipError::RootNotFirst);
        }
        check_introduced_devices(state, founder)?;
        state.team_name = team_name.clone();
        state.roles.insert(
            ADMIN_ROLE.to_string(),
            crate::state::Role {
                name: ADMIN_ROLE.to_string(),
            },
        );
        let mut founder = founder.clone();
        founder.roles.insert(ADMIN_ROLE.to_string());
        state.members.insert(founder.user_id.clone(), founder);
        state.apply_lockboxes(lockboxes);
        return Ok(());
    }

    authorize(state, author, action)?;

    match action {
        Action::Root { .. } => unreachable!("handled above"),

        Action::AddMember {
            member,
            roles,
            lockboxes,
        } => {
            if state.has_member(&member.user_id) {
                return Err(MembershipError::AlreadyMember(member.user_id.clone()));
            }
            check_introduced_devices(state, member)?;
            let mut member = member.clone();
            member.roles.extend(roles.iter().cloned());
            state.members.insert(member.user_id.clone(), member);
            state.apply_lockboxes(lockboxes);
        }

        Action::RemoveMember { user_id, lockboxes } => {
            if !state.has_member(user_id) {
                if state.removed_members.contains_key(user_id) {
                    // A concurrent removal already took effect.
                    return Ok(());
                }
                return Err(MembershipError::UnknownMember(user_id.clone()));
            }
            if state.is_admin(user_id) && state.admins().len() == 1 {
                return Err(MembershipError::CannotRemoveOnlyAdmin(user_id.clone()));
            }
            let member = state
                .members
                .remove(user_id)
                .expect("presence checked above");
            for device in member.devices.values() {
                state
                    .removed_devices
                    .insert(device.device_id.clone(), device.clone());
            }
            state.removed_members.insert(user_id.clone(), member);
            state.apply_lockboxes(lockboxes);
        }

        Action::AddRole { role, lockboxes } => {
            if state.has_role(&role.name) {
                return Err(MembershipError::RoleExists(role.name.clone()));
            }
            state.roles.insert(role.name.clone(), role.clone());
            state.apply_lockboxes(lockboxes);
        }

        Action::RemoveRole { role_name } => {
            if role_name == ADMIN_ROLE {
                return Err(MembershipError::CannotRemoveAdminRole);
            }
            if state.roles.remove(role_name).is_none() {
                return Err(MembershipError::UnknownRole(role_name.clone()));
            }
            for member in state.members.values_mut() {
                member.roles.remove(role_name);
            }
        }

        Action::AddMemberRole {
            user_id,
            role_name,
            lockboxes,
        } => {
            if !state.has_role(role_name) {
                return Err(MembershipError::UnknownRole(role_name.clone()));
            }
            let Some(member) = state.members.get_mut(user_id) else {
                return Err(MembershipError::UnknownMember(user_id.clone()));
            };
            member.roles.insert(role_name.clone());
            state.apply_lockboxes(lockboxes);
        }

        Action::RemoveMemberRole {
            user_id,
            role_name,
            lockboxes,
        } => {
            if !state.has_member(user_id) {
                return Err(MembershipError::UnknownMember(user_id.clone()));
            }
            if role_name == ADMIN_ROLE
                && state.is_admin(user_id)
                && state.admins().len() == 1
            {
                return Err(MembershipError::CannotRemoveOnlyAdmin(user_id.clone()));
            }
            let member = state
                .members
                .get_mut(user_id)
                .expect("presence checked above");
            if !member.roles.remove(role_name) {
                // Already revoked by a concurrent demotion.
                return Ok(());
            }
            state.apply_lockboxes(lockboxes);
        }

        Action::AddDevice { device, lockboxes } => {
            // Device ids are team-wide: an id another user holds or ever
            // held cannot be claimed.
            if let Some(owner) = state.device_owner(&device.device_id)
                && owner != device.user_id
            {
                return Err(MembershipError::DeviceIdInUse(device.device_id.clone()));
            }
            let Some(member) = state.members.get_mut(&device.user_id) else {
                return Err(MembershipError::UnknownMember(device.user_id.clone()));
            };
            if member.devices.contains_key(&device.device_id) {
                // Re-announcing an existing device is a no-op.
                return Ok(());
            }
            member
                .devices
                .insert(device.device_id.clone(), device.clone());
            state.apply_lockboxes(lockboxes);
        }

        Action::RemoveDevice {
            device_id,
            lockboxes,
        } => {
            let Some(owner) = state
                .members
                .values()
                .find(|member| member.devices.contains_key(device_id))
                .map(|member| member.user_id.clone())
            else {
                if state.removed_devices.contains_key(device_id) {
                    return Ok(());
                }
                return Err(MembershipError::UnknownDevice(device_id.clone()));
            };
            let member = state
                .members
                .get_mut(&owner)
                .expect("owner looked up above");
            if member.devices.len() == 1 {
                return Err(MembershipError::CannotRemoveLastDevice(device_id.clone()));
            }
            let device = member
                .devices
                .remove(device_id)
                .expect("device looked up above");
            state.removed_devices.insert(device_id.clone(), device);
            state.apply_lockboxes(lockboxes);
        }

        Action::ChangeMemberKeys { keys, lockboxes } => {
            let Some(member) = state.members.get_mut(&author.user_id) else {
                return Err(MembershipError::UnknownMember(author.user_id.clone()));
            };
            if keys.generation <= member.keys.generation {
                return Err(MembershipError::StaleKeys(keys.scope.clone()));
            }
            member.keys = keys.clone();
            state.apply_lockboxes(lockboxes);
        }

        Action::ChangeDeviceKeys { keys, lockboxes } => {
            let device_id = keys.scope.name.clone();
            let Some(member) = state.members.get_mut(&author.user_id) else {
                return Err(MembershipError::UnknownMember(author.user_id.clone()));
            };
            let Some(device) = member.devices.get_mut(&device_id) else {
                return Err(MembershipError::UnknownDevice(device_id));
            };
            if keys.generation <= device.keys.generation {
                return Err(MembershipError::StaleKeys(keys.scope.clone()));
            }
            device.keys = keys.clone();
            state.apply_lockboxes(lockboxes);
        }

        Action::AddServer { server, lockboxes } => {
            if state.has_server(&server.host) {
                return Err(MembershipError::ServerExists(server.host.clone()));
            }
            state.servers.insert(server.host.clone(), server.clone());
            state.apply_lockboxes(lockboxes);
        }

        Action::RemoveServer { host, lockboxes } => {
            let Some(server) = state.servers.remove(host) else {
                if state.removed_servers.contains_key(host) {
                    return Ok(());
                }
                return Err(MembershipError::UnknownServer(host.clone()));
            };
            state.removed_servers.insert(host.clone(), server);
            state.apply_lockboxes(lockboxes);
        }

        Action::ChangeServerKeys { keys, lockboxes } => {
            let host = keys.scope.name.clone();
            let Some(server) = state.servers.get_mut(&host) else {
                return Err(MembershipError::UnknownServer(host));
            };
            if keys.generation <= server.keys.generation {
                return Err(MembershipError::StaleKeys(keys.scope.clone()));
            }
            server.keys = keys.clone();
            state.apply_lockboxes(lockboxes);
        }

        Action::Invite {
            invitation,
            lockboxes,
        } => {
            if state.invitations.contains_key(&invitation.id) {
                return Err(MembershipError::InvitationExists(invitation.id));
            }
            state.invitations.insert(
                invitation.id,
                InvitationState {
                    invitation: invitation.clone(),
                    remaining_uses: invitation.max_uses.max(1),
                    revoked: false,
                    used: false,
                },
            );
            state.apply_lockboxes(lockboxes);
        }

        Action::RevokeInvitation { id } => {
            let Some(entry) = state.invitations.get_mut(id) else {
                return Err(MembershipError::Invitation(InvitationError::NotFound));
            };
            entry.revoked = true;
        }

        Action::Admit {
            id,
            proof,
            member,
            lockboxes,
        } => {
            // The admitted member record must belong to the user the proof
            // was made for; a proof cannot vouch for anyone else.
            if member.user_id != proof.user_id {
                return Err(MembershipError::Invitation(InvitationError::ProofInvalid));
            }
            check_introduced_devices(state, member)?;
            let Some(entry) = state.invitations.get(id) else {
                return Err(MembershipError::Invitation(InvitationError::NotFound));
            };
            if entry.revoked {
                return Err(MembershipError::Invitation(InvitationError::Revoked));
            }
            if state.has_member(&member.user_id) {
                // A concurrent admission of the same user already landed.
                return Ok(());
            }
            if entry.remaining_uses == 0 {
                return Err(MembershipError::Invitation(InvitationError::Exhausted));
            }
            invitation::validate_proof(proof, &entry.invitation, signed.body.timestamp)
                .map_err(MembershipError::Invitation)?;

            let entry = state
                .invitations
                .get_mut(id)
                .expect("presence checked above");
            entry.remaining_uses -= 1;
            if entry.remaining_uses == 0 {
                entry.used = true;
            }

            // Roles are never granted through admission.
            let mut member = member.clone();
            member.roles.clear();
            state.members.insert(member.user_id.clone(), member);
            state.apply_lockboxes(lockboxes);
        }

        Action::SetTeamName { team_name } => {
            state.team_name = team_name.clone();
        }

        Action::AddMessage { message } => {
            state.messages.push(message.clone());
        }
    }

    Ok(())
}

/// Validate the devices carried by a member record being introduced to the
/// team: each must belong to the introduced member, under a device id no
/// other user holds or ever held.
fn check_introduced_devices(
    state: &TeamState,
    member: &crate::state::Member,
) -> Result<(), MembershipError> {
    for device in member.devices.values() {
        if device.user_id != member.user_id {
            return Err(MembershipError::NotOwnScope(Scope::device(
                device.device_id.clone(),
            )));
        }
        if let Some(owner) = state.device_owner(&device.device_id)
            && owner != member.user_id
        {
            return Err(MembershipError::DeviceIdInUse(device.device_id.clone()));
        }
    }
    Ok(())
}

/// Authorization gate applied to every non-root link.
///
/// Admin authority is required for everything except self-admission with a
/// valid proof, a member's own key rotations and device management, and
/// posting messages.
fn authorize(state: &TeamState, author: &Author, action: &Action) -> Result<(), MembershipError> {
    match action {
        Action::Root { .. } => Err(MembershipError::RootNotFirst),

        Action::Admit { proof, .. } => {
            if state.is_admin(&author.user_id) || author.user_id == proof.user_id {
                Ok(())
            } else {
                Err(MembershipError::NotAdmin(author.user_id.clone()))
            }
        }

        Action::ChangeMemberKeys { keys, .. } => {
            if keys.scope.scope_type == ScopeType::Member
                && keys.scope.name == author.user_id
                && state.has_member(&author.user_id)
            {
                Ok(())
            } else {
                Err(MembershipError::NotOwnScope(keys.scope.clone()))
            }
        }

        Action::ChangeDeviceKeys { keys, .. } => {
            let owns_device = state
                .member(&author.user_id)
                .is_some_and(|member| member.devices.contains_key(&keys.scope.name));
            if keys.scope.scope_type == ScopeType::Device
                && keys.scope.name == author.device_id
                && owns_device
            {
                Ok(())
            } else {
                Err(MembershipError::NotOwnScope(keys.scope.clone()))
            }
        }

        Action::AddDevice { device, .. } => {
            if device.user_id == author.user_id && state.has_member(&author.user_id) {
                Ok(())
            } else {
                Err(MembershipError::NotOwnScope(Scope::device(
                    device.device_id.clone(),
                )))
            }
        }

        Action::RemoveDevice { device_id, .. } => {
            let own = state
                .member(&author.user_id)
                .is_some_and(|member| member.devices.contains_key(device_id));
            if own || state.is_admin(&author.user_id) {
                Ok(())
            } else {
                Err(MembershipError::NotAdmin(author.user_id.clone()))
            }
        }

        Action::AddMessage { .. } => {
            if state.has_member(&author.user_id) {
                Ok(())
            } else {
                Err(MembershipError::UnknownMember(author.user_id.clone()))
            }
        }

        _ => {
            if state.is_admin(&author.user_id) {
                Ok(())
            } else {
                Err(MembershipError::NotAdmin(author.user_id.clone()))
            }
        }
    }
}

/// Errors reported while reducing; they skip the offending link, never halt
/// the reduction.
#[derive(Debug, Error, PartialEq)]
pub enum MembershipError {
    #[error("{0} is not an admin")]
    NotAdmin(String),

    #[error("cannot remove {0}, the only admin")]
    CannotRemoveOnlyAdmin(String),

    #[error("the admin role cannot be removed")]
    CannotRemoveAdminRole,

    #[error("cannot remove {0}, a member's last device")]
    CannotRemoveLastDevice(String),

    #[error("{0} is already a member")]
    AlreadyMember(String),

    #[error("no member named {0}")]
    UnknownMember(String),

    #[error("role {0} already exists")]
    RoleExists(String),

    #[error("no role named {0}")]
    UnknownRole(String),

    #[error("no device named {0}")]
    UnknownDevice(String),

    #[error("device id {0} already belongs to another member")]
    DeviceIdInUse(String),

    #[error("server {0} already exists")]
    ServerExists(String),

    #[error("no server named {0}")]
    UnknownServer(String),

    #[error("invitation {0} already exists")]
    InvitationExists(Hash),

    #[error("keys for {0} are not newer than the current generation")]
    StaleKeys(Scope),

    #[error("action may only touch the author's own scope, not {0}")]
    NotOwnScope(Scope),

    #[error("root link must be the first link")]
    RootNotFirst,

    #[error(transparent)]
    Invitation(#[from] InvitationError),
}
