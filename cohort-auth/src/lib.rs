// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decentralized team membership.
//!
//! A team is defined by an append-only, signed graph of membership events.
//! Every peer independently linearizes the graph ([`graph`]), reconciles
//! concurrent branches ([`resolver`]) and folds the result into an identical
//! team state ([`reducer`]). The [`team`] facade wraps the whole pipeline
//! behind mutation and query methods; [`keyset`], [`lockbox`] and
//! [`invitation`] supply the key management that removal semantics depend
//! on.
pub mod action;
pub mod graph;
pub mod invitation;
pub mod keyset;
pub mod lockbox;
pub mod reducer;
pub mod resolver;
pub mod state;
pub mod team;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

pub use action::{Action, Author};
pub use graph::{Graph, GraphError, Link};
pub use invitation::{Invitation, InvitationError, InvitationId, ProofOfInvitation};
pub use keyset::{KeysetPublic, KeysetWithSecrets, Scope, ScopeType};
pub use lockbox::{Lockbox, LockboxError};
pub use reducer::MembershipError;
pub use resolver::{Concat, MergeContext, Resolver, StrongRemove};
pub use state::{ADMIN_ROLE, Device, Member, Role, Server, TeamState};
pub use team::{
    Encrypted, Keyring, LocalContext, LocalDevice, LocalUser, Team, TeamError, TeamEvent,
};
