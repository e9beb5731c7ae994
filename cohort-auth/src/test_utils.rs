// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic fixtures for graph, resolver and reducer tests.
//!
//! Every test actor derives their keys from their name, so links built in
//! different tests (or different processes) are byte-identical and hashes
//! stay stable.
use crate::action::{Action, Author};
use crate::graph::Graph;
use crate::keyset::{KeysetWithSecrets, Scope};
use crate::reducer;
use crate::resolver::StrongRemove;
use crate::state::{ADMIN_ROLE, Device, Member, Role, TeamState};
use crate::team::{LocalContext, LocalDevice, LocalUser};

pub fn member_keys_for(user_id: &str) -> KeysetWithSecrets {
    KeysetWithSecrets::from_seed(Scope::member(user_id), user_id.as_bytes())
}

pub fn device_id_for(user_id: &str) -> String {
    format!("{user_id}-laptop")
}

pub fn device_keys_for(user_id: &str) -> KeysetWithSecrets {
    KeysetWithSecrets::from_seed(Scope::device(device_id_for(user_id)), user_id.as_bytes())
}

pub fn author(user_id: &str) -> Author {
    Author {
        user_id: user_id.to_string(),
        device_id: device_id_for(user_id),
    }
}

pub fn alice() -> Author {
    author("alice")
}

pub fn bob() -> Author {
    author("bob")
}

pub fn charlie() -> Author {
    author("charlie")
}

pub fn dwight() -> Author {
    author("dwight")
}

pub fn device_record(user_id: &str) -> Device {
    Device {
        device_id: device_id_for(user_id),
        user_id: user_id.to_string(),
        keys: device_keys_for(user_id).public(),
    }
}

pub fn member_record(user_id: &str, admin: bool) -> Member {
    let mut roles = std::collections::BTreeSet::new();
    if admin {
        roles.insert(ADMIN_ROLE.to_string());
    }
    Member {
        user_id: user_id.to_string(),
        keys: member_keys_for(user_id).public(),
        roles,
        devices: [(device_id_for(user_id), device_record(user_id))].into(),
    }
}

pub fn context_for(user_id: &str) -> LocalContext {
    LocalContext {
        user: LocalUser {
            user_id: user_id.to_string(),
            keys: member_keys_for(user_id),
        },
        device: LocalDevice {
            user_id: user_id.to_string(),
            device_id: device_id_for(user_id),
            keys: device_keys_for(user_id),
        },
    }
}

/// A bare graph with helpers for hand-building membership histories.
///
/// Links carry no lockboxes; tests that exercise key rotation go through the
/// full [`Team`](crate::team::Team) facade instead.
pub struct TestTeam {
    pub graph: Graph,
}

impl TestTeam {
    /// A team founded by alice at timestamp 0.
    pub fn new() -> Self {
        let graph = Graph::create(
            Action::Root {
                team_name: "spies".to_string(),
                founder: member_record("alice", true),
                lockboxes: vec![],
            },
            alice(),
            0,
            &device_keys_for("alice").signing,
        )
        .expect("root link is valid");
        Self { graph }
    }

    pub fn with_graph(graph: Graph) -> Self {
        Self { graph }
    }

    pub fn append(&mut self, author: &Author, action: Action, timestamp: u64) -> cohort_core::Hash {
        self.graph
            .append(
                action,
                author.clone(),
                timestamp,
                &device_keys_for(&author.user_id).signing,
            )
            .expect("append to test graph")
    }

    pub fn add_member(
        &mut self,
        author: &Author,
        user_id: &str,
        admin: bool,
        timestamp: u64,
    ) -> cohort_core::Hash {
        let roles = if admin {
            vec![ADMIN_ROLE.to_string()]
        } else {
            vec![]
        };
        self.append(
            author,
            Action::AddMember {
                member: member_record(user_id, admin),
                roles,
                lockboxes: vec![],
            },
            timestamp,
        )
    }

    pub fn add_role(&mut self, author: &Author, name: &str, timestamp: u64) -> cohort_core::Hash {
        self.append(
            author,
            Action::AddRole {
                role: Role {
                    name: name.to_string(),
                },
                lockboxes: vec![],
            },
            timestamp,
        )
    }

    pub fn remove_member(
        &mut self,
        author: &Author,
        user_id: &str,
        timestamp: u64,
    ) -> cohort_core::Hash {
        self.append(
            author,
            Action::RemoveMember {
                user_id: user_id.to_string(),
                lockboxes: vec![],
            },
            timestamp,
        )
    }

    /// Revoke the admin role.
    pub fn demote(&mut self, author: &Author, user_id: &str, timestamp: u64) -> cohort_core::Hash {
        self.append(
            author,
            Action::RemoveMemberRole {
                user_id: user_id.to_string(),
                role_name: ADMIN_ROLE.to_string(),
                lockboxes: vec![],
            },
            timestamp,
        )
    }

    pub fn add_device(
        &mut self,
        author: &Author,
        device: Device,
        timestamp: u64,
    ) -> cohort_core::Hash {
        self.append(
            author,
            Action::AddDevice {
                device,
                lockboxes: vec![],
            },
            timestamp,
        )
    }

    pub fn remove_device(
        &mut self,
        author: &Author,
        device_id: &str,
        timestamp: u64,
    ) -> cohort_core::Hash {
        self.append(
            author,
            Action::RemoveDevice {
                device_id: device_id.to_string(),
                lockboxes: vec![],
            },
            timestamp,
        )
    }

    /// Reduce with the strong-remove resolver.
    pub fn state(&self) -> TeamState {
        reducer::reduce(&self.graph, &StrongRemove).expect("test graph reduces")
    }
}

impl Default for TestTeam {
    fn default() -> Self {
        Self::new()
    }
}
