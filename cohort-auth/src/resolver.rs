// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reconciliation of concurrent branches.
//!
//! When two branches of the membership graph meet at a merge link, a
//! [`Resolver`] decides which of their links survive linearization and in
//! what order. [`StrongRemove`] implements the policy used for teams:
//! concurrent mutual removals and demotions are settled by seniority, and
//! every action taken by a principal whose authority was concurrently
//! revoked is invalidated along with it.
use std::collections::{HashMap, HashSet};

use cohort_core::Hash;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::action::Action;
use crate::graph::Graph;
use crate::state::ADMIN_ROLE;

/// What a resolver gets to look at when reconciling one merge: the graph
/// itself and the linearized sequence up to the branches' common ancestor.
pub struct MergeContext<'a> {
    graph: &'a Graph,
    prefix: &'a [Hash],
}

impl<'a> MergeContext<'a> {
    pub(crate) fn new(graph: &'a Graph, prefix: &'a [Hash]) -> Self {
        Self { graph, prefix }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// The linearized sequence from the root up to and including the common
    /// ancestor of the two branches.
    pub fn prefix(&self) -> &[Hash] {
        self.prefix
    }
}

/// A pure branch-reconciliation policy, injected into
/// [`Graph::sequence`](crate::graph::Graph::sequence) by value.
pub trait Resolver {
    /// Reconcile two concurrent branches (common ancestor excluded) into one
    /// linear run of surviving links.
    fn resolve(
        &self,
        context: &MergeContext<'_>,
        branch_a: Vec<Hash>,
        branch_b: Vec<Hash>,
    ) -> Vec<Hash>;
}

/// Keep everything; order the two branches by their sort key.
///
/// The default when no policy applies, and the tie-break both peers agree on
/// without any shared state.
#[derive(Clone, Copy, Debug, Default)]
pub struct Concat;

impl Resolver for Concat {
    fn resolve(
        &self,
        _context: &MergeContext<'_>,
        branch_a: Vec<Hash>,
        branch_b: Vec<Hash>,
    ) -> Vec<Hash> {
        let (mut first, second) = if branch_a <= branch_b {
            (branch_a, branch_b)
        } else {
            (branch_b, branch_a)
        };
        first.extend(second);
        first
    }
}

/// An authority-revoking action: a member removal, an admin demotion or a
/// device removal.
#[derive(Clone, Debug)]
struct Revocation {
    actor: String,
    target: String,
    hash: Hash,
}

/// Strong-remove reconciliation.
///
/// 1. Concurrent revocations forming a cycle (two admins removing each
///    other, or a longer ring of demotions) are settled by seniority: a
///    revocation whose target is senior to its actor is dropped. Cycle
///    detection builds an authority graph over (principal, revocation)
///    nodes and runs Tarjan's strongly-connected-components algorithm, so
///    rings of any length resolve, not just mutual pairs.
/// 2. Every surviving revocation invalidates the target's links on the
///    opposite branch, cascading through members they introduced there. A
///    targeted principal's own key rotations and device additions are
///    exempt: losing admin must not brick a member's devices.
/// 3. Redundant revocations of the same target survive on both sides; the
///    reducer treats the later ones as no-ops.
///
/// Survivors from both branches are interleaved by timestamp with ties
/// broken by hash, so both peers produce the identical sequence.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrongRemove;

impl Resolver for StrongRemove {
    fn resolve(
        &self,
        context: &MergeContext<'_>,
        branch_a: Vec<Hash>,
        branch_b: Vec<Hash>,
    ) -> Vec<Hash> {
        let ranks = principal_ranks(context);
        let mut dropped = cycle_losers(context.graph(), &ranks);

        let revocations_a = revocations_in(context.graph(), &branch_a);
        let revocations_b = revocations_in(context.graph(), &branch_b);

        // Cascade: invalidate links authored by targets of surviving
        // revocations from the opposite branch, and by members introduced
        // through links that were themselves dropped.
        loop {
            let surviving_targets_a: HashSet<&String> = revocations_a
                .iter()
                .filter(|revocation| !dropped.contains(&revocation.hash))
                .map(|revocation| &revocation.target)
                .collect();
            let surviving_targets_b: HashSet<&String> = revocations_b
                .iter()
                .filter(|revocation| !dropped.contains(&revocation.hash))
                .map(|revocation| &revocation.target)
                .collect();

            let dropped_before = dropped.len();
            cascade(context.graph(), &branch_b, &surviving_targets_a, &mut dropped);
            cascade(context.graph(), &branch_a, &surviving_targets_b, &mut dropped);
            if dropped.len() == dropped_before {
                break;
            }
        }

        interleave(context.graph(), &branch_a, &branch_b, &dropped)
    }
}

/// Find every revocation that loses a concurrent mutual-revocation cycle.
///
/// Builds the authority graph over the whole membership graph: one node per
/// (principal, revocation), a base edge from actor to target within each
/// revocation, and a linking edge between two revocations whenever they are
/// concurrent and one's target is the other's actor. Strongly connected
/// components of size two or more are mutual-revocation cycles; inside a
/// cycle, a revocation aimed at a principal senior to its own actor loses.
fn cycle_losers(graph: &Graph, ranks: &HashMap<String, usize>) -> HashSet<Hash> {
    let all = all_revocations(graph);
    if all.len() < 2 {
        return HashSet::new();
    }

    let deps = graph.dependency_graph();
    let mut authority: DiGraph<(String, Hash), ()> = DiGraph::new();
    let mut nodes: HashMap<(String, Hash), NodeIndex> = HashMap::new();

    let ensure_node = |authority: &mut DiGraph<(String, Hash), ()>,
                           nodes: &mut HashMap<(String, Hash), NodeIndex>,
                           key: (String, Hash)| {
        *nodes
            .entry(key.clone())
            .or_insert_with(|| authority.add_node(key))
    };

    for revocation in &all {
        let from = ensure_node(
            &mut authority,
            &mut nodes,
            (revocation.actor.clone(), revocation.hash),
        );
        let to = ensure_node(
            &mut authority,
            &mut nodes,
            (revocation.target.clone(), revocation.hash),
        );
        if authority.find_edge(from, to).is_none() {
            authority.add_edge(from, to, ());
        }
    }

    for outer in &all {
        for inner in &all {
            if !Graph::is_concurrent(&deps, outer.hash, inner.hash) {
                continue;
            }
            if outer.target == inner.actor {
                let from = nodes[&(outer.target.clone(), outer.hash)];
                let to = nodes[&(inner.actor.clone(), inner.hash)];
                if authority.find_edge(from, to).is_none() {
                    authority.add_edge(from, to, ());
                }
            }
        }
    }

    // Revocations inside a strongly connected component are mutual.
    let mut cycle_ops: HashSet<Hash> = HashSet::new();
    for component in petgraph::algo::tarjan_scc(&authority) {
        if component.len() < 2 {
            continue;
        }
        for index in component {
            cycle_ops.insert(authority[index].1);
        }
    }

    let mut losers = HashSet::new();
    for revocation in &all {
        if !cycle_ops.contains(&revocation.hash) {
            continue;
        }
        if rank(ranks, &revocation.target) < rank(ranks, &revocation.actor) {
            debug!(
                actor = %revocation.actor,
                target = %revocation.target,
                "dropping junior side of mutual revocation cycle"
            );
            losers.insert(revocation.hash);
        }
    }
    losers
}

/// Drop every link in `branch` authored by an invalidated principal,
/// following admissions: a member added by a dropped link is invalid too.
fn cascade(
    graph: &Graph,
    branch: &[Hash],
    targets: &HashSet<&String>,
    dropped: &mut HashSet<Hash>,
) {
    let mut invalid: HashSet<String> = targets.iter().map(|user| (*user).clone()).collect();

    // Members introduced by already-dropped links of this branch.
    for hash in branch {
        if dropped.contains(hash)
            && let Some(user_id) = introduced_member(graph, hash)
        {
            invalid.insert(user_id);
        }
    }

    loop {
        let mut changed = false;
        for hash in branch {
            if dropped.contains(hash) {
                continue;
            }
            let Some(link) = graph.get(hash) else {
                continue;
            };
            let Some(author) = link.author() else {
                continue;
            };
            if !invalid.contains(&author.user_id) {
                continue;
            }
            // A targeted principal keeps their own key rotations and device
            // additions.
            if matches!(
                link.action(),
                Some(Action::ChangeMemberKeys { .. }) | Some(Action::AddDevice { .. })
            ) {
                continue;
            }
            debug!(link = %hash.fmt_short(), author = %author.user_id, "cascading invalidation");
            dropped.insert(*hash);
            changed = true;
            if let Some(user_id) = introduced_member(graph, hash) {
                invalid.insert(user_id);
            }
        }
        if !changed {
            break;
        }
    }
}

/// The member a link introduces to the team, if any.
fn introduced_member(graph: &Graph, hash: &Hash) -> Option<String> {
    match graph.get(hash)?.action()? {
        Action::AddMember { member, .. } | Action::Admit { member, .. } => {
            Some(member.user_id.clone())
        }
        _ => None,
    }
}

/// Extract authority-revoking actions from a set of links.
fn revocations_in(graph: &Graph, links: &[Hash]) -> Vec<Revocation> {
    let device_owners = device_owners(graph);
    links
        .iter()
        .filter_map(|hash| revocation(graph, *hash, &device_owners))
        .collect()
}

/// Every revocation anywhere in the graph.
fn all_revocations(graph: &Graph) -> Vec<Revocation> {
    let device_owners = device_owners(graph);
    graph
        .links()
        .filter_map(|(hash, _)| revocation(graph, *hash, &device_owners))
        .collect()
}

fn revocation(
    graph: &Graph,
    hash: Hash,
    device_owners: &HashMap<String, String>,
) -> Option<Revocation> {
    let link = graph.get(&hash)?;
    let (action, author) = (link.action()?, link.author()?);

    let target = match action {
        Action::RemoveMember { user_id, .. } => Some(user_id.clone()),
        Action::RemoveMemberRole {
            user_id, role_name, ..
        } if role_name == ADMIN_ROLE => Some(user_id.clone()),
        Action::RemoveDevice { device_id, .. } => device_owners.get(device_id).cloned(),
        _ => None,
    }?;

    if target == author.user_id {
        return None;
    }
    Some(Revocation {
        actor: author.user_id.clone(),
        target,
        hash,
    })
}

/// Map every device id in the graph to its owning user.
fn device_owners(graph: &Graph) -> HashMap<String, String> {
    let mut owners = HashMap::new();
    for (_, link) in graph.links() {
        match link.action() {
            Some(Action::Root { founder, .. }) => {
                for device in founder.devices.values() {
                    owners.insert(device.device_id.clone(), founder.user_id.clone());
                }
            }
            Some(Action::AddMember { member, .. }) | Some(Action::Admit { member, .. }) => {
                for device in member.devices.values() {
                    owners.insert(device.device_id.clone(), member.user_id.clone());
                }
            }
            Some(Action::AddDevice { device, .. }) => {
                owners.insert(device.device_id.clone(), device.user_id.clone());
            }
            _ => {}
        }
    }
    owners
}

/// Rank every principal by seniority.
///
/// Principals are ordered by first appearance in the pre-merge sequence
/// (the founder ranks first). Principals who only appear later rank after
/// everyone in the prefix, ordered by the earliest link that mentions them;
/// the ordering is total and identical on both peers.
fn principal_ranks(context: &MergeContext<'_>) -> HashMap<String, usize> {
    let mut ranks: HashMap<String, usize> = HashMap::new();

    let mut mention = |ranks: &mut HashMap<String, usize>, user_id: &str| {
        let next = ranks.len();
        ranks.entry(user_id.to_string()).or_insert(next);
    };

    for hash in context.prefix() {
        let Some(link) = context.graph().get(hash) else {
            continue;
        };
        if let Some(author) = link.author() {
            mention(&mut ranks, &author.user_id);
        }
        match link.action() {
            Some(Action::Root { founder, .. }) => mention(&mut ranks, &founder.user_id),
            Some(Action::AddMember { member, .. }) | Some(Action::Admit { member, .. }) => {
                mention(&mut ranks, &member.user_id)
            }
            _ => {}
        }
    }

    // Principals outside the prefix: order by the earliest (timestamp, hash)
    // mentioning them so the ranking is the same on every peer.
    let mut unseen: HashMap<String, (u64, Hash)> = HashMap::new();
    for (hash, link) in context.graph().links() {
        let Some(timestamp) = link.timestamp() else {
            continue;
        };
        let mut late_mention = |user_id: &str| {
            if ranks.contains_key(user_id) {
                return;
            }
            let key = (timestamp, *hash);
            unseen
                .entry(user_id.to_string())
                .and_modify(|existing| {
                    if key < *existing {
                        *existing = key;
                    }
                })
                .or_insert(key);
        };
        if let Some(author) = link.author() {
            late_mention(&author.user_id);
        }
        match link.action() {
            Some(Action::Root { founder, .. }) => late_mention(&founder.user_id),
            Some(Action::AddMember { member, .. }) | Some(Action::Admit { member, .. }) => {
                late_mention(&member.user_id)
            }
            _ => {}
        }
    }

    let mut late: Vec<(String, (u64, Hash))> = unseen.into_iter().collect();
    late.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    for (user_id, _) in late {
        let next = ranks.len();
        ranks.insert(user_id, next);
    }

    ranks
}

fn rank(ranks: &HashMap<String, usize>, user_id: &str) -> usize {
    ranks.get(user_id).copied().unwrap_or(usize::MAX)
}

/// Interleave the surviving links of both branches by timestamp, preserving
/// each branch's internal order; ties break by hash.
fn interleave(
    graph: &Graph,
    branch_a: &[Hash],
    branch_b: &[Hash],
    dropped: &HashSet<Hash>,
) -> Vec<Hash> {
    let keyed = |branch: &[Hash]| -> Vec<(u64, Hash)> {
        let mut last_ts = 0;
        branch
            .iter()
            .filter(|hash| !dropped.contains(*hash))
            .map(|hash| {
                // Merge links carry no timestamp; they stay behind the last
                // signed link of their branch.
                let ts = graph
                    .get(hash)
                    .and_then(|link| link.timestamp())
                    .unwrap_or(last_ts);
                last_ts = last_ts.max(ts);
                (ts, *hash)
            })
            .collect()
    };

    let left = keyed(branch_a);
    let right = keyed(branch_b);

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if left[i] <= right[j] {
            merged.push(left[i].1);
            i += 1;
        } else {
            merged.push(right[j].1);
            j += 1;
        }
    }
    merged.extend(left[i..].iter().map(|(_, hash)| *hash));
    merged.extend(right[j..].iter().map(|(_, hash)| *hash));
    merged
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{TestTeam, alice, bob, charlie, dwight};

    #[test]
    fn mutual_demotion_senior_wins() {
        // alice founds the team, bob is made admin, then each demotes the
        // other while disconnected.
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);

        let mut theirs = TestTeam::with_graph(ours.graph.clone());
        theirs.demote(&bob(), "alice", 30);
        ours.demote(&alice(), "bob", 20);

        ours.graph.merge(&theirs.graph).unwrap();
        let state = ours.state();

        assert!(state.is_admin("alice"), "the senior admin keeps her role");
        assert!(!state.is_admin("bob"), "the junior admin loses his");
        assert!(state.has_member("bob"), "bob is demoted, not removed");
    }

    #[test]
    fn mutual_removal_senior_wins() {
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);

        let mut theirs = TestTeam::with_graph(ours.graph.clone());
        theirs.remove_member(&bob(), "alice", 30);
        ours.remove_member(&alice(), "bob", 20);

        ours.graph.merge(&theirs.graph).unwrap();
        let state = ours.state();

        assert!(state.has_member("alice"));
        assert!(!state.has_member("bob"));
        assert!(state.removed_members.contains_key("bob"));
    }

    #[test]
    fn circular_demotion_resolves_by_seniority() {
        // bob demotes charlie, charlie demotes alice, alice demotes bob,
        // all concurrently; dwight sees all three branches.
        let mut base = TestTeam::new();
        base.add_member(&alice(), "bob", true, 10);
        base.add_member(&alice(), "charlie", true, 20);
        base.add_member(&alice(), "dwight", false, 30);

        let mut branch_bob = TestTeam::with_graph(base.graph.clone());
        branch_bob.demote(&bob(), "charlie", 40);

        let mut branch_charlie = TestTeam::with_graph(base.graph.clone());
        branch_charlie.demote(&charlie(), "alice", 41);

        let mut branch_alice = TestTeam::with_graph(base.graph.clone());
        branch_alice.demote(&alice(), "bob", 42);

        let mut dwight_graph = base.graph.clone();
        dwight_graph.merge(&branch_bob.graph).unwrap();
        dwight_graph.merge(&branch_charlie.graph).unwrap();
        dwight_graph.merge(&branch_alice.graph).unwrap();

        let state = TestTeam::with_graph(dwight_graph).state();

        assert!(state.is_admin("alice"), "most senior admin survives");
        assert!(!state.is_admin("bob"), "bob lost to alice's demotion");
        assert!(
            state.is_admin("charlie"),
            "bob's demotion of charlie was invalidated"
        );
        assert!(state.has_member("dwight"));
    }

    #[test]
    fn removed_member_actions_cascade() {
        // While disconnected, alice removes bob; bob meanwhile invites
        // charlie into the team. bob's branch is invalidated wholesale.
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);

        let mut theirs = TestTeam::with_graph(ours.graph.clone());
        theirs.add_member(&bob(), "charlie", false, 30);

        ours.remove_member(&alice(), "bob", 20);

        ours.graph.merge(&theirs.graph).unwrap();
        let state = ours.state();

        assert!(!state.has_member("bob"));
        assert!(
            !state.has_member("charlie"),
            "members added by a removed admin are not admitted"
        );
    }

    #[test]
    fn demoted_member_keeps_own_devices() {
        // bob adds a phone concurrently with alice demoting him; the device
        // addition survives.
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);

        let mut theirs = TestTeam::with_graph(ours.graph.clone());
        let phone = crate::state::Device {
            device_id: "bob-phone".to_string(),
            user_id: "bob".to_string(),
            keys: crate::keyset::KeysetWithSecrets::from_seed(
                crate::keyset::Scope::device("bob-phone"),
                b"bob-phone",
            )
            .public(),
        };
        theirs.add_device(&bob(), phone, 30);

        ours.demote(&alice(), "bob", 20);

        ours.graph.merge(&theirs.graph).unwrap();
        let state = ours.state();

        assert!(!state.is_admin("bob"));
        let bob_record = state.member("bob").unwrap();
        assert!(bob_record.devices.contains_key("bob-phone"));
    }

    #[test]
    fn concurrent_removals_of_same_target_are_idempotent() {
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);
        ours.add_member(&alice(), "charlie", false, 20);

        let mut theirs = TestTeam::with_graph(ours.graph.clone());
        theirs.remove_member(&bob(), "charlie", 40);
        ours.remove_member(&alice(), "charlie", 30);

        ours.graph.merge(&theirs.graph).unwrap();
        let state = ours.state();

        assert!(!state.has_member("charlie"));
        assert!(state.has_member("alice"));
        assert!(state.has_member("bob"));
        assert!(state.is_admin("bob"), "redundant removals cancel nothing");
    }

    #[test]
    fn convergence_regardless_of_merge_order() {
        let mut base = TestTeam::new();
        base.add_member(&alice(), "bob", true, 10);

        let mut branch_a = TestTeam::with_graph(base.graph.clone());
        branch_a.demote(&alice(), "bob", 20);
        branch_a.add_role(&alice(), "managers", 21);

        let mut branch_b = TestTeam::with_graph(base.graph.clone());
        branch_b.demote(&bob(), "alice", 30);

        let mut ab = branch_a.graph.clone();
        ab.merge(&branch_b.graph).unwrap();

        let mut ba = branch_b.graph.clone();
        ba.merge(&branch_a.graph).unwrap();

        assert_eq!(ab.head(), ba.head());
        assert_eq!(
            TestTeam::with_graph(ab).state(),
            TestTeam::with_graph(ba).state()
        );
    }

    #[test]
    fn later_actions_never_resurrect_dropped_ones() {
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);

        let mut theirs = TestTeam::with_graph(ours.graph.clone());
        theirs.add_member(&bob(), "charlie", false, 30);
        ours.remove_member(&alice(), "bob", 20);
        ours.graph.merge(&theirs.graph).unwrap();

        assert!(!ours.state().has_member("charlie"));

        // More unrelated activity after the merge.
        ours.add_role(&alice(), "managers", 50);

        let state = ours.state();
        assert!(!state.has_member("charlie"));
        assert!(!state.has_member("bob"));
        assert!(state.has_role("managers"));
    }

    #[test]
    fn dwight_is_ranked_junior_to_all() {
        // A removal by a junior admin of a senior admin sticks when there is
        // no concurrent counter-action.
        let mut ours = TestTeam::new();
        ours.add_member(&alice(), "bob", true, 10);
        ours.add_member(&alice(), "dwight", true, 20);
        ours.remove_member(&dwight(), "bob", 30);

        let state = ours.state();
        assert!(!state.has_member("bob"), "unopposed removals always apply");
    }
}
