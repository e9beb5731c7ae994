// SPDX-License-Identifier: MIT OR Apache-2.0

//! The signed membership graph.
//!
//! An append-only DAG of links addressed by the BLAKE3 hash of their
//! canonical CBOR encoding. Action links carry a payload, author context and
//! a detached signature by the author's device; merge links join two
//! concurrent heads and are identified purely by their (sorted) parents, so
//! both sides of a merge derive the identical link.
//!
//! Tampering anywhere is detectable: changing a body changes its hash,
//! breaking every descendant's parent reference, and changing a recorded
//! hash breaks the signature check.
mod sequence;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use cohort_core::cbor;
use cohort_core::{Hash, Signature, SigningKey, VerifyingKey};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{Action, Author};

/// The signed portion of an action link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkBody {
    pub action: Action,
    pub author: Author,

    /// Milliseconds since the epoch at the author's clock.
    pub timestamp: u64,

    /// Hashes of the preceding link(s); empty only for the root.
    pub prev: Vec<Hash>,
}

/// An action link: body plus a detached signature over the body hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedLink {
    pub body: LinkBody,
    pub signature: Signature,
}

impl SignedLink {
    /// Hash the canonical encoding of the body and sign it.
    pub fn seal(body: LinkBody, signing_key: &SigningKey) -> Self {
        let hash = body_hash(&body);
        let signature = signing_key.sign(hash.as_bytes());
        Self { body, signature }
    }

    pub fn hash(&self) -> Hash {
        body_hash(&self.body)
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), GraphError> {
        key.verify(self.hash().as_bytes(), &self.signature)
            .map_err(|_| GraphError::InvalidSignature(self.hash()))
    }
}

fn body_hash(body: &LinkBody) -> Hash {
    let bytes = cbor::encode(body).expect("link body is serializable");
    Hash::new(bytes)
}

/// A merge link joining two concurrent heads.
///
/// Unsigned; its identity is its parents. Parents are kept sorted so the
/// hash does not depend on which peer created the merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLink {
    pub parents: [Hash; 2],
}

impl MergeLink {
    pub fn new(a: Hash, b: Hash) -> Self {
        let parents = if a <= b { [a, b] } else { [b, a] };
        Self { parents }
    }

    pub fn hash(&self) -> Hash {
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(self.parents[0].as_bytes());
        material.extend_from_slice(self.parents[1].as_bytes());
        Hash::derive("cohort merge link", &material)
    }
}

/// One node in the membership graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Link {
    Signed(SignedLink),
    Merge(MergeLink),
}

impl Link {
    pub fn hash(&self) -> Hash {
        match self {
            Link::Signed(link) => link.hash(),
            Link::Merge(link) => link.hash(),
        }
    }

    pub fn prev(&self) -> &[Hash] {
        match self {
            Link::Signed(link) => &link.body.prev,
            Link::Merge(link) => &link.parents,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match self {
            Link::Signed(link) => Some(&link.body.action),
            Link::Merge(_) => None,
        }
    }

    pub fn author(&self) -> Option<&Author> {
        match self {
            Link::Signed(link) => Some(&link.body.author),
            Link::Merge(_) => None,
        }
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Link::Signed(link) => Some(link.body.timestamp),
            Link::Merge(_) => None,
        }
    }

    pub fn is_root(&self) -> bool {
        match self {
            Link::Signed(link) => link.body.prev.is_empty(),
            Link::Merge(_) => false,
        }
    }
}

/// The append-only membership graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    root: Hash,
    head: Hash,
    links: BTreeMap<Hash, Link>,
}

impl Graph {
    /// Create a new graph from a root action.
    pub fn create(
        action: Action,
        author: Author,
        timestamp: u64,
        signing_key: &SigningKey,
    ) -> Result<Self, GraphError> {
        if !action.is_root() {
            return Err(GraphError::Tampered("first link must be a root".into()));
        }

        let link = SignedLink::seal(
            LinkBody {
                action,
                author,
                timestamp,
                prev: vec![],
            },
            signing_key,
        );
        let hash = link.hash();

        let mut links = BTreeMap::new();
        links.insert(hash, Link::Signed(link));

        Ok(Self {
            root: hash,
            head: hash,
            links,
        })
    }

    /// Append an action to the current head and return the new head hash.
    pub fn append(
        &mut self,
        action: Action,
        author: Author,
        timestamp: u64,
        signing_key: &SigningKey,
    ) -> Result<Hash, GraphError> {
        if action.is_root() {
            return Err(GraphError::MultipleRoots);
        }

        let link = SignedLink::seal(
            LinkBody {
                action,
                author,
                timestamp,
                prev: vec![self.head],
            },
            signing_key,
        );
        let hash = link.hash();
        self.links.insert(hash, Link::Signed(link));
        self.head = hash;
        Ok(hash)
    }

    /// Merge another graph into this one.
    ///
    /// The union of both link tables, with the head resolved to whichever
    /// existing head descends from the other, or to a fresh merge link when
    /// the heads have truly diverged. Commutative: both peers end up with the
    /// same head regardless of who merges whom.
    pub fn merge(&mut self, other: &Graph) -> Result<Hash, GraphError> {
        if self.root != other.root {
            return Err(GraphError::DifferentRoot);
        }
        for (hash, link) in &other.links {
            self.links.entry(*hash).or_insert_with(|| link.clone());
        }
        self.merge_head(other.head)
    }

    /// Add links received from a peer and merge with their head.
    pub fn merge_links(&mut self, links: Vec<Link>, their_head: Hash) -> Result<Hash, GraphError> {
        for link in links {
            let hash = link.hash();
            self.links.entry(hash).or_insert(link);
        }
        // Every parent of every link must now be present.
        for (hash, link) in &self.links {
            for parent in link.prev() {
                if !self.links.contains_key(parent) {
                    return Err(GraphError::DanglingParent(*hash, *parent));
                }
            }
        }
        if !self.links.contains_key(&their_head) {
            return Err(GraphError::UnknownLink(their_head));
        }
        self.merge_head(their_head)
    }

    fn merge_head(&mut self, their_head: Hash) -> Result<Hash, GraphError> {
        if their_head == self.head {
            return Ok(self.head);
        }
        if self.ancestors(self.head)?.contains(&their_head) {
            return Ok(self.head);
        }
        if self.ancestors(their_head)?.contains(&self.head) {
            self.head = their_head;
            return Ok(self.head);
        }

        let merge = MergeLink::new(self.head, their_head);
        let hash = merge.hash();
        self.links.insert(hash, Link::Merge(merge));
        self.head = hash;
        Ok(hash)
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn head(&self) -> Hash {
        self.head
    }

    pub fn get(&self, hash: &Hash) -> Option<&Link> {
        self.links.get(hash)
    }

    pub(crate) fn link(&self, hash: &Hash) -> Result<&Link, GraphError> {
        self.links.get(hash).ok_or(GraphError::UnknownLink(*hash))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.links.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// All link hashes in the graph.
    pub fn hashes(&self) -> Vec<Hash> {
        self.links.keys().copied().collect()
    }

    /// Iterate over all links in hash order.
    pub fn links(&self) -> impl Iterator<Item = (&Hash, &Link)> {
        self.links.iter()
    }

    /// Links present here but absent from the given set.
    pub fn links_missing_from(&self, theirs: &HashSet<Hash>) -> Vec<Link> {
        self.links
            .iter()
            .filter(|(hash, _)| !theirs.contains(*hash))
            .map(|(_, link)| link.clone())
            .collect()
    }

    /// The hashes of a link's ancestors, including the link itself.
    pub fn ancestors(&self, from: Hash) -> Result<HashSet<Hash>, GraphError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash) {
                continue;
            }
            let link = self.link(&hash)?;
            for parent in link.prev() {
                queue.push_back(*parent);
            }
        }
        Ok(seen)
    }

    /// Dependency graph over all links, edges pointing parent → child.
    pub(crate) fn dependency_graph(&self) -> DiGraphMap<Hash, ()> {
        let mut graph = DiGraphMap::new();
        for (hash, link) in &self.links {
            graph.add_node(*hash);
            for parent in link.prev() {
                graph.add_edge(*parent, *hash, ());
            }
        }
        graph
    }

    /// Return `true` if a path exists in the dependency graph from `from` to
    /// `to`, i.e. `to` causally depends on `from`.
    pub(crate) fn has_path(deps: &DiGraphMap<Hash, ()>, from: Hash, to: Hash) -> bool {
        let mut dfs = petgraph::visit::Dfs::new(deps, from);
        while let Some(node) = dfs.next(deps) {
            if node == to {
                return true;
            }
        }
        false
    }

    /// Two links are concurrent when neither depends on the other.
    pub(crate) fn is_concurrent(deps: &DiGraphMap<Hash, ()>, a: Hash, b: Hash) -> bool {
        a != b && !Self::has_path(deps, a, b) && !Self::has_path(deps, b, a)
    }

    /// Check the structural and cryptographic integrity of the whole graph.
    pub fn validate(&self) -> Result<(), GraphError> {
        // Exactly one root, and it is the recorded one.
        for (hash, link) in &self.links {
            if link.is_root() && *hash != self.root {
                return Err(GraphError::MultipleRoots);
            }
            if let Some(action) = link.action()
                && action.is_root()
                && *hash != self.root
            {
                return Err(GraphError::MultipleRoots);
            }
        }
        let root_link = self.link(&self.root)?;
        if !root_link.is_root() {
            return Err(GraphError::Tampered("recorded root is not a root link".into()));
        }

        // Every recorded hash matches its link's content, every parent exists.
        for (hash, link) in &self.links {
            if link.hash() != *hash {
                return Err(GraphError::Tampered(format!(
                    "link {} does not match its recorded hash",
                    hash.fmt_short()
                )));
            }
            for parent in link.prev() {
                if !self.links.contains_key(parent) {
                    return Err(GraphError::DanglingParent(*hash, *parent));
                }
            }
        }

        // The root is reachable from the head.
        if !self.ancestors(self.head)?.contains(&self.root) {
            return Err(GraphError::Tampered("root is not reachable from head".into()));
        }

        self.validate_signatures()
    }

    /// Verify every signature against the device keys recorded in the graph
    /// up to that link's position.
    ///
    /// Links are visited in topological order while collecting the signing
    /// keys introduced by root, admission, device-addition and key-rotation
    /// payloads. Keys are recorded per (user, device) pair, so a device id
    /// registered by one member never vouches for a link claiming another
    /// member as its author. A link introducing its own signer (the root, a
    /// first device joining) verifies against the key it carries. Because
    /// key rotations can sit on concurrent branches, every generation of a
    /// device's key is accepted; a forged body still fails against all of
    /// them.
    fn validate_signatures(&self) -> Result<(), GraphError> {
        let order = self.topological_order()?;
        let mut device_keys: HashMap<(String, String), Vec<VerifyingKey>> = HashMap::new();

        for hash in order {
            let link = self.link(&hash)?;
            let Link::Signed(signed) = link else {
                continue;
            };

            // Keys introduced by this very link are valid for its own
            // signature.
            record_introduced_keys(signed, &mut device_keys);

            let author = &signed.body.author;
            let signer = (author.user_id.clone(), author.device_id.clone());
            let Some(known) = device_keys.get(&signer) else {
                return Err(GraphError::UnknownAuthor(hash, author.device_id.clone()));
            };
            if !known.iter().any(|key| signed.verify(key).is_ok()) {
                return Err(GraphError::InvalidSignature(hash));
            }
        }
        Ok(())
    }

    /// Deterministic topological order over all links.
    fn topological_order(&self) -> Result<Vec<Hash>, GraphError> {
        let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();
        let mut pending: BTreeMap<Hash, usize> = BTreeMap::new();
        for (hash, link) in &self.links {
            pending.insert(*hash, link.prev().len());
            for parent in link.prev() {
                children.entry(*parent).or_default().push(*hash);
            }
        }

        let mut ready: Vec<Hash> = pending
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(hash, _)| *hash)
            .collect();
        let mut order = Vec::with_capacity(self.links.len());

        while let Some(hash) = ready.pop() {
            order.push(hash);
            for child in children.get(&hash).into_iter().flatten() {
                let degree = pending
                    .get_mut(child)
                    .expect("every child is a known link");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(*child);
                }
            }
        }

        if order.len() != self.links.len() {
            return Err(GraphError::Tampered("graph contains a cycle".into()));
        }
        Ok(order)
    }

    /// Canonical byte encoding of the whole graph.
    pub fn serialize(&self) -> Result<Vec<u8>, GraphError> {
        Ok(cbor::encode(self)?)
    }

    /// Decode and fully validate a serialized graph.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, GraphError> {
        let graph: Graph = cbor::decode(bytes)?;
        graph.validate()?;
        Ok(graph)
    }
}

/// Collect the signing keys a link introduces, bound to the (user, device)
/// pair that owns them.
fn record_introduced_keys(
    signed: &SignedLink,
    device_keys: &mut HashMap<(String, String), Vec<VerifyingKey>>,
) {
    let mut record = |user_id: &str, device_id: &str, key: VerifyingKey| {
        let keys = device_keys
            .entry((user_id.to_string(), device_id.to_string()))
            .or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    match &signed.body.action {
        Action::Root { founder, .. } => {
            for device in founder.devices.values() {
                record(&founder.user_id, &device.device_id, device.keys.signing);
            }
        }
        Action::AddMember { member, .. } | Action::Admit { member, .. } => {
            for device in member.devices.values() {
                record(&member.user_id, &device.device_id, device.keys.signing);
            }
        }
        Action::AddDevice { device, .. } => {
            record(&device.user_id, &device.device_id, device.keys.signing);
        }
        Action::ChangeDeviceKeys { keys, .. } => {
            // Own-scope rule: a device key rotation always names the
            // author's device.
            record(
                &signed.body.author.user_id,
                &keys.scope.name,
                keys.signing,
            );
        }
        _ => {}
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    /// A link signature does not verify under its author's device key.
    #[error("signature on link {0} is invalid")]
    InvalidSignature(Hash),

    /// A link references a parent that is not in the graph.
    #[error("link {0} references unknown parent {1}")]
    DanglingParent(Hash, Hash),

    /// More than one root link was found.
    #[error("graph has more than one root")]
    MultipleRoots,

    /// Structural integrity failure: recorded hashes, reachability or shape.
    #[error("graph has been tampered with: {0}")]
    Tampered(String),

    /// A link was signed by a device the graph never introduced.
    #[error("link {0} was signed by unknown device \"{1}\"")]
    UnknownAuthor(Hash, String),

    /// Graphs of different teams cannot be merged.
    #[error("cannot merge graphs with different roots")]
    DifferentRoot,

    #[error("unknown link {0}")]
    UnknownLink(Hash),

    #[error(transparent)]
    Encode(#[from] cohort_core::cbor::EncodeError),

    #[error(transparent)]
    Decode(#[from] cohort_core::cbor::DecodeError),
}

#[cfg(test)]
mod tests {
    use crate::action::Action;
    use crate::test_utils::{TestTeam, alice, bob, device_keys_for};

    use super::{Graph, GraphError, Link};

    #[test]
    fn create_append_validate() {
        let mut team = TestTeam::new();
        team.add_member(&alice(), "bob", false, 10);
        team.add_role(&alice(), "managers", 20);

        assert_eq!(team.graph.len(), 3);
        assert!(team.graph.validate().is_ok());
    }

    #[test]
    fn serialize_round_trip() {
        let mut team = TestTeam::new();
        team.add_member(&alice(), "bob", false, 10);

        let bytes = team.graph.serialize().unwrap();
        let loaded = Graph::deserialize(&bytes).unwrap();

        assert_eq!(loaded.root(), team.graph.root());
        assert_eq!(loaded.head(), team.graph.head());
        assert_eq!(loaded.len(), team.graph.len());
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn tampered_body_detected() {
        let mut team = TestTeam::new();
        team.add_member(&alice(), "bob", false, 10);

        let bytes = team.graph.serialize().unwrap();

        // Rewrite the team name inside the serialized blob.
        let mut tampered = bytes.clone();
        let needle = b"spies";
        let position = tampered
            .windows(needle.len())
            .position(|window| window == needle)
            .expect("team name appears in blob");
        tampered[position..position + needle.len()].copy_from_slice(b"moles");

        assert!(Graph::deserialize(&tampered).is_err());
    }

    #[test]
    fn forged_signature_detected() {
        let mut team = TestTeam::new();
        let hash = team.add_member(&alice(), "bob", false, 10);

        // Re-sign alice's link with bob's key.
        let Some(Link::Signed(link)) = team.graph.get(&hash) else {
            panic!("expected signed link");
        };
        let mut forged = link.clone();
        forged.signature = device_keys_for("bob").signing.sign(hash.as_bytes());

        let mut graph = team.graph.clone();
        graph.links.insert(hash, Link::Signed(forged));

        assert!(matches!(
            graph.validate(),
            Err(GraphError::InvalidSignature(_))
        ));
    }

    #[test]
    fn unknown_author_rejected() {
        let mut team = TestTeam::new();
        // mallory was never introduced to the graph.
        team.graph
            .append(
                Action::SetTeamName {
                    team_name: "moles".to_string(),
                },
                crate::test_utils::author("mallory"),
                10,
                &device_keys_for("mallory").signing,
            )
            .unwrap();

        assert!(matches!(
            team.graph.validate(),
            Err(GraphError::UnknownAuthor(..))
        ));
    }

    #[test]
    fn colliding_device_id_cannot_impersonate() {
        let mut team = TestTeam::new();
        team.add_member(&alice(), "mallory", false, 10);

        // mallory registers a device of her own under alice's device id.
        let shadow = crate::keyset::KeysetWithSecrets::from_seed(
            crate::keyset::Scope::device("alice-laptop"),
            b"mallory shadow key",
        );
        team.append(
            &crate::test_utils::author("mallory"),
            Action::AddDevice {
                device: crate::state::Device {
                    device_id: "alice-laptop".to_string(),
                    user_id: "mallory".to_string(),
                    keys: shadow.public(),
                },
                lockboxes: vec![],
            },
            20,
        );

        // A link claiming alice as its author, signed with the shadow key,
        // must not verify: keys are bound to (user, device), not bare ids.
        team.graph
            .append(
                Action::SetTeamName {
                    team_name: "moles".to_string(),
                },
                alice(),
                30,
                &shadow.signing,
            )
            .unwrap();

        assert!(matches!(
            team.graph.validate(),
            Err(GraphError::InvalidSignature(_))
        ));
    }

    #[test]
    fn second_root_rejected() {
        let mut team = TestTeam::new();
        let result = team.graph.append(
            Action::Root {
                team_name: "other".to_string(),
                founder: crate::test_utils::member_record("mallory", true),
                lockboxes: vec![],
            },
            alice(),
            10,
            &device_keys_for("alice").signing,
        );
        assert!(matches!(result, Err(GraphError::MultipleRoots)));
    }

    #[test]
    fn merge_with_foreign_root_rejected() {
        let ours = TestTeam::new();
        // A different founder makes a different root hash.
        let theirs = Graph::create(
            Action::Root {
                team_name: "spies".to_string(),
                founder: crate::test_utils::member_record("bob", true),
                lockboxes: vec![],
            },
            bob(),
            0,
            &device_keys_for("bob").signing,
        )
        .unwrap();

        let mut graph = ours.graph;
        assert!(matches!(
            graph.merge(&theirs),
            Err(GraphError::DifferentRoot)
        ));
    }

    #[test]
    fn fast_forward_merge_keeps_later_head() {
        let base = TestTeam::new();
        let mut ahead = TestTeam::with_graph(base.graph.clone());
        let head = ahead.add_role(&alice(), "managers", 10);

        // The peer that is behind adopts the later head without a merge link.
        let mut behind = base.graph.clone();
        behind.merge(&ahead.graph).unwrap();
        assert_eq!(behind.head(), head);
        assert_eq!(behind.len(), 2);

        // And the peer that is ahead keeps its own head.
        let mut ahead_graph = ahead.graph.clone();
        ahead_graph.merge(&base.graph).unwrap();
        assert_eq!(ahead_graph.head(), head);
    }
}
