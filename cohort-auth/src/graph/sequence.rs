// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic linearization of the membership graph.
//!
//! Linear chains linearize trivially. At every merge link the two concurrent
//! branches are cut back to their common ancestor and handed to the supplied
//! resolver, which decides which links survive and in what order. The result
//! depends only on the graph's contents, never on how or where it was built.
use std::collections::{HashMap, HashSet};

use cohort_core::Hash;
use petgraph::visit::{Dfs, Reversed};

use crate::resolver::{MergeContext, Resolver};

use super::{Graph, GraphError};

impl Graph {
    /// Linearize the whole graph into a sequence of link hashes, root first.
    pub fn sequence<R: Resolver>(&self, resolver: &R) -> Result<Vec<Hash>, GraphError> {
        let mut memo = HashMap::new();
        self.linearize(self.head(), resolver, &mut memo)
    }

    /// Sequence of the sub-graph ending at `node`, memoized per node.
    fn linearize<R: Resolver>(
        &self,
        node: Hash,
        resolver: &R,
        memo: &mut HashMap<Hash, Vec<Hash>>,
    ) -> Result<Vec<Hash>, GraphError> {
        if let Some(seq) = memo.get(&node) {
            return Ok(seq.clone());
        }

        // Walk back through the single-parent run ending at `node`,
        // collecting links until we hit the root, a merge link or an already
        // linearized node. Keeps recursion depth bounded by merge nesting
        // rather than chain length.
        let mut run: Vec<Hash> = Vec::new();
        let mut cur = node;
        let base: Option<Vec<Hash>> = loop {
            if let Some(seq) = memo.get(&cur) {
                break Some(seq.clone());
            }
            let link = self.link(&cur)?;
            match link.prev() {
                [] => {
                    run.push(cur);
                    break None;
                }
                [parent] => {
                    run.push(cur);
                    cur = *parent;
                }
                [a, b] => {
                    let seq = self.resolve_merge(cur, *a, *b, resolver, memo)?;
                    memo.insert(cur, seq.clone());
                    break Some(seq);
                }
                _ => {
                    return Err(GraphError::Tampered(format!(
                        "link {} has more than two parents",
                        cur.fmt_short()
                    )));
                }
            }
        };

        let mut seq = base.unwrap_or_default();
        seq.extend(run.iter().rev());
        memo.insert(node, seq.clone());
        Ok(seq)
    }

    /// Linearize a merge link: common ancestor prefix, then the resolver's
    /// reconciliation of the two branches, then the merge link itself.
    fn resolve_merge<R: Resolver>(
        &self,
        merge: Hash,
        a: Hash,
        b: Hash,
        resolver: &R,
        memo: &mut HashMap<Hash, Vec<Hash>>,
    ) -> Result<Vec<Hash>, GraphError> {
        let ancestor = self.common_ancestor(a, b)?;
        let prefix = self.linearize(ancestor, resolver, memo)?;
        let seq_a = self.linearize(a, resolver, memo)?;
        let seq_b = self.linearize(b, resolver, memo)?;

        let prefix_set: HashSet<Hash> = prefix.iter().copied().collect();
        let branch_a: Vec<Hash> = seq_a
            .into_iter()
            .filter(|hash| !prefix_set.contains(hash))
            .collect();
        let branch_b: Vec<Hash> = seq_b
            .into_iter()
            .filter(|hash| !prefix_set.contains(hash))
            .collect();

        let context = MergeContext::new(self, &prefix);
        let merged = resolver.resolve(&context, branch_a, branch_b);

        let mut seq = prefix;
        seq.extend(merged);
        seq.push(merge);
        Ok(seq)
    }

    /// The most recent link both branches descend from.
    ///
    /// Among all common ancestors the one with the largest own ancestry is
    /// the latest; ties (which well-formed graphs do not produce) break by
    /// hash so the choice stays deterministic.
    pub fn common_ancestor(&self, a: Hash, b: Hash) -> Result<Hash, GraphError> {
        let dependency_graph = self.dependency_graph();
        let reversed = Reversed(&dependency_graph);

        let mut ancestors_a = HashSet::new();
        let mut dfs = Dfs::new(&reversed, a);
        while let Some(hash) = dfs.next(&reversed) {
            ancestors_a.insert(hash);
        }

        let mut common = Vec::new();
        let mut dfs = Dfs::new(&reversed, b);
        while let Some(hash) = dfs.next(&reversed) {
            if ancestors_a.contains(&hash) {
                common.push(hash);
            }
        }

        common
            .into_iter()
            .max_by_key(|hash| {
                let depth = self.ancestors(*hash).map(|set| set.len()).unwrap_or(0);
                (depth, *hash)
            })
            .ok_or_else(|| GraphError::Tampered("branches share no common ancestor".into()))
    }
}

#[cfg(test)]
mod tests {
    use crate::resolver::Concat;
    use crate::test_utils::{TestTeam, alice, bob};

    #[test]
    fn linear_chain_sequences_in_order() {
        let mut team = TestTeam::new();
        let h0 = team.graph.root();
        let h1 = team.add_role(&alice(), "managers", 10);
        let h2 = team.add_role(&alice(), "writers", 20);

        let seq = team.graph.sequence(&Concat).unwrap();
        assert_eq!(seq, vec![h0, h1, h2]);
    }

    #[test]
    fn concurrent_branches_both_retained() {
        let mut team = TestTeam::new();
        let root = team.graph.root();

        let mut theirs = team.graph.clone();
        let ours = team.add_role(&alice(), "managers", 10);
        let theirs_head = {
            let mut other = TestTeam::with_graph(theirs.clone());
            let hash = other.add_role(&bob(), "writers", 20);
            theirs = other.graph;
            hash
        };

        team.graph.merge(&theirs).unwrap();
        let head = team.graph.head();

        let seq = team.graph.sequence(&Concat).unwrap();
        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0], root);
        assert_eq!(seq[3], head);
        assert!(seq.contains(&ours));
        assert!(seq.contains(&theirs_head));
    }

    #[test]
    fn merge_is_commutative() {
        let mut team = TestTeam::new();

        let mut left = team.graph.clone();
        team.add_role(&alice(), "managers", 10);
        {
            let mut other = TestTeam::with_graph(left);
            other.add_role(&bob(), "writers", 20);
            left = other.graph;
        }

        let mut ab = team.graph.clone();
        ab.merge(&left).unwrap();

        let mut ba = left.clone();
        ba.merge(&team.graph).unwrap();

        assert_eq!(ab.head(), ba.head());
        assert_eq!(
            ab.sequence(&Concat).unwrap(),
            ba.sequence(&Concat).unwrap()
        );
    }

    #[test]
    fn common_ancestor_of_branches() {
        let mut team = TestTeam::new();
        let root = team.graph.root();

        let mut theirs = team.graph.clone();
        let ours = team.add_role(&alice(), "managers", 10);
        let theirs_head = {
            let mut other = TestTeam::with_graph(theirs);
            let hash = other.add_role(&bob(), "writers", 20);
            theirs = other.graph;
            hash
        };
        team.graph.merge(&theirs).unwrap();

        let ancestor = team.graph.common_ancestor(ours, theirs_head).unwrap();
        assert_eq!(ancestor, root);
    }
}
