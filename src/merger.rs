//! Strict consensus merger (SCM) of overlapping source trees.
//!
//! # Overview
//! Trees are merged two at a time, always the pair sharing the most taxa,
//! until one tree is left. That tree is the skeleton supertree: it displays
//! only what both inputs of every merge agree on, so disagreements show up as
//! polytomies.
//!
//! # Pairwise merge
//! 1. Restrict both trees to the shared taxa `X` and take the strict
//!    consensus: the clusters present in both restrictions.
//! 2. Every subtree holding only private taxa hangs from some point of its
//!    tree's restriction: a node, or the inside of an edge. Re-attach it at
//!    the same point of the consensus.
//! 3. If both trees hang private subtrees inside the same consensus edge,
//!    their relative order is unknown: they all go below one new node.
//!
//! ```text
//! T1 = (((A,B),X),(C,D),E)       T2 = (((A,B),Y),(C,D),E)
//!
//! shared {A,B,C,D,E}: both restrict to ((A,B),(C,D),E)
//! X and Y both sit on the edge {A,B} | {C,D,E}: collision
//!
//! merged: ((A,B),(X,Y,((C,D),E)))      (as an unrooted tree)
//! ```
//!
//! # Clusters
//! Both trees are viewed as rooted at the smallest shared taxon `r`, so a
//! cluster is the set of shared taxa below a node, as a [`Bitset`] over the
//! shared taxon index. Two rooted hierarchies share a hierarchy of clusters,
//! which makes the consensus easy to build bottom-up.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info, warn};

use crate::bitset::Bitset;
use crate::collapse::MIN_INFORMATIVE_LABELS;
use crate::error::{Result, SuperfineError};
use crate::splits::TaxonIndex;
use crate::tree::{NodeId, TaxonId, Tree};

/// Merge all `trees` into one supertree.
///
/// Trees with fewer than 4 distinct taxa are dropped first.
///
/// # Errors
/// - [`SuperfineError::NoTrees`] when no informative tree is left
/// - [`SuperfineError::InsufficientOverlap`] when no remaining pair shares 4
///   or more taxa
pub fn strict_consensus_merge(trees: Vec<Tree<TaxonId>>) -> Result<Tree<TaxonId>> {
    let total = trees.len();
    let mut trees = remove_uninformative(trees);
    if trees.len() < total {
        warn!(
            "dropped {} source trees with fewer than {} taxa",
            total - trees.len(),
            MIN_INFORMATIVE_LABELS
        );
    }
    if trees.is_empty() {
        return Err(SuperfineError::NoTrees);
    }

    while trees.len() > 1 {
        let (i, j, overlap) = next_pair(&trees).ok_or(SuperfineError::InsufficientOverlap(trees.len()))?;
        debug!("merging trees {} and {} ({} shared taxa)", i, j, overlap);
        // j > i, so removing j first keeps i valid
        let second = trees.remove(j);
        let first = trees.remove(i);
        trees.push(merge_pair(&first, &second)?);
    }
    let merged = trees.pop().ok_or(SuperfineError::NoTrees)?;
    info!("strict consensus merge of {} trees: {} taxa", total, merged.taxa().len());
    Ok(merged)
}

/// Trees with at least 4 distinct taxa.
pub fn remove_uninformative(trees: Vec<Tree<TaxonId>>) -> Vec<Tree<TaxonId>> {
    trees
        .into_iter()
        .filter(|t| t.taxa().len() >= MIN_INFORMATIVE_LABELS)
        .collect()
}

/// The pair `(i, j, overlap)`, `i < j`, with the largest taxon overlap,
/// provided it is at least 4. The first pair found wins ties.
pub fn next_pair(trees: &[Tree<TaxonId>]) -> Option<(usize, usize, usize)> {
    let taxa: Vec<BTreeSet<TaxonId>> = trees.iter().map(|t| t.taxa()).collect();
    let mut best: Option<(usize, usize, usize)> = None;
    for i in 0..taxa.len() {
        for j in i + 1..taxa.len() {
            let overlap = taxa[i].intersection(&taxa[j]).count();
            let current = best.map_or(MIN_INFORMATIVE_LABELS - 1, |(_, _, o)| o);
            if overlap > current {
                best = Some((i, j, overlap));
            }
        }
    }
    best
}

/// A tree seen as rooted at one of its leaves.
struct View<'a> {
    tree: &'a Tree<TaxonId>,
    anchor: NodeId,
    /// Nodes reachable from the anchor, parents first
    order: Vec<NodeId>,
    children: HashMap<NodeId, Vec<NodeId>>,
    /// Shared taxa below each node
    cluster: HashMap<NodeId, Bitset>,
    /// Number of labeled leaves below each node
    size: HashMap<NodeId, usize>,
}

impl<'a> View<'a> {
    fn new(tree: &'a Tree<TaxonId>, index: &TaxonIndex<TaxonId>, anchor_taxon: &TaxonId) -> Option<Self> {
        let anchor = tree.find_leaf(anchor_taxon)?;
        let mut order = Vec::new();
        let mut children = HashMap::new();
        let mut stack = vec![(anchor, None)];
        while let Some((id, from)) = stack.pop() {
            order.push(id);
            let kids: Vec<NodeId> = tree
                .parent(id)
                .into_iter()
                .chain(tree.children(id))
                .filter(|&n| Some(n) != from)
                .collect();
            for &kid in kids.iter().rev() {
                stack.push((kid, Some(id)));
            }
            children.insert(id, kids);
        }

        let mut cluster: HashMap<NodeId, Bitset> = HashMap::new();
        let mut size: HashMap<NodeId, usize> = HashMap::new();
        for &id in order.iter().rev() {
            let kids = &children[&id];
            if kids.is_empty() {
                let label = tree.label(id);
                cluster.insert(id, index.bitset_of(label));
                size.insert(id, usize::from(label.is_some()));
            } else {
                let mut bits = Bitset::zeros(index.words());
                let mut count = 0;
                for kid in kids {
                    bits.or_assign(&cluster[kid]);
                    count += size[kid];
                }
                cluster.insert(id, bits);
                size.insert(id, count);
            }
        }
        Some(View {
            tree,
            anchor,
            order,
            children,
            cluster,
            size,
        })
    }

    /// Non-empty clusters of every node but the anchor.
    fn clusters(&self) -> HashSet<Bitset> {
        self.order
            .iter()
            .filter(|&&id| id != self.anchor)
            .map(|id| self.cluster[id].clone())
            .filter(|bits| !bits.is_empty())
            .collect()
    }

    /// Copy the view subtree below `id` into `out`, suppressing nodes left
    /// with a single child.
    fn copy_into(&self, id: NodeId, out: &mut Tree<TaxonId>) -> Option<NodeId> {
        let mut copied: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            let kids = &self.children[&current];
            if kids.is_empty() {
                copied.insert(current, self.tree.label(current).map(|label| out.add_leaf(label.clone())));
            } else if !expanded {
                stack.push((current, true));
                stack.extend(kids.iter().rev().map(|&kid| (kid, false)));
            } else {
                let mut copies: Vec<NodeId> = kids.iter().filter_map(|kid| copied.remove(kid).flatten()).collect();
                let copy = match copies.len() {
                    0 => None,
                    1 => copies.pop(),
                    _ => {
                        let node = out.add_internal();
                        for copy in copies {
                            out.attach(node, copy);
                        }
                        Some(node)
                    }
                };
                copied.insert(current, copy);
            }
        }
        copied.remove(&id).flatten()
    }
}

/// Private subtrees of one tree hanging inside a consensus edge, all from
/// one node of that tree.
struct EdgeGroup {
    tree: usize,
    size: usize,
    pendants: Vec<NodeId>,
}

/// Strict consensus merge of two trees sharing at least 4 taxa.
pub fn merge_pair(first: &Tree<TaxonId>, second: &Tree<TaxonId>) -> Result<Tree<TaxonId>> {
    let shared: Vec<TaxonId> = first.taxa().intersection(&second.taxa()).cloned().collect();
    if shared.len() < MIN_INFORMATIVE_LABELS {
        return Err(SuperfineError::InsufficientOverlap(2));
    }
    let index = TaxonIndex::new(shared);
    let anchor_taxon = index.label(0).clone();
    let views = [
        View::new(first, &index, &anchor_taxon).ok_or(SuperfineError::LeafSetMismatch)?,
        View::new(second, &index, &anchor_taxon).ok_or(SuperfineError::LeafSetMismatch)?,
    ];

    // consensus clusters, smallest first
    let first_clusters = views[0].clusters();
    let mut consensus: Vec<Bitset> = first_clusters.intersection(&views[1].clusters()).cloned().collect();
    consensus.sort_by_key(|bits| (bits.count_ones(), bits.clone()));
    let position: HashMap<&Bitset, usize> = consensus.iter().enumerate().map(|(i, b)| (b, i)).collect();
    let smallest_superset = |bits: &Bitset| consensus.iter().position(|c| bits.is_subset(c));
    let top = consensus.len() - 1;

    // where each tree's private subtrees go
    let mut at_node: Vec<Vec<(usize, NodeId)>> = vec![Vec::new(); consensus.len()];
    let mut on_edge: Vec<Vec<EdgeGroup>> = (0..consensus.len()).map(|_| Vec::new()).collect();
    for (t, view) in views.iter().enumerate() {
        for &id in &view.order {
            let cluster = &view.cluster[&id];
            if id == view.anchor || cluster.is_empty() {
                continue;
            }
            let kids = &view.children[&id];
            let pendants: Vec<NodeId> = kids
                .iter()
                .copied()
                .filter(|kid| view.cluster[kid].is_empty() && view.size[kid] > 0)
                .collect();
            if pendants.is_empty() {
                continue;
            }
            let shared_kids = kids.iter().filter(|kid| !view.cluster[*kid].is_empty()).count();
            match (shared_kids, position.get(cluster)) {
                (1, Some(&c)) => on_edge[c].push(EdgeGroup {
                    tree: t,
                    size: view.size[&id],
                    pendants,
                }),
                _ => {
                    let c = smallest_superset(cluster).unwrap_or(top);
                    at_node[c].extend(pendants.into_iter().map(|p| (t, p)));
                }
            }
        }
    }

    let mut out = Tree::new();
    let nodes: Vec<NodeId> = consensus
        .iter()
        .map(|bits| match (bits.count_ones(), bits.ones().next()) {
            (1, Some(i)) => out.add_leaf(index.label(i).clone()),
            _ => out.add_internal(),
        })
        .collect();

    for (c, bits) in consensus.iter().enumerate() {
        let groups = std::mem::take(&mut on_edge[c]);
        if c == top {
            // the edge towards the anchor: walk up from the top cluster
            let upper = hang_chain(&mut out, &views, nodes[c], groups, true);
            let anchor = out.add_leaf(anchor_taxon.clone());
            out.attach(upper, anchor);
        } else {
            let parent = consensus[c + 1..]
                .iter()
                .position(|p| bits.is_subset(p))
                .map_or(top, |offset| c + 1 + offset);
            let lower = hang_chain(&mut out, &views, nodes[parent], groups, false);
            out.attach(lower, nodes[c]);
        }
        for &(t, pendant) in &at_node[c] {
            if let Some(copy) = views[t].copy_into(pendant, &mut out) {
                out.attach(nodes[c], copy);
            }
        }
    }
    out.set_root(nodes[top]);
    Ok(out)
}

/// Hang the private subtrees of one consensus edge as a chain of new nodes
/// starting at `start`, and return the last node of the chain.
///
/// Going down an edge (`upward == false`) the groups closest to `start` are
/// the largest; going up towards the anchor they are the smallest. Groups
/// coming from both trees share a single node.
fn hang_chain(out: &mut Tree<TaxonId>, views: &[View; 2], start: NodeId, mut groups: Vec<EdgeGroup>, upward: bool) -> NodeId {
    if groups.is_empty() {
        return start;
    }
    let both = groups.iter().any(|g| g.tree == 0) && groups.iter().any(|g| g.tree == 1);
    let chain: Vec<Vec<(usize, NodeId)>> = if both {
        vec![groups
            .iter()
            .flat_map(|g| g.pendants.iter().map(move |&p| (g.tree, p)))
            .collect()]
    } else {
        if upward {
            groups.sort_by_key(|g| g.size);
        } else {
            groups.sort_by_key(|g| std::cmp::Reverse(g.size));
        }
        groups
            .iter()
            .map(|g| g.pendants.iter().map(|&p| (g.tree, p)).collect())
            .collect()
    };

    let mut current = start;
    for link in chain {
        let node = out.add_internal();
        out.attach(current, node);
        for (t, pendant) in link {
            if let Some(copy) = views[t].copy_into(pendant, out) {
                out.attach(node, copy);
            }
        }
        current = node;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::raw_fp_fn;
    use itertools::Itertools;

    fn parse(newick: &str) -> Tree<TaxonId> {
        Tree::from_newick(newick).unwrap()
    }

    fn splits(tree: &Tree<TaxonId>) -> Vec<String> {
        tree.bipartitions().iter().map(|b| b.to_string()).collect()
    }

    #[test]
    fn test_same_taxa_gives_strict_consensus() {
        let merged = merge_pair(&parse("((A,B),(C,D),E);"), &parse("((A,B),C,(D,E));")).unwrap();
        assert_eq!(splits(&merged), vec!["A,B|C,D,E"]);
        assert_eq!(merged.all_leaves().len(), 5);
    }

    #[test]
    fn test_rooting_is_irrelevant() {
        let a = parse("((A,B),(C,D),(E,F));");
        let b = parse("(((C,D),(E,F)),A,B);");
        let merged = merge_pair(&a, &b).unwrap();
        assert_eq!(splits(&merged), splits(&a));
    }

    #[test]
    fn test_private_subtrees_at_nodes() {
        let merged = merge_pair(&parse("((A,B),((C,D),E,X));"), &parse("((A,B),((C,D),E,(Y,Z)));")).unwrap();
        let taxa_set = merged.taxa();
        let taxa: Vec<&str> = taxa_set.iter().map(String::as_str).collect();
        assert_eq!(taxa, ["A", "B", "C", "D", "E", "X", "Y", "Z"]);
        assert_eq!(
            splits(&merged),
            vec!["A,B|C,D,E,X,Y,Z", "A,B,C,D,E,X|Y,Z", "A,B,E,X,Y,Z|C,D"]
        );
    }

    #[test]
    fn test_edge_collision_makes_polytomy() {
        let merged = merge_pair(&parse("(((A,B),X),(C,D),E);"), &parse("(((A,B),Y),(C,D),E);")).unwrap();
        assert_eq!(
            splits(&merged),
            vec!["A,B|C,D,E,X,Y", "A,B,E,X,Y|C,D", "A,B,X,Y|C,D,E"]
        );
        // X and Y hang from the same new node
        let x = merged.find_leaf(&"X".to_string()).unwrap();
        let y = merged.find_leaf(&"Y".to_string()).unwrap();
        assert_eq!(merged.parent(x), merged.parent(y));
    }

    #[test]
    fn test_chain_on_one_side_keeps_order() {
        // X then Y on the path from {A,B} to {C,D,E}, only in the first tree
        let merged = merge_pair(&parse("((((A,B),X),Y),(C,D),E);"), &parse("((A,B),(C,D),E);")).unwrap();
        assert_eq!(
            splits(&merged),
            vec!["A,B|C,D,E,X,Y", "A,B,E,X,Y|C,D", "A,B,X|C,D,E,Y", "A,B,X,Y|C,D,E"]
        );
    }

    #[test]
    fn test_private_taxon_next_to_anchor() {
        // X sits on the pendant edge of A, the anchor taxon
        let merged = merge_pair(&parse("((A,X),B,(C,D));"), &parse("(A,B,(C,D));")).unwrap();
        assert_eq!(splits(&merged), vec!["A,B,X|C,D", "A,X|B,C,D"]);
    }

    #[test]
    fn test_merge_agrees_with_sources() {
        let sources = vec![
            parse("((A,B),(C,D),(E,F));"),
            parse("((A,B),(C,D),(E,G));"),
            parse("((A,B),(E,G),(F,H));"),
        ];
        let merged = strict_consensus_merge(sources.clone()).unwrap();
        assert_eq!(merged.taxa().len(), 8);
        for source in &sources {
            let taxa: HashSet<TaxonId> = source.taxa().into_iter().collect();
            let restricted = merged.restrict(&taxa);
            // the merged tree never contradicts a source
            assert_eq!(raw_fp_fn(source, &restricted, false).unwrap().false_positives, 0);
        }
        for (x, y) in merged.bipartitions().iter().tuple_combinations() {
            assert!(x.is_compatible(y));
        }
    }

    #[test]
    fn test_deep_private_clade() {
        // a caterpillar of private taxa several thousand levels deep
        let depth = 2000;
        let mut deep = parse("((A,B),(C,D),E);");
        let mut top = deep.add_leaf("P0".to_string());
        for i in 1..=depth {
            let node = deep.add_internal();
            let leaf = deep.add_leaf(format!("P{i}"));
            deep.attach(node, top);
            deep.attach(node, leaf);
            top = node;
        }
        let root = deep.root().unwrap();
        deep.attach(root, top);

        let merged = merge_pair(&deep, &parse("((A,B),(C,D),E);")).unwrap();
        let newick = merged.to_newick();
        assert_eq!(newick.matches(',').count() + 1, 5 + depth + 1);
        assert!(newick.contains(&format!("P{depth})")));
    }

    #[test]
    fn test_pair_selection() {
        let trees = vec![
            parse("((A,B),(C,D),E);"),
            parse("((A,B),(C,X),Y);"),
            parse("((A,B),(C,D),F);"),
        ];
        assert_eq!(next_pair(&trees), Some((0, 2, 4)));
    }

    #[test]
    fn test_errors() {
        let disjoint = vec![parse("((A,B),(C,D));"), parse("((E,F),(G,H));")];
        assert!(matches!(
            strict_consensus_merge(disjoint),
            Err(SuperfineError::InsufficientOverlap(2))
        ));

        let tiny = vec![parse("(A,B,C);"), parse("(A,B);")];
        assert!(matches!(strict_consensus_merge(tiny), Err(SuperfineError::NoTrees)));

        let single = vec![parse("(A,B,C);"), parse("((A,B),(C,D));")];
        let merged = strict_consensus_merge(single).unwrap();
        assert_eq!(merged.to_newick(), "((A,B),(C,D));");
    }
}
