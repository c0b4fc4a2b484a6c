//! Mapping a reconciler answer back to the supertree, and splicing it in.
//!
//! # Overview
//! The answer is a tree over the groups `0..=d` of one polytomy. Each of its
//! internal edges is a bipartition of the groups. The side holding the largest
//! label (the outside group when present) stands for "the rest of the
//! supertree" and is dropped; the other side names the branches to gather.
//!
//! ```text
//! polytomy P, branches A B C D E         answer ((0,1),2,(3,5),4)
//! (groups 0..4, outside group 5)
//!                                         {0,1}     | {2,3,4,5}  keep {0,1}
//!        P                 P              {0,1,2,4} | {3,5}      keep {0,1,2,4}
//!    / / | \ \    ==>    /   \
//!   A B  C  D E         D   (C,E,(A,B))
//! ```
//!
//! Bipartitions of one answer never cross, so applying them smallest first
//! only ever moves whole branches (or groups made earlier) one level down.

use std::collections::HashSet;

use log::debug;

use crate::error::{Result, SuperfineError};
use crate::polytomy::{Group, Relabeling};
use crate::tree::{Label, NodeId, TaxonId, Tree};

/// Branch roots to gather for each internal edge of `answer`.
///
/// # Errors
/// [`SuperfineError::UnknownGroup`] when the answer uses a label that is not
/// a group of the polytomy nor its outside group.
pub fn implied_bipartitions(answer: &Tree<Group>, relabeling: &Relabeling) -> Result<Vec<Vec<NodeId>>> {
    let taxa = answer.taxa();
    if let Some(&unknown) = taxa.iter().find(|&&g| g > relabeling.outside()) {
        return Err(SuperfineError::UnknownGroup(unknown));
    }
    let Some(&max) = taxa.iter().next_back() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for bp in answer.bipartitions() {
        let (a, b) = bp.sides();
        let kept = if a.contains(&max) { b } else { a };
        let subtrees = kept
            .iter()
            .map(|&g| relabeling.subtree(g).ok_or(SuperfineError::UnknownGroup(g)))
            .collect::<Result<Vec<_>>>()?;
        out.push(subtrees);
    }
    Ok(out)
}

/// Insert `bipartitions` below `polytomy`, smallest first. Returns how many
/// new internal nodes were created.
///
/// For each bipartition, the polytomy's current children whose leaves all
/// fall in the union of the listed subtrees move under one new node. A
/// grouping that would select fewer than two children, or all of them, adds
/// nothing and is skipped.
pub fn expand<L: Label>(tree: &mut Tree<L>, polytomy: NodeId, mut bipartitions: Vec<Vec<NodeId>>) -> usize {
    bipartitions.sort_by_key(Vec::len);
    let mut added = 0;

    for subtrees in bipartitions {
        let union: HashSet<L> = subtrees
            .iter()
            .flat_map(|&id| tree.leaves(id).iter().cloned())
            .collect();

        let selected: Vec<NodeId> = tree
            .children(polytomy)
            .filter(|&child| tree.leaves(child).iter().all(|l| union.contains(l)))
            .collect();
        let current = tree.edges(polytomy).len();
        if selected.len() < 2 || selected.len() == current {
            debug!(
                "skipping grouping of {} subtrees: selects {} of {} edges",
                subtrees.len(),
                selected.len(),
                current
            );
            continue;
        }

        let joint = tree.add_internal();
        for child in selected {
            if let Some(edge) = tree.detach(polytomy, child) {
                tree.attach_edge(joint, edge);
            }
        }
        tree.attach(polytomy, joint);
        added += 1;
    }
    added
}

/// Apply a group tree answer to one polytomy of `tree`.
pub fn apply_answer(tree: &mut Tree<TaxonId>, relabeling: &Relabeling, answer: &Tree<Group>) -> Result<usize> {
    let bipartitions = implied_bipartitions(answer, relabeling)?;
    Ok(expand(tree, relabeling.polytomy(), bipartitions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polytomy::find_polytomies;
    use crate::tree::test_util::groups;

    fn parse(newick: &str) -> Tree<TaxonId> {
        Tree::from_newick(newick).unwrap()
    }

    fn leaf_names(tree: &Tree<TaxonId>, ids: &[NodeId]) -> Vec<String> {
        ids.iter().flat_map(|&id| tree.leaves(id).to_vec()).collect()
    }

    #[test]
    fn test_outside_side_dropped() {
        let tree = parse("(A,B,C,D);");
        let root = tree.root().unwrap();
        let relabeling = Relabeling::build(&tree, root);
        assert_eq!(relabeling.outside(), 4);

        let bps = implied_bipartitions(&groups("((0,1),(2,3));"), &relabeling).unwrap();
        assert_eq!(bps.len(), 1);
        assert_eq!(leaf_names(&tree, &bps[0]), ["A", "B"]);
    }

    #[test]
    fn test_unknown_group() {
        let tree = parse("(A,B,C,D);");
        let relabeling = Relabeling::build(&tree, tree.root().unwrap());
        let err = implied_bipartitions(&groups("((0,1),(2,7));"), &relabeling).unwrap_err();
        assert!(matches!(err, SuperfineError::UnknownGroup(7)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_non_root_polytomy() {
        let mut tree = parse("((A,B,C,D,E),F,G);");
        let poly = find_polytomies(&tree).next().unwrap();
        let relabeling = Relabeling::build(&tree, poly);

        // group 5 is everything above the polytomy
        let answer = groups("((0,1),2,(3,5),4);");
        let bps = implied_bipartitions(&answer, &relabeling).unwrap();
        let mut names: Vec<Vec<String>> = bps.iter().map(|b| leaf_names(&tree, b)).collect();
        names.sort();
        assert_eq!(names, vec![vec!["A", "B"], vec!["A", "B", "C", "E"]]);

        let added = apply_answer(&mut tree, &relabeling, &answer).unwrap();
        assert_eq!(added, 2);
        assert_eq!(tree.to_newick(), "((D,(C,E,(A,B))),F,G);");
        // the answer itself leaves {A,B},C,E and the rest unresolved
        assert_eq!(find_polytomies(&tree).count(), 1);
    }

    #[test]
    fn test_nested_expansion_smallest_first() {
        let mut tree = parse("(A,B,C,D,E,F);");
        let root = tree.root().unwrap();
        let kids: Vec<NodeId> = tree.children(root).collect();
        let before = tree.taxa();

        // larger grouping listed first on purpose
        let added = expand(&mut tree, root, vec![vec![kids[0], kids[1], kids[2]], vec![kids[0], kids[1]]]);
        assert_eq!(added, 2);
        assert_eq!(tree.to_newick(), "(D,E,F,(C,(A,B)));");
        assert_eq!(tree.taxa(), before);
        assert_eq!(tree.all_leaves().len(), 6);
        assert_eq!(tree.degree(root), 4);
    }

    #[test]
    fn test_degenerate_groupings_skipped() {
        let mut tree = parse("(A,B,C,D);");
        let root = tree.root().unwrap();
        let kids: Vec<NodeId> = tree.children(root).collect();
        let added = expand(&mut tree, root, vec![vec![kids[0]], kids.clone()]);
        assert_eq!(added, 0);
        assert_eq!(tree.to_newick(), "(A,B,C,D);");
    }
}
