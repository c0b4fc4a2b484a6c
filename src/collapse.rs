//! Minimization of relabeled source trees.
//!
//! # Overview
//! After relabeling, a source tree typically has long runs of leaves that
//! carry the same group. Only the relations *between* groups matter to the
//! resolver, so those runs are collapsed:
//!
//! ```text
//!   (((0,0),(0,0)),((1,2),3),4,4)
//!        │ sibling merge
//!        ▼
//!   (0,((1,2),3),4,4)
//!        │ overgrowth correction: singletons {0,1,2,3}
//!        ▼                        no subtree has exactly that leaf set,
//!   (0,((1,2),3),4,4)             the tree is kept as is
//! ```
//!
//! # Overgrowth
//! Sibling merging works on the rooted view of an unrooted tree. When the
//! root falls inside a group, that group stays split in several leaves. If a
//! subtree holds exactly the groups that occur once, re-rooting at it and
//! hanging one leaf per repeated group below the new root gives the minimal
//! tree. Otherwise the merged tree is returned untouched.

use std::collections::BTreeSet;

use log::debug;

use crate::tree::{label_frequencies, Label, NodeId, Tree};

/// Minimum number of distinct labels a tree needs to display any quartet.
pub const MIN_INFORMATIVE_LABELS: usize = 4;

/// Collapse a relabeled tree. Returns the empty tree when fewer than
/// [`MIN_INFORMATIVE_LABELS`] distinct labels remain.
pub fn collapse<L: Label>(tree: &Tree<L>) -> Tree<L> {
    let Some(root) = tree.root() else {
        return Tree::new();
    };
    let mut work = tree.clone();
    merge_siblings(&mut work, root);

    let frequencies = label_frequencies(work.all_leaves());
    if frequencies.len() < MIN_INFORMATIVE_LABELS {
        return Tree::new();
    }

    let (singletons, duplicates): (Vec<_>, Vec<_>) =
        frequencies.into_iter().partition(|&(_, count)| count == 1);
    if duplicates.is_empty() {
        return compact(&work);
    }

    let singletons: BTreeSet<L> = singletons.into_iter().map(|(label, _)| label).collect();
    match find_exact_subtree(&work, &singletons) {
        Some(new_root) => {
            work.set_root(new_root);
            for (label, _) in duplicates {
                let leaf = work.add_leaf(label);
                work.attach(new_root, leaf);
            }
        }
        None => debug!(
            "no subtree matches the {} singleton labels; keeping the tree uncorrected",
            singletons.len()
        ),
    }
    compact(&work)
}

/// Replace every non-root subtree whose leaves all share one label by a
/// single leaf carrying it. The edge above the subtree is kept.
fn merge_siblings<L: Label>(tree: &mut Tree<L>, root: NodeId) {
    let mut stack: Vec<NodeId> = tree.children(root).collect();
    while let Some(id) = stack.pop() {
        if tree.is_leaf(id) {
            continue;
        }
        let labels = tree.leaf_set(id);
        if labels.len() == 1 {
            if let Some(label) = labels.into_iter().next() {
                tree.replace_with_leaf(id, label);
            }
        } else {
            stack.extend(tree.children(id));
        }
    }
}

/// Topmost internal node whose distinct leaf labels equal `labels`.
fn find_exact_subtree<L: Label>(tree: &Tree<L>, labels: &BTreeSet<L>) -> Option<NodeId> {
    let root = tree.root()?;
    tree.preorder(root)
        .into_iter()
        .filter(|&id| id != root && !tree.is_leaf(id))
        .find(|&id| tree.leaves(id).len() == labels.len() && &tree.leaf_set(id) == labels)
}

/// Copy of the reachable part of the arena.
fn compact<L: Label>(tree: &Tree<L>) -> Tree<L> {
    let taxa = tree.taxa().into_iter().collect();
    tree.restrict(&taxa)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tree::test_util::groups;

    #[test]
    fn test_sibling_merge() {
        let tree = groups("(((a0,b0),(c0,d0)),((1,2),3),(a4,b4),5);");
        let collapsed = collapse(&tree);
        assert_eq!(collapsed.to_newick(), "(0,((1,2),3),4,5);");
    }

    #[test]
    fn test_distinct_labels_is_noop() {
        let tree = groups("((0,1),(2,3),(4,5));");
        assert_eq!(collapse(&tree).to_newick(), tree.to_newick());
    }

    #[test]
    fn test_three_labels_is_uninformative() {
        let tree = groups("((a0,b0),(a1,a2),(b1,b2));");
        assert!(collapse(&tree).is_empty());
        assert!(collapse(&Tree::<usize>::new()).is_empty());
    }

    #[test]
    fn test_overgrowth_corrected() {
        // the root splits group 5 in two leaves
        let tree = groups("(a5,(((0,1),(2,3)),4),b5);");
        let collapsed = collapse(&tree);
        assert_eq!(collapsed.to_newick(), "(((0,1),(2,3)),4,5);");
        assert_eq!(collapsed.all_leaves().len(), 6);
    }

    #[test]
    fn test_overgrowth_fallback_keeps_tree() {
        let tree = groups("((a4,(0,1)),(2,(3,b4)));");
        let collapsed = collapse(&tree);
        assert_eq!(collapsed.to_newick(), "((4,(0,1)),(2,(3,4)));");
    }

    #[test]
    fn test_edge_data_kept_on_merge() {
        let tree = groups("((a0,b0)0.8:0.5,1,2,3);");
        assert_eq!(collapse(&tree).to_newick(), "(0:0.5,1,2,3);");
    }
}
