//! Polytomy discovery and the per-polytomy relabeling.
//!
//! # Overview
//! A polytomy is a node of degree > 3. To resolve it, the source trees are
//! rewritten over a tiny alphabet: each branch hanging below the polytomy
//! becomes one integer group, and everything else (the part of the tree
//! above the polytomy, or taxa not in the supertree) falls in the extra
//! "outside" group `d`.
//!
//! ```text
//!            parent           labels of the polytomy P:
//!              |
//!              P              taxa under (A,B) -> 0
//!         /  / | \            taxa under C     -> 1
//!      (A,B) C D  (E,F)       taxa under D     -> 2
//!                             taxa under (E,F) -> 3
//!                             anything else    -> 4 (outside)
//! ```
//!
//! The reverse map (group id → branch root) is what turns a resolver's
//! answer back into subtrees of the supertree.

use std::collections::HashMap;

use crate::tree::{Label, NodeId, TaxonId, Tree};

/// Integer label of one polytomy branch.
pub type Group = usize;

/// Every node of `tree` whose degree exceeds 3, in depth-first order.
///
/// The iterator borrows the tree, so it cannot outlive a mutation. Calling
/// the function again restarts the scan.
pub fn find_polytomies<L: Label>(tree: &Tree<L>) -> impl Iterator<Item = NodeId> + '_ {
    tree.root()
        .into_iter()
        .flat_map(move |root| tree.preorder(root))
        .filter(move |&id| !tree.is_leaf(id) && tree.degree(id) > 3)
}

/// Group ids for the branches of one polytomy, and their inverse.
#[derive(Debug, Clone)]
pub struct Relabeling {
    polytomy: NodeId,
    label_of: HashMap<TaxonId, Group>,
    group_of: Vec<NodeId>,
}

impl Relabeling {
    /// Assign group `i` to the `i`-th branch of `polytomy`, in edge order.
    pub fn build(tree: &Tree<TaxonId>, polytomy: NodeId) -> Self {
        let mut label_of = HashMap::new();
        let mut group_of = Vec::new();
        for (group, child) in tree.children(polytomy).enumerate() {
            for taxon in tree.leaves(child) {
                label_of.insert(taxon.clone(), group);
            }
            group_of.push(child);
        }
        Relabeling {
            polytomy,
            label_of,
            group_of,
        }
    }

    pub fn polytomy(&self) -> NodeId {
        self.polytomy
    }

    /// Number of branches `d`.
    pub fn degree(&self) -> usize {
        self.group_of.len()
    }

    /// The reserved group for taxa outside the polytomy's branches.
    pub fn outside(&self) -> Group {
        self.group_of.len()
    }

    pub fn group(&self, taxon: &TaxonId) -> Group {
        self.label_of.get(taxon).copied().unwrap_or(self.outside())
    }

    /// Branch root of a group; `None` for the outside group.
    pub fn subtree(&self, group: Group) -> Option<NodeId> {
        self.group_of.get(group).copied()
    }

    /// A copy of `source` with every taxon replaced by its group.
    pub fn relabel_tree(&self, source: &Tree<TaxonId>) -> Tree<Group> {
        source.map_labels(|taxon| self.group(taxon))
    }
}
