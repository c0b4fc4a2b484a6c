//! Quartet trees displayed by collapsed source trees.
//!
//! # Overview
//! Every internal edge of a tree separates its leaves in two sides. Picking
//! two leaves on each side gives a quartet tree the source tree agrees with:
//!
//! ```text
//!    0     2
//!     \___/        edge splits {0,1} | {2,3,4}
//!     /   \        quartets: 0,1|2,3   0,1|2,4   0,1|3,4
//!    1     (3,4)
//! ```
//!
//! Quartets are counted across all collapsed source trees of one polytomy;
//! the weighted set is what the quartet solver receives.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use itertools::Itertools;

use crate::tree::{Label, NodeId, Tree};

/// A 4-leaf tree `a,b|c,d` in canonical form: each pair sorted, then the two
/// pairs sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quartet<L> {
    pairs: [[L; 2]; 2],
}

impl<L: Label> Quartet<L> {
    /// The quartet `a,b|c,d`.
    pub fn new(a: L, b: L, c: L, d: L) -> Self {
        let sorted = |x: L, y: L| if y < x { [y, x] } else { [x, y] };
        let left = sorted(a, b);
        let right = sorted(c, d);
        let pairs = if right < left { [right, left] } else { [left, right] };
        Quartet { pairs }
    }

    pub fn pairs(&self) -> &[[L; 2]; 2] {
        &self.pairs
    }

    /// `true` when the four labels are pairwise distinct.
    pub fn is_informative(&self) -> bool {
        let labels: BTreeSet<&L> = self.pairs.iter().flatten().collect();
        labels.len() == 4
    }
}

impl<L: Display> Display for Quartet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [[a, b], [c, d]] = &self.pairs;
        write!(f, "{a},{b}|{c},{d}")
    }
}

/// All quartets displayed by the internal edges of `tree`.
pub fn displayed_quartets<L: Label>(tree: &Tree<L>) -> BTreeSet<Quartet<L>> {
    let mut quartets = BTreeSet::new();
    let Some(root) = tree.root() else {
        return quartets;
    };
    for (_, child) in tree.internal_edges() {
        let inside = tree.leaves(child);
        let outside = leaves_outside(tree, root, child);
        for (a, b) in inside.iter().tuple_combinations() {
            for (c, d) in outside.iter().tuple_combinations() {
                quartets.insert(Quartet::new(a.clone(), b.clone(), c.clone(), d.clone()));
            }
        }
    }
    quartets
}

/// Leaf labels of the tree that do not lie below `excluded`.
fn leaves_outside<L: Label>(tree: &Tree<L>, root: NodeId, excluded: NodeId) -> Vec<L> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if id == excluded {
            continue;
        }
        if tree.is_leaf(id) {
            out.extend(tree.label(id).cloned());
        } else {
            stack.extend(tree.children(id));
        }
    }
    out
}

/// Quartets with the number of source trees displaying each.
#[derive(Debug, Clone)]
pub struct QuartetWeights<L> {
    weights: BTreeMap<Quartet<L>, usize>,
}

impl<L: Label> Default for QuartetWeights<L> {
    fn default() -> Self {
        QuartetWeights {
            weights: BTreeMap::new(),
        }
    }
}

impl<L: Label> QuartetWeights<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every quartet displayed by `tree` once.
    pub fn add_tree(&mut self, tree: &Tree<L>) {
        for quartet in displayed_quartets(tree) {
            *self.weights.entry(quartet).or_insert(0) += 1;
        }
    }

    /// Drop quartets whose labels are not all distinct.
    pub fn remove_uninformative(&mut self) {
        self.weights.retain(|quartet, _| quartet.is_informative());
    }

    pub fn weight(&self, quartet: &Quartet<L>) -> usize {
        self.weights.get(quartet).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Quartet<L>, usize)> {
        self.weights.iter().map(|(q, &w)| (q, w))
    }

    /// Solver input: one `weight:a,b|c,d` line per quartet, sorted by quartet.
    pub fn to_solver_input(&self) -> String {
        self.iter().map(|(q, w)| format!("{w}:{q}")).join("\n")
    }
}

impl<L: Label> FromIterator<Tree<L>> for QuartetWeights<L> {
    fn from_iter<I: IntoIterator<Item = Tree<L>>>(trees: I) -> Self {
        let mut weights = QuartetWeights::new();
        for tree in trees {
            weights.add_tree(&tree);
        }
        weights.remove_uninformative();
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::test_util::groups;
    use proptest::prelude::*;

    #[test]
    fn test_quartets_of_one_edge() {
        let tree = groups("((0,1),2,(3,4));");
        let quartets: Vec<String> = displayed_quartets(&tree).iter().map(|q| q.to_string()).collect();
        // {0,1}|{2,3,4} and {3,4}|{0,1,2}
        assert_eq!(
            quartets,
            vec!["0,1|2,3", "0,1|2,4", "0,1|3,4", "0,2|3,4", "1,2|3,4"]
        );
    }

    #[test]
    fn test_star_displays_nothing() {
        assert!(displayed_quartets(&groups("(0,1,2,3,4);")).is_empty());
        assert!(displayed_quartets(&Tree::<usize>::new()).is_empty());
    }

    #[test]
    fn test_weights_and_uninformative_removal() {
        let mut weights = QuartetWeights::new();
        weights.add_tree(&groups("((0,1),(2,3));"));
        weights.add_tree(&groups("((0,1),2,(3,4));"));
        // group 4 on both sides of the root
        weights.add_tree(&groups("((0,a4),(b4,3),1);"));
        assert_eq!(weights.weight(&Quartet::new(0, 1, 2, 3)), 2);
        assert_eq!(weights.weight(&Quartet::new(4, 0, 3, 4)), 1);

        weights.remove_uninformative();
        assert_eq!(weights.weight(&Quartet::new(0, 4, 4, 3)), 0);
        assert_eq!(weights.len(), 6);
        assert_eq!(
            weights.to_solver_input(),
            "2:0,1|2,3\n1:0,1|2,4\n2:0,1|3,4\n1:0,2|3,4\n1:0,4|1,3\n1:1,2|3,4"
        );
    }

    #[test]
    fn test_from_trees() {
        let weights: QuartetWeights<usize> = [groups("((0,1),(2,3));"), groups("((0,2),(1,3));")]
            .into_iter()
            .collect();
        assert_eq!(weights.len(), 2);
        assert!(weights.iter().all(|(_, w)| w == 1));
    }

    #[test]
    fn test_numeric_ordering() {
        assert_eq!(Quartet::new(10, 2, 3, 1).to_string(), "1,3|2,10");
    }

    proptest! {
        #[test]
        fn proptest_canonical_form(a in 0usize..50, b in 0usize..50, c in 0usize..50, d in 0usize..50) {
            let q = Quartet::new(a, b, c, d);
            prop_assert_eq!(&q, &Quartet::new(b, a, c, d));
            prop_assert_eq!(&q, &Quartet::new(a, b, d, c));
            prop_assert_eq!(&q, &Quartet::new(c, d, a, b));
            prop_assert_eq!(&q, &Quartet::new(d, c, b, a));
        }
    }
}
