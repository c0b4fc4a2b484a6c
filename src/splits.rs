//! Split snapshots: the bipartitions of a tree as bitsets over a shared
//! taxon index.
//!
//! # Overview
//! A [`SplitSnapshot`] captures all non-trivial bipartitions of a tree. The
//! snapshot is immutable and can be compared with other snapshots in
//! parallel.
//!
//! Each internal edge divides the leaves into two groups:
//! ```text
//!      root
//!     /    \
//!   {A,B}  {C,D}  ← this edge creates the split {A,B} | {C,D}
//! ```
//!
//! Only one side of each split is stored.
//!
//! # Taxon names, not node ids
//! Node ids depend on how a tree was built. Taxon labels are consistent, so
//! all snapshots compared with each other are built over one [`TaxonIndex`],
//! where labels are sorted and mapped to bit positions.

use std::collections::{HashMap, HashSet};

use crate::bitset::Bitset;
use crate::tree::{Label, NodeId, Tree};

/// Sorted taxon labels and their bit positions.
#[derive(Debug, Clone)]
pub struct TaxonIndex<L> {
    taxa: Vec<L>,
    index: HashMap<L, usize>,
}

impl<L: Label> TaxonIndex<L> {
    pub fn new(taxa: impl IntoIterator<Item = L>) -> Self {
        let mut taxa: Vec<L> = taxa.into_iter().collect();
        taxa.sort();
        taxa.dedup();
        let index = taxa.iter().enumerate().map(|(i, t)| (t.clone(), i)).collect();
        TaxonIndex { taxa, index }
    }

    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    pub fn words(&self) -> usize {
        Bitset::words_for(self.taxa.len())
    }

    pub fn index_of(&self, label: &L) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> &L {
        &self.taxa[idx]
    }

    /// Bitset of the given labels; labels outside the index are ignored.
    pub fn bitset_of<'a>(&self, labels: impl IntoIterator<Item = &'a L>) -> Bitset
    where
        L: 'a,
    {
        let mut bits = Bitset::zeros(self.words());
        for label in labels {
            if let Some(idx) = self.index_of(label) {
                bits.set(idx);
            }
        }
        bits
    }
}

/// An immutable snapshot of all splits in a tree.
///
/// # Canonicalization
/// Each split can be written {A,B}|{C,D} or {C,D}|{A,B}. We always store the
/// side that does NOT contain the tree's lowest taxon index (the anchor), so
/// identical splits get identical bitsets.
#[derive(Debug, Clone)]
pub struct SplitSnapshot {
    /// All splits, canonicalized
    pub parts: HashSet<Bitset>,

    /// Every taxon of the tree
    pub leaves: Bitset,
}

impl SplitSnapshot {
    /// Extract a snapshot from a tree.
    ///
    /// # Algorithm
    /// 1. Walk the tree bottom-up, OR-ing child bitsets into their parent
    /// 2. Collect the bitset below each internal edge
    /// 3. Canonicalize (store the side without the anchor taxon)
    pub fn from_tree<L: Label>(tree: &Tree<L>, index: &TaxonIndex<L>) -> Self {
        let words = index.words();
        let leaves = index.bitset_of(tree.all_leaves());
        let anchor = leaves.ones().next();

        let mut cache: HashMap<NodeId, Bitset> = HashMap::new();
        if let Some(root) = tree.root() {
            for id in tree.postorder(root) {
                let bits = if tree.is_leaf(id) {
                    index.bitset_of(tree.label(id))
                } else {
                    let mut bits = Bitset::zeros(words);
                    for child in tree.children(id) {
                        bits.or_assign(&cache[&child]);
                    }
                    bits
                };
                cache.insert(id, bits);
            }
        }

        let parts = tree
            .internal_edges()
            .into_iter()
            .map(|(_, child)| {
                let bits = &cache[&child];
                match anchor {
                    Some(a) if bits.contains(a) => Self::complement_within(bits, &leaves),
                    _ => bits.clone(),
                }
            })
            .collect();

        SplitSnapshot { parts, leaves }
    }

    /// Complement of `bits` relative to the tree's own leaf set.
    fn complement_within(bits: &Bitset, leaves: &Bitset) -> Bitset {
        Bitset(leaves.0.iter().zip(&bits.0).map(|(l, b)| l & !b).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TaxonId;

    fn parse(newick: &str) -> Tree<TaxonId> {
        Tree::from_newick(newick).unwrap()
    }

    /// Same topology written from different roots gives the same snapshot.
    ///
    /// ```text
    /// Tree 1:  ((A,B),(C,D),E)      Tree 2:  (((C,D),E),A,B)
    /// Both display {A,B} | {C,D,E} and {C,D} | {A,B,E}
    /// ```
    #[test]
    fn test_rooting_does_not_change_snapshot() {
        let t1 = parse("((A,B),(C,D),E);");
        let t2 = parse("(((C,D),E),A,B);");
        let index = TaxonIndex::new(t1.taxa());

        let s1 = SplitSnapshot::from_tree(&t1, &index);
        let s2 = SplitSnapshot::from_tree(&t2, &index);
        assert_eq!(s1.parts, s2.parts);
        assert_eq!(s1.parts.len(), 2);

        // A (index 0) is never in a stored side
        assert!(s1.parts.iter().all(|p| !p.contains(0)));
    }

    #[test]
    fn test_anchor_side_never_stored() {
        let tree = parse("((A,B):0.5,(C,D):0.25,E);");
        let index = TaxonIndex::new(tree.taxa());
        let snap = SplitSnapshot::from_tree(&tree, &index);

        let cd = index.bitset_of(&["C".to_string(), "D".to_string()]);
        assert!(snap.parts.contains(&cd));
        // {A,B} stored as its complement {C,D,E}
        let cde = index.bitset_of(&["C".to_string(), "D".to_string(), "E".to_string()]);
        assert!(snap.parts.contains(&cde));
        assert_eq!(snap.leaves.count_ones(), 5);
    }

    #[test]
    fn test_index_roundtrip() {
        let index = TaxonIndex::new(["b", "a", "c", "a"]);
        assert_eq!(index.len(), 3);
        let bits = index.bitset_of(&["c", "a"]);
        assert_eq!(bits.0[0], 0b101);
        assert_eq!(index.label(bits.ones().last().unwrap()), &"c");
    }
}
