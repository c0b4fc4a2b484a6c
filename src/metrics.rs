//! Topological error metrics for supertrees.
//!
//! # Overview
//! Source trees are the "truth" a supertree should agree with. For one pair
//! of trees over the same leaf set:
//!
//! 1. **False positives (FP)**: bipartitions of the estimated tree missing
//!    from the true tree.
//! 2. **False negatives (FN)**: bipartitions of the true tree missing from
//!    the estimated tree.
//! 3. **Robinson-Foulds (RF)**: FP + FN, normalized by `2 * true splits`.
//!
//! ```text
//! True:      ((A,B),(C,D),E)     splits {A,B} {C,D}
//! Estimated: ((A,C),(B,D),E)     splits {A,C} {B,D}
//!
//! FP = 2, FN = 2, RF rate = 4 / (2*2) = 1.0
//! ```
//!
//! [`sum_errors_across_sources`] restricts the supertree to each source's
//! taxa and adds up the counts (in parallel with rayon).

use std::collections::HashSet;
use std::ops::Add;

use rayon::prelude::*;

use crate::error::{Result, SuperfineError};
use crate::splits::{SplitSnapshot, TaxonIndex};
use crate::tree::{Label, Tree};

/// Raw bipartition counts between a true and an estimated tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_bipartitions: usize,
    pub estimated_bipartitions: usize,
}

impl Add for ErrorCounts {
    type Output = ErrorCounts;

    fn add(self, other: ErrorCounts) -> ErrorCounts {
        ErrorCounts {
            false_positives: self.false_positives + other.false_positives,
            false_negatives: self.false_negatives + other.false_negatives,
            true_bipartitions: self.true_bipartitions + other.true_bipartitions,
            estimated_bipartitions: self.estimated_bipartitions + other.estimated_bipartitions,
        }
    }
}

/// Normalized error rates. `None` when the denominator is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorRates {
    pub fp: Option<f64>,
    pub fn_: Option<f64>,
    pub rf: Option<f64>,
}

impl ErrorCounts {
    pub fn rf(&self) -> usize {
        self.false_positives + self.false_negatives
    }

    /// FP / estimated, FN / true and RF / (2 * true).
    pub fn rates(&self) -> ErrorRates {
        let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);
        ErrorRates {
            fp: ratio(self.false_positives, self.estimated_bipartitions),
            fn_: ratio(self.false_negatives, self.true_bipartitions),
            rf: ratio(self.rf(), 2 * self.true_bipartitions),
        }
    }
}

/// Count false positive and false negative bipartitions.
///
/// With `restrict_both`, both trees are first restricted to their shared
/// taxa. Without it, differing leaf sets are an error.
///
/// # Errors
/// [`SuperfineError::LeafSetMismatch`] when the leaf sets differ and
/// `restrict_both` is false.
pub fn raw_fp_fn<L: Label>(
    true_tree: &Tree<L>,
    estimated: &Tree<L>,
    restrict_both: bool,
) -> Result<ErrorCounts> {
    let true_taxa = true_tree.taxa();
    let est_taxa = estimated.taxa();

    if true_taxa != est_taxa {
        if !restrict_both {
            return Err(SuperfineError::LeafSetMismatch);
        }
        let shared: HashSet<L> = true_taxa.intersection(&est_taxa).cloned().collect();
        let t = true_tree.restrict(&shared);
        let e = estimated.restrict(&shared);
        return Ok(counts_from_trees(&t, &e));
    }
    Ok(counts_from_trees(true_tree, estimated))
}

fn counts_from_trees<L: Label>(true_tree: &Tree<L>, estimated: &Tree<L>) -> ErrorCounts {
    let index = TaxonIndex::new(true_tree.taxa());
    let a = SplitSnapshot::from_tree(true_tree, &index);
    let b = SplitSnapshot::from_tree(estimated, &index);
    counts_from_snapshots(&a, &b)
}

/// FP / FN from two snapshots built over the same taxon index.
///
/// # Algorithm (O(n) using HashSet)
/// ```text
/// shared = T.parts ∩ E.parts
/// FP = |E| - |shared|,  FN = |T| - |shared|
/// ```
pub fn counts_from_snapshots(true_snap: &SplitSnapshot, est_snap: &SplitSnapshot) -> ErrorCounts {
    let shared = true_snap.parts.intersection(&est_snap.parts).count();
    ErrorCounts {
        false_positives: est_snap.parts.len() - shared,
        false_negatives: true_snap.parts.len() - shared,
        true_bipartitions: true_snap.parts.len(),
        estimated_bipartitions: est_snap.parts.len(),
    }
}

/// Errors of `supertree` against every source tree, summed.
///
/// The supertree is restricted to each source's taxa before comparing, so
/// sources only need to be subsets of the supertree's taxa.
pub fn sum_errors_across_sources<L: Label>(
    sources: &[Tree<L>],
    supertree: &Tree<L>,
) -> Result<ErrorCounts> {
    sources
        .par_iter()
        .map(|source| {
            let taxa: HashSet<L> = source.taxa().into_iter().collect();
            let restricted = supertree.restrict(&taxa);
            raw_fp_fn(source, &restricted, false)
        })
        .try_reduce(ErrorCounts::default, |a, b| Ok(a + b))
}

/// Fraction of the possible `n - 3` bipartitions that a tree resolves.
///
/// Trees with fewer than 4 taxa count as fully resolved.
pub fn resolution<L: Label>(tree: &Tree<L>) -> f64 {
    let n = tree.taxa().len();
    if n < 4 {
        return 1.0;
    }
    tree.bipartitions().len() as f64 / (n - 3) as f64
}
