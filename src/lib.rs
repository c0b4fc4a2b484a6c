//! Crate root: module orchestration and public re-exports.
//!
//! Builds SuperFine supertrees: overlapping source trees are combined by the
//! strict consensus merger, then every polytomy of the merged tree is resolved
//! by an external reconciler working on the source trees relabeled to the
//! polytomy's branches.
//!
//! Modules:
//! - `tree`: arena tree model, bipartitions, restriction, newick output.
//! - `bitset`: compact bitset representation for leaf sets.
//! - `splits`: bipartitions of a tree as bitsets over a shared taxon index.
//! - `metrics`: FP / FN / RF against source trees, resolution.
//! - `polytomy`: polytomy discovery and per-polytomy relabeling.
//! - `collapse`: minimization of relabeled source trees.
//! - `quartet`: displayed quartets and their weights.
//! - `matrix`: MRP character matrices and the PAUP* ratchet script.
//! - `reconciler`: the external resolvers behind one `Resolve` trait.
//! - `expand`: mapping resolver answers back and splicing them in.
//! - `merger`: strict consensus merger.
//! - `pipeline`: the end-to-end refinement pass.
//! - `io`: reading source trees, writing trees and matrices.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod bitset;
pub mod collapse;
pub mod error;
pub mod expand;
pub mod io;
pub mod matrix;
pub mod merger;
pub mod metrics;
pub mod pipeline;
pub mod polytomy;
pub mod quartet;
pub mod reconciler;
pub mod splits;
pub mod tree;

#[cfg(feature = "python")]
pub mod api;

// Re-export frequently used types & functions
pub use bitset::Bitset;
pub use error::{Result, SuperfineError};
pub use io::{read_source_trees, write_tree};
pub use merger::strict_consensus_merge;
pub use pipeline::{refine, superfine, superfine_with, ResolutionReport, SuperfineConfig};
pub use reconciler::{Reconciler, ReconcilerKind, Resolve};
pub use tree::{Bipartition, NodeId, TaxonId, Tree};
