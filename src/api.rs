//! Python binding layer for supertree construction.
//!
//! Provides Python functions that run the strict consensus merger and the
//! SuperFine refinement on a file of newick source trees.

use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::time::Duration;

use crate::error::SuperfineError;
use crate::io::read_source_trees;
use crate::merger::strict_consensus_merge;
use crate::metrics::sum_errors_across_sources;
use crate::pipeline::{superfine as run_superfine, SuperfineConfig};
use crate::reconciler::ReconcilerKind;
use crate::tree::Tree;

fn to_py_err(e: SuperfineError) -> PyErr {
    match e {
        SuperfineError::Io { .. } => PyIOError::new_err(e.to_string()),
        SuperfineError::Newick(_)
        | SuperfineError::Tree(_)
        | SuperfineError::NoTrees
        | SuperfineError::InsufficientOverlap(_)
        | SuperfineError::LeafSetMismatch => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Build a SuperFine supertree from a file of source trees.
///
/// Args:
///     path: File of semicolon-terminated newick trees (optionally gzipped)
///     reconciler: One of "qmc", "gmrp", "rmrp", "fml", "rml" (default: "qmc")
///     num_iters: Ratchet iterations for the MRP reconcilers (default: 100)
///     timeout: Seconds to wait for each resolver call, None for no limit
///     seed: Seed for the randomized reconciler steps (default: 0)
///
/// Returns:
///     The refined supertree as a newick string
///
/// Raises:
///     ValueError: If the trees cannot be parsed or do not overlap enough
///     RuntimeError: If a resolver executable cannot be run
#[pyfunction]
#[pyo3(signature = (path, reconciler="qmc", num_iters=100, timeout=None, seed=0))]
fn superfine(path: String, reconciler: &str, num_iters: usize, timeout: Option<f64>, seed: u64) -> PyResult<String> {
    let kind: ReconcilerKind = reconciler.parse().map_err(PyValueError::new_err)?;
    let timeout = match timeout {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) if secs <= 0.0 => None,
        Some(secs) => return Err(PyValueError::new_err(format!("invalid timeout {secs}"))),
        None => None,
    };
    let config = SuperfineConfig {
        reconciler: kind,
        iterations: num_iters,
        timeout,
        seed,
        ..SuperfineConfig::default()
    };

    let sources = read_source_trees(&path).map_err(to_py_err)?;
    let run = run_superfine(sources, &config).map_err(to_py_err)?;
    Ok(run.tree.to_newick())
}

/// Strict consensus merger tree of a file of source trees.
#[pyfunction]
fn scm_tree(path: String) -> PyResult<String> {
    let sources = read_source_trees(&path).map_err(to_py_err)?;
    let merged = strict_consensus_merge(sources).map_err(to_py_err)?;
    Ok(merged.to_newick())
}

/// Score a supertree against the source trees it was built from.
///
/// Returns:
///     A tuple (false_negatives, false_positives, true_bipartitions,
///     estimated_bipartitions) summed over all sources, each source compared
///     to the supertree restricted to its taxa.
#[pyfunction]
fn source_errors(path: String, supertree: String) -> PyResult<(usize, usize, usize, usize)> {
    let sources = read_source_trees(&path).map_err(to_py_err)?;
    let tree = Tree::from_newick(&supertree).map_err(to_py_err)?;
    let counts = sum_errors_across_sources(&sources, &tree).map_err(to_py_err)?;
    Ok((
        counts.false_negatives,
        counts.false_positives,
        counts.true_bipartitions,
        counts.estimated_bipartitions,
    ))
}

/// Python module definition
#[pymodule]
fn rust_python_superfine(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(superfine, m)?)?;
    m.add_function(wrap_pyfunction!(scm_tree, m)?)?;
    m.add_function(wrap_pyfunction!(source_errors, m)?)?;
    Ok(())
}
