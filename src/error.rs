//! Error type shared by the whole crate.
//!
//! Errors fall in two groups. Fatal ones abort a run (bad input, insufficient
//! overlap while merging, a resolver binary that cannot be launched). The rest
//! only concern the polytomy being resolved: the pipeline records them and
//! leaves that polytomy untouched.

use std::path::PathBuf;
use std::time::Duration;

use phylotree::tree::TreeError;
use thiserror::Error;

/// Errors that can occur while merging, refining and scoring supertrees.
#[derive(Error, Debug)]
pub enum SuperfineError {
    /// Reading or writing a file failed
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A newick string could not be parsed
    #[error("Could not parse newick tree: {0}")]
    Newick(String),
    /// The newick parser handed back a tree it could not walk
    #[error("Malformed parsed tree: {0}")]
    Tree(#[from] TreeError),
    /// No informative source tree survived filtering
    #[error("No informative source trees (each needs at least 4 distinct taxa)")]
    NoTrees,
    /// No remaining pair of trees shares 4 or more taxa
    #[error("Insufficient overlap for SCM step ({0} trees left)")]
    InsufficientOverlap(usize),
    /// The external resolver could not be started at all
    #[error("Execution of {program} failed: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The external resolver ran but did not give back a usable tree
    #[error("{program} produced no usable tree: {reason}")]
    MalformedOutput { program: String, reason: String },
    /// The external resolver did not finish in time
    #[error("{program} did not finish within {limit:?}")]
    Timeout { program: String, limit: Duration },
    /// A resolver answer named a group outside the polytomy
    #[error("Resolver answer refers to unknown polytomy group {0}")]
    UnknownGroup(usize),
    /// Two trees that must share a leaf set do not
    #[error("Leaf sets are not identical")]
    LeafSetMismatch,
}

impl SuperfineError {
    /// Wrap an [`std::io::Error`] together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SuperfineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must halt the whole run.
    ///
    /// Per-polytomy failures (bad resolver output, timeouts, unknown groups)
    /// return `false`; the polytomy is left unresolved and the run goes on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SuperfineError::MalformedOutput { .. }
                | SuperfineError::Timeout { .. }
                | SuperfineError::UnknownGroup(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SuperfineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let launch = SuperfineError::Launch {
            program: "find-cut".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(launch.is_fatal());
        assert!(SuperfineError::InsufficientOverlap(3).is_fatal());

        let garbage = SuperfineError::MalformedOutput {
            program: "find-cut".into(),
            reason: "empty output".into(),
        };
        assert!(!garbage.is_fatal());
        assert!(!SuperfineError::UnknownGroup(7).is_fatal());
        assert!(
            !SuperfineError::Timeout {
                program: "paup".into(),
                limit: Duration::from_secs(5)
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            SuperfineError::InsufficientOverlap(2).to_string(),
            "Insufficient overlap for SCM step (2 trees left)"
        );
    }
}
