//! Reconcilers: the external tools that turn per-polytomy evidence into one
//! small tree over the polytomy's groups.
//!
//! # Overview
//! Every reconciler answers the same question: given what the source trees
//! say about the groups `0..=d` of one polytomy, what is the best tree over
//! those groups? The pipeline only sees the [`Resolve`] trait:
//!
//! ```text
//!   Evidence::Quartets ──► find-cut (stdin: "w:a,b|c,d" lines) ──┐
//!   Evidence::Trees ─────► MRP matrix ──► PAUP* ratchet ─────────┼──► newick over groups
//!                                     └─► FastTree / RAxML ──────┘
//! ```
//!
//! # Failures
//! A tool that cannot be started aborts the run. A tool that runs but gives
//! back nothing usable, or exceeds the timeout, only fails the polytomy it was
//! asked about.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, SuperfineError};
use crate::matrix::{read_consensus_tree, read_ratchet_trees, CharacterMatrix, Encoding, MatrixFormat, RatchetScript};
use crate::polytomy::Group;
use crate::quartet::QuartetWeights;
use crate::tree::Tree;

/// What a reconciler consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Quartets,
    Trees,
}

/// Per-polytomy input of a reconciler.
#[derive(Debug, Clone)]
pub enum Evidence {
    /// Weighted quartets over the groups
    Quartets(QuartetWeights<Group>),
    /// Collapsed, relabeled source trees
    Trees(Vec<Tree<Group>>),
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        match self {
            Evidence::Quartets(weights) => weights.is_empty(),
            Evidence::Trees(trees) => trees.is_empty(),
        }
    }
}

/// Anything able to resolve one polytomy.
pub trait Resolve {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// The evidence [`Resolve::resolve`] expects.
    fn evidence_kind(&self) -> EvidenceKind;

    /// A newick tree over the groups of the evidence. `seed` drives any
    /// randomized step so a run can be repeated.
    fn resolve(&self, evidence: &Evidence, seed: u64) -> Result<String>;
}

/// The reconciler chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcilerKind {
    /// Quartets MaxCut
    Qmc,
    /// MRP, greedy consensus of the most parsimonious trees
    Gmrp,
    /// MRP, one most parsimonious tree at random
    Rmrp,
    /// MRL with FastTree
    Fml,
    /// MRL with RAxML
    Rml,
}

impl ReconcilerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReconcilerKind::Qmc => "qmc",
            ReconcilerKind::Gmrp => "gmrp",
            ReconcilerKind::Rmrp => "rmrp",
            ReconcilerKind::Fml => "fml",
            ReconcilerKind::Rml => "rml",
        }
    }
}

impl std::str::FromStr for ReconcilerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "qmc" => Ok(ReconcilerKind::Qmc),
            "gmrp" => Ok(ReconcilerKind::Gmrp),
            "rmrp" => Ok(ReconcilerKind::Rmrp),
            "fml" => Ok(ReconcilerKind::Fml),
            "rml" => Ok(ReconcilerKind::Rml),
            other => Err(format!(
                "unknown reconciler '{other}' (expected qmc, gmrp, rmrp, fml or rml)"
            )),
        }
    }
}

/// Executable names of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executables {
    pub qmc: String,
    pub paup: String,
    pub fasttree: String,
    pub raxml: String,
}

impl Default for Executables {
    fn default() -> Self {
        Executables {
            qmc: "find-cut".to_string(),
            paup: "paup".to_string(),
            fasttree: "FastTree".to_string(),
            raxml: "raxmlHPC".to_string(),
        }
    }
}

/// Which parsimony tree to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsimonyOutput {
    GreedyConsensus,
    RandomBest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikelihoodEngine {
    FastTree,
    Raxml,
}

#[derive(Debug, Clone)]
enum Method {
    Quartet,
    Parsimony {
        output: ParsimonyOutput,
        iterations: usize,
    },
    Likelihood(LikelihoodEngine),
}

/// One of the built-in reconcilers, backed by an external program.
#[derive(Debug, Clone)]
pub struct Reconciler {
    kind: ReconcilerKind,
    method: Method,
    program: String,
    timeout: Option<Duration>,
}

impl Reconciler {
    /// Build the reconciler for `kind`. `iterations` is the number of
    /// ratchet replicates for the parsimony reconcilers.
    pub fn new(kind: ReconcilerKind, executables: &Executables, iterations: usize, timeout: Option<Duration>) -> Self {
        let (method, program) = match kind {
            ReconcilerKind::Qmc => (Method::Quartet, &executables.qmc),
            ReconcilerKind::Gmrp => (
                Method::Parsimony {
                    output: ParsimonyOutput::GreedyConsensus,
                    iterations,
                },
                &executables.paup,
            ),
            ReconcilerKind::Rmrp => (
                Method::Parsimony {
                    output: ParsimonyOutput::RandomBest,
                    iterations,
                },
                &executables.paup,
            ),
            ReconcilerKind::Fml => (Method::Likelihood(LikelihoodEngine::FastTree), &executables.fasttree),
            ReconcilerKind::Rml => (Method::Likelihood(LikelihoodEngine::Raxml), &executables.raxml),
        };
        Reconciler {
            kind,
            method,
            program: program.clone(),
            timeout,
        }
    }

    pub fn kind(&self) -> ReconcilerKind {
        self.kind
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn malformed(&self, reason: impl Into<String>) -> SuperfineError {
        SuperfineError::MalformedOutput {
            program: self.program.clone(),
            reason: reason.into(),
        }
    }

    fn run_quartets(&self, weights: &QuartetWeights<Group>) -> Result<String> {
        let output = run_program(&self.program, &[], Some(&weights.to_solver_input()), None, self.timeout)?;
        first_tree_line(&output).ok_or_else(|| self.malformed("empty output"))
    }

    fn run_parsimony(&self, trees: &[Tree<Group>], output: ParsimonyOutput, iterations: usize, seed: u64) -> Result<String> {
        let matrix = CharacterMatrix::from_trees(trees);
        if matrix.is_empty() {
            return Ok(Tree::<Group>::new().to_newick());
        }

        let scratch = ScratchDir::new("mrp")?;
        let prefix = scratch.path().join("ratchet");
        let prefix_str = prefix.to_string_lossy().into_owned();
        let script = RatchetScript::new(prefix_str.clone(), iterations);
        let mut rng = SmallRng::seed_from_u64(seed);
        let text = script.render(&matrix, &mut rng);
        fs::write(&prefix, text).map_err(|e| SuperfineError::io(&prefix, e))?;

        let args = ["-n".to_string(), prefix_str];
        run_program(&self.program, &args, None, Some(scratch.path()), self.timeout)?;

        match output {
            ParsimonyOutput::GreedyConsensus => {
                let contents = read_output(&script.greedy_file()).map_err(|r| self.malformed(r))?;
                read_consensus_tree(&contents).ok_or_else(|| self.malformed("no tree in greedy consensus file"))
            }
            ParsimonyOutput::RandomBest => {
                let contents = read_output(&script.tree_file()).map_err(|r| self.malformed(r))?;
                let trees = read_ratchet_trees(&contents);
                trees
                    .choose(&mut rng)
                    .cloned()
                    .ok_or_else(|| self.malformed("no most parsimonious tree written"))
            }
        }
    }

    fn run_likelihood(&self, trees: &[Tree<Group>], engine: LikelihoodEngine, seed: u64) -> Result<String> {
        let matrix = CharacterMatrix::from_trees(trees);
        if matrix.is_empty() {
            return Ok(Tree::<Group>::new().to_newick());
        }

        match engine {
            LikelihoodEngine::FastTree => {
                let alignment = matrix.render(MatrixFormat::Phylip, Encoding::NUCLEOTIDE);
                let args = ["-gtr", "-nosupport", "-nt"].map(String::from);
                let output = run_program(&self.program, &args, Some(&alignment), None, self.timeout)?;
                first_tree_line(&output).ok_or_else(|| self.malformed("empty output"))
            }
            LikelihoodEngine::Raxml => {
                let scratch = ScratchDir::new("mrl")?;
                let alignment = scratch.path().join("matrix.phy");
                fs::write(&alignment, matrix.render(MatrixFormat::Phylip, Encoding::BINARY))
                    .map_err(|e| SuperfineError::io(&alignment, e))?;
                let args = [
                    "-m".to_string(),
                    "BINGAMMA".to_string(),
                    "-s".to_string(),
                    alignment.to_string_lossy().into_owned(),
                    "-n".to_string(),
                    "superfine".to_string(),
                    "-p".to_string(),
                    (seed % 1_000_000 + 1).to_string(),
                    "-w".to_string(),
                    scratch.path().to_string_lossy().into_owned(),
                ];
                run_program(&self.program, &args, None, Some(scratch.path()), self.timeout)?;
                let best = scratch.path().join("RAxML_bestTree.superfine");
                let contents = read_output(&best.to_string_lossy()).map_err(|r| self.malformed(r))?;
                first_tree_line(&contents).ok_or_else(|| self.malformed("empty best tree file"))
            }
        }
    }
}

impl Resolve for Reconciler {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn evidence_kind(&self) -> EvidenceKind {
        match self.method {
            Method::Quartet => EvidenceKind::Quartets,
            _ => EvidenceKind::Trees,
        }
    }

    fn resolve(&self, evidence: &Evidence, seed: u64) -> Result<String> {
        match (&self.method, evidence) {
            (Method::Quartet, Evidence::Quartets(weights)) => self.run_quartets(weights),
            (Method::Quartet, Evidence::Trees(trees)) => {
                self.run_quartets(&trees.iter().cloned().collect())
            }
            (Method::Parsimony { output, iterations }, Evidence::Trees(trees)) => {
                self.run_parsimony(trees, *output, *iterations, seed)
            }
            (Method::Likelihood(engine), Evidence::Trees(trees)) => self.run_likelihood(trees, *engine, seed),
            (_, Evidence::Quartets(_)) => Err(self.malformed("matrix reconcilers need source trees, got quartets")),
        }
    }
}

fn read_output(path: &str) -> std::result::Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))
}

/// First non-empty line of a tool's output.
fn first_tree_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Remove internal support values: `)0.95` becomes `)`.
pub fn strip_support(newick: &str) -> String {
    let mut out = String::with_capacity(newick.len());
    let mut chars = newick.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c != ')' {
            continue;
        }
        let mut digits = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            continue;
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut fraction = false;
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    fraction = true;
                    chars.next();
                } else {
                    break;
                }
            }
            if !fraction {
                out.push('.');
            }
        }
    }
    out
}

/// Parse a reconciler answer into a tree over groups.
pub fn parse_answer(program: &str, newick: &str) -> Result<Tree<Group>> {
    let malformed = |reason: String| SuperfineError::MalformedOutput {
        program: program.to_string(),
        reason,
    };
    let cleaned = strip_support(newick.trim());
    let tree = Tree::from_newick(&cleaned).map_err(|e| malformed(e.to_string()))?;
    tree.try_map_labels(|label| {
        label
            .trim_matches('\'')
            .parse::<Group>()
            .map_err(|_| malformed(format!("leaf '{label}' is not a group id")))
    })
}

/// Run `program` and return its standard output.
///
/// With a `timeout`, the process is killed once it runs longer and
/// [`SuperfineError::Timeout`] is returned. A non-zero exit status is only
/// logged; the caller decides whether the output is usable.
pub fn run_program(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<String> {
    let launch = |source: std::io::Error| SuperfineError::Launch {
        program: program.to_string(),
        source,
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    debug!("running {} {}", program, args.join(" "));
    let mut child = command.spawn().map_err(launch)?;

    // pipes are drained on their own threads so a chatty tool cannot block
    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_string();
            Some(thread::spawn(move || {
                // a tool may exit without reading everything
                let _ = pipe.write_all(input.as_bytes());
            }))
        }
        _ => None,
    };
    let stdout = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    // `None` once the limit is hit and the process is killed
    let status = match timeout {
        None => Some(child.wait().map_err(launch)?),
        Some(limit) => {
            let start = Instant::now();
            loop {
                if let Some(status) = child.try_wait().map_err(launch)? {
                    break Some(status);
                }
                if start.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    };

    if let Some(handle) = writer {
        let _ = handle.join();
    }
    let output = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let errors = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    let Some(status) = status else {
        let limit = timeout.unwrap_or_default();
        warn!("{} killed after {:?}", program, limit);
        return Err(SuperfineError::Timeout {
            program: program.to_string(),
            limit,
        });
    };
    if !status.success() {
        debug!("{} exited with {}: {}", program, status, errors.trim());
    }
    Ok(output)
}

/// A private temporary directory, removed with everything in it on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl ScratchDir {
    pub fn new(tag: &str) -> Result<Self> {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("superfine-{}-{}-{}", tag, std::process::id(), n));
        fs::create_dir_all(&path).map_err(|e| SuperfineError::io(&path, e))?;
        Ok(ScratchDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            debug!("could not remove {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_support() {
        assert_eq!(strip_support("((0,1)0.95,(2,3)100);"), "((0,1),(2,3));");
        assert_eq!(strip_support("((0,1)1:0.5,2,3);"), "((0,1):0.5,2,3);");
        assert_eq!(strip_support("((0,1),2,3);"), "((0,1),2,3);");
    }

    #[test]
    fn test_parse_answer() {
        let tree = parse_answer("find-cut", "((0,1)0.9,(2,3));\n").unwrap();
        assert_eq!(tree.to_newick(), "((0,1),(2,3));");

        let err = parse_answer("find-cut", "((a,b),(c,d));").unwrap_err();
        assert!(matches!(err, SuperfineError::MalformedOutput { .. }));
        assert!(!err.is_fatal());

        assert!(parse_answer("FastTree", "();").unwrap().is_empty());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("gmrp".parse::<ReconcilerKind>(), Ok(ReconcilerKind::Gmrp));
        assert!("mrp".parse::<ReconcilerKind>().is_err());
        let reconciler = Reconciler::new(ReconcilerKind::Fml, &Executables::default(), 100, None);
        assert_eq!(reconciler.program(), "FastTree");
        assert_eq!(reconciler.evidence_kind(), EvidenceKind::Trees);
        assert_eq!(reconciler.name(), "fml");
    }

    #[test]
    fn test_missing_program_is_fatal() {
        let err = run_program("superfine-no-such-tool", &[], None, None, None).unwrap_err();
        assert!(matches!(err, SuperfineError::Launch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_matrix_gives_empty_tree() {
        // a star displays no bipartition, so the tool is never called
        let reconciler = Reconciler::new(ReconcilerKind::Gmrp, &Executables::default(), 10, None);
        let star = crate::tree::test_util::groups("(0,1,2,3,4);");
        let answer = reconciler.resolve(&Evidence::Trees(vec![star]), 1).unwrap();
        assert_eq!(answer, "();");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_program_pipes_stdin() {
        let out = run_program("cat", &[], Some("1:0,1|2,3\n"), None, None).unwrap();
        assert_eq!(out, "1:0,1|2,3\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_quartet_reconciler_reads_first_line() {
        // `cat` echoes the solver input back; the first line is the answer
        let executables = Executables {
            qmc: "cat".to_string(),
            ..Executables::default()
        };
        let reconciler = Reconciler::new(ReconcilerKind::Qmc, &executables, 0, Some(Duration::from_secs(10)));
        let weights: QuartetWeights<Group> = [crate::tree::test_util::groups("((0,1),(2,3));")]
            .into_iter()
            .collect();
        let answer = reconciler.resolve(&Evidence::Quartets(weights), 0).unwrap();
        assert_eq!(answer, "1:0,1|2,3");
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout() {
        let err = run_program("sleep", &["5".to_string()], None, None, Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, SuperfineError::Timeout { limit, .. } if limit == Duration::from_millis(100)));
        assert_eq!(err.to_string(), "sleep did not finish within 100ms");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_scratch_dir_removed() {
        let path = {
            let dir = ScratchDir::new("test").unwrap();
            fs::write(dir.path().join("f"), "x").unwrap();
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
