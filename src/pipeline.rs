//! The refinement pass: merge the sources, then resolve every polytomy of the
//! merged tree with a reconciler.
//!
//! # Overview
//! ```text
//! sources ──► strict consensus merge ──► SCM tree
//!                                          │ find polytomies
//!                  ┌───────────────────────┴───────────────────────┐
//!             polytomy 0              polytomy 1      ...     polytomy k     (rayon)
//!   relabel + collapse sources   ──► evidence ──► resolver ──► bipartitions
//!                  └───────────────────────┬───────────────────────┘
//!                                          │ expand, one polytomy at a time
//!                                          ▼
//!                                   refined supertree + ResolutionReport
//! ```
//!
//! Resolving a polytomy only reads the supertree, so all polytomies are
//! resolved in parallel. Expansion then runs sequentially: each polytomy only
//! gains new children, so the node ids collected before stay valid.
//!
//! A polytomy that cannot be resolved (no informative source, a garbled or
//! late resolver answer) is recorded in the report and left as it is. Fatal
//! errors, such as a resolver that cannot be launched, end the pass.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::collapse::collapse;
use crate::error::Result;
use crate::expand::{expand, implied_bipartitions};
use crate::merger::strict_consensus_merge;
use crate::polytomy::{find_polytomies, Relabeling};
use crate::reconciler::{parse_answer, Evidence, EvidenceKind, Executables, Reconciler, ReconcilerKind, Resolve};
use crate::tree::{NodeId, TaxonId, Tree};

/// Everything a run needs besides the source trees.
#[derive(Debug, Clone)]
pub struct SuperfineConfig {
    pub reconciler: ReconcilerKind,
    /// Ratchet iterations for the parsimony reconcilers
    pub iterations: usize,
    /// Bound on each resolver call; `None` waits forever
    pub timeout: Option<Duration>,
    /// Worker threads for the resolution pass; 0 lets rayon decide
    pub threads: usize,
    pub seed: u64,
    pub executables: Executables,
}

impl Default for SuperfineConfig {
    fn default() -> Self {
        SuperfineConfig {
            reconciler: ReconcilerKind::Qmc,
            iterations: 100,
            timeout: None,
            threads: 0,
            seed: 0,
            executables: Executables::default(),
        }
    }
}

impl SuperfineConfig {
    /// The reconciler this configuration selects.
    pub fn build_reconciler(&self) -> Reconciler {
        Reconciler::new(self.reconciler, &self.executables, self.iterations, self.timeout)
    }
}

/// What happened to one polytomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolytomyStatus {
    /// `added` new internal nodes were inserted below it
    Resolved { added: usize },
    /// Fewer than 4 distinct groups in every source tree
    Uninformative,
    /// The resolver gave no usable answer
    Failed(String),
    /// The answer did not add anything
    NoNewBipartitions,
}

impl PolytomyStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, PolytomyStatus::Resolved { .. })
    }
}

/// Outcome of a refinement pass, one entry per polytomy in discovery order.
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    pub statuses: Vec<(NodeId, PolytomyStatus)>,
}

impl ResolutionReport {
    pub fn resolved(&self) -> usize {
        self.statuses.iter().filter(|(_, s)| s.is_resolved()).count()
    }

    pub fn unresolved(&self) -> usize {
        self.statuses.len() - self.resolved()
    }
}

impl fmt::Display for ResolutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = |n: usize| if n == 1 { "polytomy" } else { "polytomies" };
        let (ok, failed) = (self.resolved(), self.unresolved());
        writeln!(f, "{} {} successfully resolved.", ok, noun(ok))?;
        write!(f, "{} {} could *not* be resolved.", failed, noun(failed))
    }
}

/// Result of a full run.
#[derive(Debug, Clone)]
pub struct SuperfineRun {
    /// The strict consensus merger tree, before refinement
    pub scm: Tree<TaxonId>,
    /// The refined supertree
    pub tree: Tree<TaxonId>,
    pub report: ResolutionReport,
}

/// Merge `sources` and refine the merged tree with the configured reconciler.
pub fn superfine(sources: Vec<Tree<TaxonId>>, config: &SuperfineConfig) -> Result<SuperfineRun> {
    let reconciler = config.build_reconciler();
    superfine_with(sources, &reconciler, config)
}

/// Same as [`superfine`], with any resolver.
pub fn superfine_with<R: Resolve + Sync>(
    sources: Vec<Tree<TaxonId>>,
    resolver: &R,
    config: &SuperfineConfig,
) -> Result<SuperfineRun> {
    let scm = strict_consensus_merge(sources.clone())?;
    let mut tree = scm.clone();
    let report = refine(&mut tree, &sources, resolver, config)?;
    Ok(SuperfineRun { scm, tree, report })
}

/// What to do with one polytomy once its resolver has answered.
enum Plan {
    Expand(Vec<Vec<NodeId>>),
    Skip(PolytomyStatus),
}

/// Resolve every polytomy of `supertree` in place.
///
/// # Errors
/// Only fatal errors are returned; per-polytomy failures end up in the
/// report.
pub fn refine<R: Resolve + Sync>(
    supertree: &mut Tree<TaxonId>,
    sources: &[Tree<TaxonId>],
    resolver: &R,
    config: &SuperfineConfig,
) -> Result<ResolutionReport> {
    let polytomies: Vec<NodeId> = find_polytomies(supertree).collect();
    info!(
        "{} polytomies to resolve with {}",
        polytomies.len(),
        resolver.name()
    );

    let plans = {
        let tree: &Tree<TaxonId> = supertree;
        let plan_all = || {
            polytomies
                .par_iter()
                .enumerate()
                .map(|(i, &polytomy)| {
                    let seed = config.seed.wrapping_add(i as u64);
                    plan_polytomy(tree, sources, resolver, polytomy, seed)
                })
                .collect::<Result<Vec<Plan>>>()
        };
        match rayon::ThreadPoolBuilder::new().num_threads(config.threads).build() {
            Ok(pool) => pool.install(plan_all)?,
            Err(e) => {
                warn!("could not start {} worker threads ({}), using the global pool", config.threads, e);
                plan_all()?
            }
        }
    };

    let mut report = ResolutionReport::default();
    for (polytomy, plan) in polytomies.into_iter().zip(plans) {
        let status = match plan {
            Plan::Expand(bipartitions) => match expand(supertree, polytomy, bipartitions) {
                0 => PolytomyStatus::NoNewBipartitions,
                added => PolytomyStatus::Resolved { added },
            },
            Plan::Skip(status) => status,
        };
        debug!("polytomy {}: {:?}", polytomy, status);
        report.statuses.push((polytomy, status));
    }
    info!("{} of {} polytomies resolved", report.resolved(), report.statuses.len());
    Ok(report)
}

fn plan_polytomy<R: Resolve>(
    supertree: &Tree<TaxonId>,
    sources: &[Tree<TaxonId>],
    resolver: &R,
    polytomy: NodeId,
    seed: u64,
) -> Result<Plan> {
    let relabeling = Relabeling::build(supertree, polytomy);
    let collapsed: Vec<_> = sources
        .iter()
        .map(|source| collapse(&relabeling.relabel_tree(source)))
        .filter(|tree| !tree.is_empty())
        .collect();
    debug!(
        "polytomy {} of degree {}: {} informative sources",
        polytomy,
        relabeling.degree(),
        collapsed.len()
    );

    let evidence = match resolver.evidence_kind() {
        EvidenceKind::Quartets => Evidence::Quartets(collapsed.into_iter().collect()),
        EvidenceKind::Trees => Evidence::Trees(collapsed),
    };
    if evidence.is_empty() {
        warn!("polytomy {} left unresolved: no informative source tree", polytomy);
        return Ok(Plan::Skip(PolytomyStatus::Uninformative));
    }

    let answer = resolver
        .resolve(&evidence, seed)
        .and_then(|newick| parse_answer(resolver.name(), &newick))
        .and_then(|answer| implied_bipartitions(&answer, &relabeling));
    match answer {
        Ok(bipartitions) if bipartitions.is_empty() => Ok(Plan::Skip(PolytomyStatus::NoNewBipartitions)),
        Ok(bipartitions) => Ok(Plan::Expand(bipartitions)),
        Err(e) if !e.is_fatal() => {
            warn!("polytomy {} left unresolved: {}", polytomy, e);
            Ok(Plan::Skip(PolytomyStatus::Failed(e.to_string())))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SuperfineError;
    use itertools::Itertools;
    use std::collections::BTreeSet;

    /// Answers with the first evidence tree, as a perfect reconciler would
    /// when all sources agree.
    struct FirstTree;

    impl Resolve for FirstTree {
        fn name(&self) -> &str {
            "first-tree"
        }

        fn evidence_kind(&self) -> EvidenceKind {
            EvidenceKind::Trees
        }

        fn resolve(&self, evidence: &Evidence, _seed: u64) -> Result<String> {
            match evidence {
                Evidence::Trees(trees) => Ok(trees[0].to_newick()),
                Evidence::Quartets(_) => panic!("asked for trees"),
            }
        }
    }

    /// Reports the first quartet it is given as a tree.
    struct FirstQuartet;

    impl Resolve for FirstQuartet {
        fn name(&self) -> &str {
            "first-quartet"
        }

        fn evidence_kind(&self) -> EvidenceKind {
            EvidenceKind::Quartets
        }

        fn resolve(&self, evidence: &Evidence, _seed: u64) -> Result<String> {
            match evidence {
                Evidence::Quartets(weights) => {
                    let (quartet, _) = weights.iter().next().unwrap();
                    let [[a, b], [c, d]] = quartet.pairs();
                    Ok(format!("(({a},{b}),({c},{d}));"))
                }
                Evidence::Trees(_) => panic!("asked for quartets"),
            }
        }
    }

    /// Always answers `answer`, or fails to launch.
    struct Fixed {
        answer: Option<&'static str>,
    }

    impl Resolve for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn evidence_kind(&self) -> EvidenceKind {
            EvidenceKind::Trees
        }

        fn resolve(&self, _evidence: &Evidence, _seed: u64) -> Result<String> {
            match self.answer {
                Some(answer) => Ok(answer.to_string()),
                None => Err(SuperfineError::Launch {
                    program: "fixed".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                }),
            }
        }
    }

    fn parse(newick: &str) -> Tree<TaxonId> {
        Tree::from_newick(newick).unwrap()
    }

    fn sequential() -> SuperfineConfig {
        SuperfineConfig {
            threads: 1,
            ..SuperfineConfig::default()
        }
    }

    #[test]
    fn test_refine_with_quartets() {
        let mut tree = parse("(A,B,C,D);");
        let sources = vec![parse("((A,B),(C,D));")];
        let report = refine(&mut tree, &sources, &FirstQuartet, &sequential()).unwrap();
        assert_eq!(report.statuses.len(), 1);
        assert_eq!(report.statuses[0].1, PolytomyStatus::Resolved { added: 1 });
        assert_eq!(tree.to_newick(), "(C,D,(A,B));");
    }

    #[test]
    fn test_uninformative_polytomy() {
        let mut tree = parse("(A,B,C,D,E);");
        let sources = vec![parse("(A,B,C);"), parse("((A,B),(X,Y));")];
        let report = refine(&mut tree, &sources, &FirstTree, &sequential()).unwrap();
        assert_eq!(report.statuses[0].1, PolytomyStatus::Uninformative);
        assert_eq!(report.unresolved(), 1);
        assert_eq!(tree.to_newick(), "(A,B,C,D,E);");
    }

    #[test]
    fn test_failures_are_per_polytomy() {
        let sources = vec![parse("((A,B),(C,D),E);")];

        let mut tree = parse("(A,B,C,D,E);");
        let garbled = Fixed { answer: Some("no tree here") };
        let report = refine(&mut tree, &sources, &garbled, &sequential()).unwrap();
        assert!(matches!(report.statuses[0].1, PolytomyStatus::Failed(_)));
        assert_eq!(tree.to_newick(), "(A,B,C,D,E);");

        let mut tree = parse("(A,B,C,D,E);");
        let unknown = Fixed { answer: Some("((0,9),1,2,3);") };
        let report = refine(&mut tree, &sources, &unknown, &sequential()).unwrap();
        assert!(matches!(report.statuses[0].1, PolytomyStatus::Failed(_)));

        let mut tree = parse("(A,B,C,D,E);");
        let star = Fixed { answer: Some("(0,1,2,3,4);") };
        let report = refine(&mut tree, &sources, &star, &sequential()).unwrap();
        assert_eq!(report.statuses[0].1, PolytomyStatus::NoNewBipartitions);
    }

    #[test]
    fn test_launch_failure_is_fatal() {
        let mut tree = parse("(A,B,C,D,E);");
        let sources = vec![parse("((A,B),(C,D),E);")];
        let err = refine(&mut tree, &sources, &Fixed { answer: None }, &sequential()).unwrap_err();
        assert!(matches!(err, SuperfineError::Launch { .. }));
    }

    #[test]
    fn test_report_summary() {
        let report = ResolutionReport {
            statuses: vec![
                (1, PolytomyStatus::Resolved { added: 2 }),
                (5, PolytomyStatus::Uninformative),
                (9, PolytomyStatus::Failed("timeout".into())),
            ],
        };
        assert_eq!(
            report.to_string(),
            "1 polytomy successfully resolved.\n2 polytomies could *not* be resolved."
        );
    }

    #[test]
    fn test_end_to_end_same_taxa() {
        let sources = vec![
            parse("((A,B),C,(D,E));"),
            parse("((A,B),(C,D),E);"),
            parse("((A,B),(C,E),D);"),
        ];
        let run = superfine_with(sources, &FirstTree, &sequential()).unwrap();
        assert_eq!(find_polytomies(&run.scm).count(), 1);
        assert_eq!(run.report.resolved(), 1);
        let splits: Vec<String> = run.tree.bipartitions().iter().map(|b| b.to_string()).collect();
        assert_eq!(splits, ["A,B|C,D,E", "A,B,C|D,E"]);
    }

    #[test]
    fn test_end_to_end_overlapping_sources() {
        let sources = vec![
            parse("((A,B),(C,D),E);"),
            parse("((A,B),(C,E),F);"),
            parse("((A,F),(B,C),D);"),
        ];
        let union: BTreeSet<TaxonId> = sources.iter().flat_map(|t| t.taxa()).collect();
        for threads in [1, 3] {
            let config = SuperfineConfig {
                threads,
                ..SuperfineConfig::default()
            };
            let run = superfine_with(sources.clone(), &FirstTree, &config).unwrap();
            assert_eq!(run.tree.taxa(), union);
            assert_eq!(run.tree.all_leaves().len(), union.len());
            assert_eq!(run.report.statuses.len(), find_polytomies(&run.scm).count());
            for (x, y) in run.tree.bipartitions().iter().tuple_combinations() {
                assert!(x.is_compatible(y));
            }
            // refinement only adds splits
            for split in run.scm.bipartitions() {
                assert!(run.tree.bipartitions().contains(&split));
            }
        }
    }
}
