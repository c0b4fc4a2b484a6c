use clap::{Parser, ValueEnum};
use log::{LevelFilter, Log, Metadata, Record};
use rust_python_superfine::io::{read_source_trees, suffixed_path, write_matrix, write_tree};
use rust_python_superfine::matrix::MatrixFormat;
use rust_python_superfine::merger::strict_consensus_merge;
use rust_python_superfine::metrics::{resolution, sum_errors_across_sources};
use rust_python_superfine::pipeline::{refine, SuperfineConfig};
use rust_python_superfine::polytomy::find_polytomies;
use rust_python_superfine::reconciler::{Executables, ReconcilerKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Build a supertree from overlapping source trees: strict consensus merger,
/// then resolve its polytomies with an external reconciler.
#[derive(Parser, Debug)]
#[command(name = "superfine", version, about = "SuperFine supertrees from newick source trees")]
struct Args {
    /// File of semicolon-terminated newick source trees (optionally .gz)
    input: PathBuf,

    /// Reconciler used to resolve each polytomy
    #[arg(short = 'r', long = "reconcile", value_enum, default_value_t = ReconcilerArg::Qmc)]
    reconcile: ReconcilerArg,

    /// Ratchet iterations for the MRP reconcilers
    #[arg(short = 'n', long = "num-iters", default_value_t = 100)]
    num_iters: usize,

    /// Write <base>.scmTree.<SUFFIX> and <base>.SuperFineTree.<SUFFIX>, where
    /// <base> is the input path without its last extension
    #[arg(short = 'w', long = "write")]
    write: Option<String>,

    /// Output path for the final tree (`-` for stdout, `.gz` to compress)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Seconds to wait for each reconciler call (0 = no limit)
    #[arg(long = "timeout", default_value_t = 0)]
    timeout: u64,

    /// Worker threads for resolving polytomies (0 = all cores)
    #[arg(long = "threads", default_value_t = 0)]
    threads: usize,

    /// Seed for ratchet reweighting and random tree choice
    #[arg(long = "seed", default_value_t = 0)]
    seed: u64,

    /// Quartet MaxCut executable
    #[arg(long = "qmc-bin", default_value = "find-cut")]
    qmc_bin: String,

    /// PAUP* executable
    #[arg(long = "paup-bin", default_value = "paup")]
    paup_bin: String,

    /// FastTree executable
    #[arg(long = "fasttree-bin", default_value = "FastTree")]
    fasttree_bin: String,

    /// RAxML executable
    #[arg(long = "raxml-bin", default_value = "raxmlHPC")]
    raxml_bin: String,

    /// Also write the MRP matrix of the source trees
    #[arg(long = "matrix")]
    matrix: Option<PathBuf>,

    /// Layout of the `--matrix` file
    #[arg(long = "matrix-format", value_enum, default_value_t = MatrixFormatArg::Nexus)]
    matrix_format: MatrixFormatArg,

    /// Report FP / FN / RF against the source trees and the resolution
    #[arg(long = "score", default_value_t = false)]
    score: bool,

    /// Quiet mode: only errors on stderr
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,

    /// Verbose mode: per-polytomy debug output
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ReconcilerArg { Qmc, Gmrp, Rmrp, Fml, Rml }

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MatrixFormatArg { Nexus, Phylip, Fasta }

impl From<MatrixFormatArg> for MatrixFormat {
    fn from(arg: MatrixFormatArg) -> Self {
        match arg {
            MatrixFormatArg::Nexus => MatrixFormat::Nexus,
            MatrixFormatArg::Phylip => MatrixFormat::Phylip,
            MatrixFormatArg::Fasta => MatrixFormat::Fasta,
        }
    }
}

impl From<ReconcilerArg> for ReconcilerKind {
    fn from(arg: ReconcilerArg) -> Self {
        match arg {
            ReconcilerArg::Qmc => ReconcilerKind::Qmc,
            ReconcilerArg::Gmrp => ReconcilerKind::Gmrp,
            ReconcilerArg::Rmrp => ReconcilerKind::Rmrp,
            ReconcilerArg::Fml => ReconcilerKind::Fml,
            ReconcilerArg::Rml => ReconcilerKind::Rml,
        }
    }
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    let args = Args::parse();
    let level = match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::Error,
        (false, true) => LevelFilter::Debug,
        (false, false) => LevelFilter::Warn,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
    let show = !args.quiet;

    // Read source trees
    let t0 = Instant::now();
    let sources = match read_source_trees(&args.input) {
        Ok(trees) => trees,
        Err(e) => {
            eprintln!("No trees parsed from {:?}: {e}", args.input);
            std::process::exit(2);
        }
    };
    let read_s = t0.elapsed().as_secs_f64();
    log_if(show, format!("Reading in source trees {read_s:.3}s"));
    log_if(show, format!("Read in {} source trees", sources.len()));

    if let Some(path) = &args.matrix {
        if let Err(e) = write_matrix(path, &sources, args.matrix_format.into()) {
            eprintln!("Failed to write matrix {:?}: {e}", path);
            std::process::exit(4);
        }
    }

    // Strict consensus merger
    let t1 = Instant::now();
    let scm = match strict_consensus_merge(sources.clone()) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("Strict consensus merger failed: {e}");
            std::process::exit(3);
        }
    };
    let scm_s = t1.elapsed().as_secs_f64();
    log_if(show, format!("Strict consensus merger {scm_s:.3}s"));
    log_if(
        show,
        format!(
            "SCM tree has {} taxa and {} polytomies",
            scm.taxa().len(),
            find_polytomies(&scm).count()
        ),
    );

    // Resolve polytomies
    let config = SuperfineConfig {
        reconciler: args.reconcile.into(),
        iterations: args.num_iters,
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        threads: args.threads,
        seed: args.seed,
        executables: Executables {
            qmc: args.qmc_bin.clone(),
            paup: args.paup_bin.clone(),
            fasttree: args.fasttree_bin.clone(),
            raxml: args.raxml_bin.clone(),
        },
    };
    let reconciler = config.build_reconciler();
    let t2 = Instant::now();
    let mut tree = scm.clone();
    let report = match refine(&mut tree, &sources, &reconciler, &config) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Resolving polytomies failed: {e}");
            std::process::exit(5);
        }
    };
    let refine_s = t2.elapsed().as_secs_f64();
    log_if(show, format!("Resolving polytomies using {} {refine_s:.3}s", args.reconcile.name()));
    log_if(show, report.to_string());

    // Write trees
    let t3 = Instant::now();
    let mut targets: Vec<(PathBuf, &_)> = Vec::new();
    if let Some(suffix) = &args.write {
        targets.push((suffixed_path(&args.input, "scmTree", suffix), &scm));
        targets.push((suffixed_path(&args.input, "SuperFineTree", suffix), &tree));
    }
    match (&args.output, &args.write) {
        (Some(path), _) => targets.push((path.clone(), &tree)),
        (None, None) => targets.push((PathBuf::from("-"), &tree)),
        (None, Some(_)) => {}
    }
    for (path, t) in &targets {
        if let Err(e) = write_tree(path, *t) {
            eprintln!("Failed to write output {:?}: {e}", path);
            std::process::exit(4);
        }
        log_write_done(show, path, t3.elapsed().as_secs_f64());
    }

    if args.score {
        match sum_errors_across_sources(&sources, &tree) {
            Ok(counts) => {
                let rates = counts.rates();
                let fmt = |r: Option<f64>| r.map_or("NA".to_string(), |v| format!("{v:.4}"));
                eprintln!(
                    "FN {} FP {} RF {} (rates FN {} FP {} RF {})",
                    counts.false_negatives,
                    counts.false_positives,
                    counts.rf(),
                    fmt(rates.fn_),
                    fmt(rates.fp),
                    fmt(rates.rf)
                );
                eprintln!("Resolution {:.4}", resolution(&tree));
            }
            Err(e) => eprintln!("Scoring failed: {e}"),
        }
    }
}

impl ReconcilerArg {
    fn name(&self) -> &'static str {
        ReconcilerKind::from(*self).name()
    }
}

fn log_if(show: bool, msg: String) {
    if show { eprintln!("{}", msg); }
}

fn log_write_done(show: bool, output: &Path, secs: f64) {
    if !show { return; }
    let is_stdout = output.as_os_str() == "-";
    if is_stdout {
        eprintln!("Writing to stdout {secs:.3}s");
    } else {
        eprintln!("Writing to {} {secs:.3}s", output.display());
    }
}
