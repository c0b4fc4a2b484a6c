//! Matrix representation (MRP) of a set of trees.
//!
//! # Overview
//! Each bipartition of each tree becomes one binary character: taxa on the
//! first side get `0`, taxa on the second side `1`, and taxa the tree does
//! not contain are missing.
//!
//! ```text
//! Tree 1: ((A,B),(C,D))      Tree 2: ((A,C),E,(D,F))
//!
//!        AB|CD  AC|DEF  ACE|DF
//!   A      0      0       0
//!   B      0      ?       ?
//!   C      1      0       0
//!   D      1      1       1
//!   E      ?      1       0
//!   F      ?      1       1
//! ```
//!
//! The matrix feeds the parsimony search (as a Nexus file with a PAUP*
//! ratchet block) and the likelihood search (as a Phylip alignment).

use std::fmt::Write as _;
use std::io::{self, Write};

use rand::seq::index;
use rand::Rng;

use crate::tree::{Label, Tree};

/// Layout of a written matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixFormat {
    /// `#NEXUS` with a taxa block and a characters block
    Nexus,
    /// Sequential Phylip: `ntax nchar` header, then `taxon sites` rows
    Phylip,
    /// `>taxon` header lines followed by the sites
    Fasta,
}

/// Symbols used for the two sides of a character and for missing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub zero: char,
    pub one: char,
    pub missing: char,
}

impl Encoding {
    /// `0` / `1` / `?`, what parsimony tools expect.
    pub const BINARY: Encoding = Encoding {
        zero: '0',
        one: '1',
        missing: '?',
    };

    /// `A` / `C` / `-`, for nucleotide-only likelihood tools.
    pub const NUCLEOTIDE: Encoding = Encoding {
        zero: 'A',
        one: 'C',
        missing: '-',
    };
}

/// Binary characters, one column per bipartition of each input tree.
#[derive(Debug, Clone)]
pub struct CharacterMatrix<L> {
    taxa: Vec<L>,
    /// `columns[c][t]` is the state of taxon `t` for character `c`
    columns: Vec<Vec<Option<bool>>>,
}

impl<L: Label> CharacterMatrix<L> {
    pub fn from_trees(trees: &[Tree<L>]) -> Self {
        let mut taxa: Vec<L> = trees.iter().flat_map(|t| t.taxa()).collect();
        taxa.sort();
        taxa.dedup();

        let mut columns = Vec::new();
        for tree in trees {
            for bp in tree.bipartitions() {
                let (zeros, ones) = bp.sides();
                let column = taxa
                    .iter()
                    .map(|taxon| {
                        let left = zeros.binary_search(taxon).is_ok();
                        let right = ones.binary_search(taxon).is_ok();
                        match (left, right) {
                            (true, false) => Some(false),
                            (false, true) => Some(true),
                            _ => None,
                        }
                    })
                    .collect();
                columns.push(column);
            }
        }
        CharacterMatrix { taxa, columns }
    }

    pub fn taxa(&self) -> &[L] {
        &self.taxa
    }

    pub fn num_taxa(&self) -> usize {
        self.taxa.len()
    }

    /// Number of characters (sites).
    pub fn num_sites(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty() || self.columns.is_empty()
    }

    /// The sites of taxon `t` as a string.
    pub fn row(&self, t: usize, encoding: Encoding) -> String {
        self.columns
            .iter()
            .map(|column| match column[t] {
                Some(false) => encoding.zero,
                Some(true) => encoding.one,
                None => encoding.missing,
            })
            .collect()
    }

    pub fn write<W: Write>(&self, out: &mut W, format: MatrixFormat, encoding: Encoding) -> io::Result<()> {
        out.write_all(self.render(format, encoding).as_bytes())
    }

    pub fn render(&self, format: MatrixFormat, encoding: Encoding) -> String {
        let mut s = String::new();
        // writing to a String cannot fail
        let _ = match format {
            MatrixFormat::Nexus => self.render_nexus(&mut s, encoding),
            MatrixFormat::Phylip => self.render_phylip(&mut s, encoding),
            MatrixFormat::Fasta => self.render_fasta(&mut s, encoding),
        };
        s
    }

    fn render_nexus(&self, s: &mut String, encoding: Encoding) -> std::fmt::Result {
        let labels: Vec<String> = self.taxa.iter().map(|t| t.to_string()).collect();
        writeln!(s, "#NEXUS")?;
        writeln!(s, "begin taxa;")?;
        writeln!(s, "\tdimensions ntax={};", self.num_taxa())?;
        writeln!(s, "\ttaxlabels {};", labels.join(" "))?;
        writeln!(s, "end;")?;
        writeln!(s, "begin characters;")?;
        writeln!(
            s,
            "\tdimensions newtaxa ntax = {} nchar = {};",
            self.num_taxa(),
            self.num_sites()
        )?;
        writeln!(s, "\tformat missing = {};", encoding.missing)?;
        writeln!(s, "\tmatrix")?;
        for (t, label) in labels.iter().enumerate() {
            writeln!(s, "\t'{}'\t{}", label, self.row(t, encoding))?;
        }
        writeln!(s, ";\nend;")
    }

    fn render_phylip(&self, s: &mut String, encoding: Encoding) -> std::fmt::Result {
        writeln!(s, "{} {}", self.num_taxa(), self.num_sites())?;
        for (t, taxon) in self.taxa.iter().enumerate() {
            writeln!(s, "{} {}", taxon, self.row(t, encoding))?;
        }
        Ok(())
    }

    fn render_fasta(&self, s: &mut String, encoding: Encoding) -> std::fmt::Result {
        for (t, taxon) in self.taxa.iter().enumerate() {
            writeln!(s, ">{}\n{}", taxon, self.row(t, encoding))?;
        }
        Ok(())
    }
}

/// PAUP* commands for a ratcheted parsimony search.
///
/// # Algorithm
/// 1. One heuristic search from a random addition sequence
/// 2. `iterations` times: upweight a random `upweight` fraction of the
///    characters, search from the current tree, reset weights, search again
/// 3. Keep the best trees and write strict, majority and greedy consensus
///
/// Output files, all named after `prefix`: `.log`, `.tre` (all best trees),
/// `.tre.nex`, `.smrp`, `.mmrp` and `.gmrp`.
#[derive(Debug, Clone)]
pub struct RatchetScript {
    pub prefix: String,
    pub iterations: usize,
    pub upweight: f64,
    pub weight: u32,
}

impl RatchetScript {
    pub fn new(prefix: impl Into<String>, iterations: usize) -> Self {
        RatchetScript {
            prefix: prefix.into(),
            iterations,
            upweight: 0.25,
            weight: 2,
        }
    }

    pub fn tree_file(&self) -> String {
        format!("{}.tre", self.prefix)
    }

    pub fn greedy_file(&self) -> String {
        format!("{}.gmrp", self.prefix)
    }

    /// The matrix followed by the PAUP* block.
    pub fn render<L: Label, R: Rng>(&self, matrix: &CharacterMatrix<L>, rng: &mut R) -> String {
        let num_chars = matrix.num_sites();
        let selected = ((num_chars as f64) * self.upweight) as usize;
        let seed: u32 = rng.gen_range(0..=10000);
        let tree_file = self.tree_file();

        let mut lines = vec![matrix.render(MatrixFormat::Nexus, Encoding::BINARY)];
        lines.push(format!(
            "[Ratchet parameters: NumChar = {num_chars}  Inclusion Percentage = {:.6} ({selected} characters)  Replicates = {}  Final search = no]\n",
            self.upweight, self.iterations
        ));
        lines.extend([
            "begin paup;".to_string(),
            "\tset autoclose = yes warntree = no warnreset = no notifybeep = no monitor = yes taxlabels = full;".to_string(),
            format!("\tlog file = {}.log replace;", self.prefix),
            "\tset criterion = parsimony;".to_string(),
            "\tpset collapse = no;".to_string(),
            "\n\t[!][!*** Replicate 0 (initial tree) ***]".to_string(),
            format!("\thsearch addseq = random nreps = 1 rseed = {seed} swap = TBR multrees = no dstatus = 60;"),
            format!("\tsavetrees file = {tree_file} format = altnex replace;"),
            format!("\tsavetrees file = {tree_file}.nex format = nexus replace;\n"),
        ]);

        for replicate in 1..=self.iterations {
            let mut picked: Vec<usize> = index::sample(rng, num_chars, selected)
                .into_iter()
                .map(|i| i + 1)
                .collect();
            picked.sort_unstable();
            let picked: Vec<String> = picked.iter().map(|i| i.to_string()).collect();
            lines.extend([
                format!("\n\t[!][!*** Replicate #{replicate} ***]"),
                format!("\tweights {}: {};", self.weight, picked.join(" ")),
                "\thsearch start = current swap = TBR multrees = no dstatus = 60;".to_string(),
                "\tweights 1: all;".to_string(),
                "\thsearch start = current swap = TBR multrees = no dstatus = 60;".to_string(),
                format!("\tsavetrees file = {tree_file} format = altnex append;"),
                format!("\tsavetrees file = {tree_file}.nex format = nexus append;\n"),
            ]);
        }

        lines.extend([
            "\n\t[!][!*** Determining consensus trees ***]".to_string(),
            format!("\tset MaxTrees = {};", 2 * self.iterations + 1),
            format!("\tgettrees file = {tree_file} allblocks = yes warntree = no;"),
            "\tset criterion = parsimony;".to_string(),
            "\tcondense collapse = no deldupes = yes;".to_string(),
            "\tfilter best = yes;".to_string(),
            format!("\tcontree all / strict = yes treefile = {}.smrp replace;", self.prefix),
            format!("\tcontree all / majrule = yes strict = no treefile = {}.mmrp replace;", self.prefix),
            format!(
                "\tcontree all / majrule = yes strict = no le50 = yes treefile = {} replace;",
                self.greedy_file()
            ),
            format!("\tsavetrees file = {tree_file} replace = yes format = altnex;"),
            "\n\tlog stop;".to_string(),
            "end;\n".to_string(),
            "quit warntsave = no;".to_string(),
        ]);
        lines.join("\n")
    }
}

/// Consensus tree from a PAUP* `contree` file: the text from the first `(`
/// of the last line starting with a tab and `tree`.
pub fn read_consensus_tree(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter(|line| line.starts_with("\ttree"))
        .filter_map(|line| line.find('(').map(|i| line[i..].trim().to_string()))
        .last()
}

/// Trees of an `altnex` tree file: lines starting with `tree`, with the text
/// after the `]` of the rooting comment.
pub fn read_ratchet_trees(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("tree") || line.starts_with("Tree") || line.starts_with("TREE"))
        .filter_map(|line| line.split_once(']').map(|(_, tree)| tree.trim().to_string()))
        .filter(|tree| !tree.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TaxonId;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn parse(newick: &str) -> Tree<TaxonId> {
        Tree::from_newick(newick).unwrap()
    }

    fn sample_matrix() -> CharacterMatrix<TaxonId> {
        CharacterMatrix::from_trees(&[parse("((A,B),(C,D));"), parse("((A,C),E,(D,F));")])
    }

    #[test]
    fn test_columns() {
        let matrix = sample_matrix();
        assert_eq!(matrix.num_taxa(), 6);
        // one split in tree 1, two in tree 2
        assert_eq!(matrix.num_sites(), 3);

        let rows: Vec<String> = (0..6).map(|t| matrix.row(t, Encoding::BINARY)).collect();
        // tree 2 splits sorted: {A,C}|{D,E,F} then {A,C,E}|{D,F}
        assert_eq!(rows, vec!["000", "0??", "100", "111", "?10", "?11"]);
    }

    #[test]
    fn test_empty_matrix() {
        let matrix = CharacterMatrix::from_trees(&[parse("(A,B,C,D);")]);
        assert_eq!(matrix.num_sites(), 0);
        assert!(matrix.is_empty());
        assert!(CharacterMatrix::<TaxonId>::from_trees(&[]).is_empty());
    }

    #[test]
    fn test_formats() {
        let matrix = CharacterMatrix::from_trees(&[parse("((A,B),(C,D));")]);
        assert_eq!(
            matrix.render(MatrixFormat::Phylip, Encoding::NUCLEOTIDE),
            "4 1\nA A\nB A\nC C\nD C\n"
        );
        assert_eq!(
            matrix.render(MatrixFormat::Fasta, Encoding::BINARY),
            ">A\n0\n>B\n0\n>C\n1\n>D\n1\n"
        );
        let nexus = matrix.render(MatrixFormat::Nexus, Encoding::BINARY);
        assert!(nexus.starts_with("#NEXUS\nbegin taxa;\n\tdimensions ntax=4;\n\ttaxlabels A B C D;"));
        assert!(nexus.contains("\tdimensions newtaxa ntax = 4 nchar = 1;\n\tformat missing = ?;\n\tmatrix\n"));
        assert!(nexus.contains("\t'C'\t1\n"));
        assert!(nexus.ends_with(";\nend;\n"));
    }

    #[test]
    fn test_ratchet_script() {
        let matrix = CharacterMatrix::from_trees(&[
            parse("((A,B),(C,D),(E,F));"),
            parse("((A,C),(B,D),(E,F));"),
        ]);
        let script = RatchetScript::new("/tmp/run", 3);
        let mut rng = SmallRng::seed_from_u64(7);
        let text = script.render(&matrix, &mut rng);

        assert!(text.starts_with("#NEXUS"));
        assert!(text.contains("\tlog file = /tmp/run.log replace;"));
        assert_eq!(text.matches("[!][!*** Replicate #").count(), 3);
        // 6 characters, 25% upweighted
        assert!(text.contains("(1 characters)"));
        assert_eq!(text.matches("\tweights 2: ").count(), 3);
        assert!(text.contains("\tset MaxTrees = 7;"));
        assert!(text.contains("le50 = yes treefile = /tmp/run.gmrp replace;"));
        assert!(text.ends_with("quit warntsave = no;"));

        // same seed, same script
        let again = script.render(&matrix, &mut SmallRng::seed_from_u64(7));
        assert_eq!(text, again);
    }

    #[test]
    fn test_read_paup_outputs() {
        let contree = "#NEXUS\nbegin trees;\n\ttree 'GREEDY' = [&U] ((0,1),2,3);\nend;\n";
        assert_eq!(read_consensus_tree(contree), Some("((0,1),2,3);".to_string()));
        assert_eq!(read_consensus_tree("#NEXUS\n"), None);

        let trees = "#NEXUS\nbegin trees;\ntree PAUP_1 = [&U] ((0,1),(2,3));\ntree PAUP_2 = [&U] ((0,2),(1,3));\nend;\n";
        assert_eq!(
            read_ratchet_trees(trees),
            vec!["((0,1),(2,3));", "((0,2),(1,3));"]
        );
    }
}
