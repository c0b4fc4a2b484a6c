use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Result, SuperfineError};
use crate::matrix::{CharacterMatrix, Encoding, MatrixFormat};
use crate::tree::{Label, TaxonId, Tree};

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

/// Remove `[...]` comments such as `[&U]` or `[&rate=0.1]`.
///
/// Brackets inside quoted labels are kept.
fn strip_comments(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut depth = 0usize;
    let mut quoted = false;

    for ch in newick.chars() {
        match ch {
            '\'' if depth == 0 => {
                quoted = !quoted;
                result.push(ch);
            }
            '[' if !quoted => depth += 1,
            ']' if !quoted && depth > 0 => depth -= 1,
            _ if depth == 0 => result.push(ch),
            _ => {}
        }
    }
    result
}

/// Drop a length on the root edge, e.g. the `:0.0` some tools append.
fn strip_root_length(newick: &str) -> &str {
    match newick.rfind(')') {
        Some(pos) if newick[pos + 1..].contains(':') => {
            let tail = &newick[pos + 1..];
            let cut = tail.find(':').map_or(newick.len(), |i| pos + 1 + i);
            &newick[..cut]
        }
        _ => newick,
    }
}

/// Parse every `;`-terminated newick tree of `text`.
pub fn parse_trees(text: &str) -> Result<Vec<Tree<TaxonId>>> {
    strip_comments(text)
        .split(';')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(|piece| Tree::from_newick(strip_root_length(piece)))
        .collect()
}

/// Whole content of a file, decompressed when the name ends in `.gz`.
pub fn read_text<P: AsRef<Path>>(path: P) -> Result<String> {
    let p = path.as_ref();
    let file = File::open(p).map_err(|e| SuperfineError::io(p, e))?;
    let mut content = String::new();
    let read = if is_gz(p) {
        GzDecoder::new(file).read_to_string(&mut content)
    } else {
        io::BufReader::new(file).read_to_string(&mut content)
    };
    read.map_err(|e| SuperfineError::io(p, e))?;
    Ok(content)
}

/// Read the source trees of a run.
pub fn read_source_trees<P: AsRef<Path>>(path: P) -> Result<Vec<Tree<TaxonId>>> {
    let trees = parse_trees(&read_text(path.as_ref())?)?;
    if trees.is_empty() {
        return Err(SuperfineError::NoTrees);
    }
    Ok(trees)
}

/// Open `path` for writing.
/// If `path` ends with `.gz`, the output is gzip-compressed.
/// If `path` equals `-`, the output goes to stdout (uncompressed).
fn open_writer(p: &Path) -> Result<Box<dyn Write>> {
    if p.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout().lock())));
    }
    let f = File::create(p).map_err(|e| SuperfineError::io(p, e))?;
    if is_gz(p) {
        Ok(Box::new(BufWriter::new(GzEncoder::new(f, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(f)))
    }
}

/// Write `text` followed by a newline.
pub fn write_text<P: AsRef<Path>>(path: P, text: &str) -> Result<()> {
    let p = path.as_ref();
    let mut out = open_writer(p)?;
    writeln!(out, "{text}")
        .and_then(|_| out.flush())
        .map_err(|e| SuperfineError::io(p, e))
}

pub fn write_tree<P: AsRef<Path>, L: Label>(path: P, tree: &Tree<L>) -> Result<()> {
    write_text(path, &tree.to_newick())
}

/// Write the MRP matrix of `trees` (0/1, `?` for missing).
pub fn write_matrix<P: AsRef<Path>, L: Label>(path: P, trees: &[Tree<L>], format: MatrixFormat) -> Result<()> {
    let p = path.as_ref();
    let matrix = CharacterMatrix::from_trees(trees);
    let mut out = open_writer(p)?;
    matrix
        .write(&mut out, format, Encoding::BINARY)
        .and_then(|_| out.flush())
        .map_err(|e| SuperfineError::io(p, e))
}

/// `<base>.<kind>.<suffix>` where `<base>` is the input without its last
/// extension, e.g. `trees.nwk` gives `trees.scmTree.out`.
pub fn suffixed_path<P: AsRef<Path>>(input: P, kind: &str, suffix: &str) -> PathBuf {
    let mut name = input.as_ref().with_extension("").into_os_string();
    name.push(format!(".{kind}.{suffix}"));
    PathBuf::from(name)
}
