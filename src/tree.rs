//! Arena-backed tree model used throughout the refinement pipeline.
//!
//! # Overview
//! A [`Tree`] stores every node in one `Vec`, addressed by a stable
//! [`NodeId`]. Nodes are either leaves (they carry a label) or internal nodes
//! holding an ordered list of outgoing [`Edge`]s. Moving a subtree is a matter
//! of rewiring indices: [`Tree::detach`] removes the edge from the old parent,
//! [`Tree::attach`] adds it under a new one. Nothing is ever copied unless
//! explicitly asked for ([`Tree::restrict`], [`Tree::map_labels`]).
//!
//! Nodes that are no longer reachable from the root simply stay in the arena;
//! every query walks from the root.
//!
//! # Rooting
//! The trees are phylogenetically *unrooted*; the root is an artifact of the
//! in-memory representation. This shows in two places:
//! - [`Tree::degree`] counts the implicit edge to the parent of a non-root node.
//! - [`Tree::internal_edges`] merges the two edges of a binary root into a
//!   single logical edge, so rooting never manufactures a bipartition:
//!
//! ```text
//!          root                      {A,B} | {C,D}
//!         /    \
//!      n1        n2       ==>        one internal edge, not two
//!     /  \      /  \
//!    A    B    C    D
//! ```
//!
//! # Leaf caches
//! The leaf sequence below each node is computed lazily and cached. Any edge
//! mutation clears the cache of the touched node and all of its ancestors.
//!
//! Every walk uses an explicit stack, so deep caterpillars do not exhaust
//! the thread stack.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{self, Display};
use std::hash::Hash;
use std::sync::OnceLock;

use phylotree::tree::Tree as PhyloTree;

use crate::error::{Result, SuperfineError};

/// Index of a node inside a [`Tree`] arena.
pub type NodeId = usize;

/// Taxon identifier of an input tree leaf.
pub type TaxonId = String;

/// Anything that can label a leaf: taxon names, polytomy group ids.
pub trait Label: Clone + Eq + Ord + Hash + Display + Send + Sync {}

impl<T: Clone + Eq + Ord + Hash + Display + Send + Sync> Label for T {}

/// An outgoing edge: the child subtree plus optional support and length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub child: NodeId,
    pub support: Option<f64>,
    pub length: Option<f64>,
}

impl Edge {
    pub fn new(child: NodeId) -> Self {
        Edge {
            child,
            support: None,
            length: None,
        }
    }
}

/// A node of the arena.
#[derive(Debug, Clone)]
pub struct Node<L> {
    id: NodeId,
    label: Option<L>,
    parent: Option<NodeId>,
    edges: Vec<Edge>,
    leaves: OnceLock<Vec<L>>,
}

impl<L> Node<L> {
    fn new(id: NodeId, label: Option<L>) -> Self {
        Node {
            id,
            label,
            parent: None,
            edges: Vec::new(),
            leaves: OnceLock::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> Option<&L> {
        self.label.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

/// A non-trivial split of a leaf set, in canonical form.
///
/// Both sides are sorted and deduplicated, and the smaller side
/// (lexicographically) comes first, so the same split always compares equal
/// regardless of which edge or which direction it was discovered from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bipartition<L> {
    first: Vec<L>,
    second: Vec<L>,
}

impl<L: Label> Bipartition<L> {
    pub fn new(a: impl IntoIterator<Item = L>, b: impl IntoIterator<Item = L>) -> Self {
        let mut a: Vec<L> = a.into_iter().collect();
        let mut b: Vec<L> = b.into_iter().collect();
        a.sort();
        a.dedup();
        b.sort();
        b.dedup();
        if b < a {
            std::mem::swap(&mut a, &mut b);
        }
        Bipartition {
            first: a,
            second: b,
        }
    }

    pub fn sides(&self) -> (&[L], &[L]) {
        (&self.first, &self.second)
    }

    pub fn contains(&self, label: &L) -> bool {
        self.first.binary_search(label).is_ok() || self.second.binary_search(label).is_ok()
    }

    /// Two splits of the same leaf set are compatible when one of the four
    /// side intersections is empty.
    pub fn is_compatible(&self, other: &Bipartition<L>) -> bool {
        let disjoint = |x: &[L], y: &[L]| x.iter().all(|l| y.binary_search(l).is_err());
        disjoint(&self.first, &other.first)
            || disjoint(&self.first, &other.second)
            || disjoint(&self.second, &other.first)
            || disjoint(&self.second, &other.second)
    }
}

impl<L: Display> Display for Bipartition<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |side: &[L]| side.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(",");
        write!(f, "{}|{}", join(&self.first), join(&self.second))
    }
}

/// A phylogenetic tree stored as an arena of nodes.
#[derive(Debug, Clone)]
pub struct Tree<L> {
    nodes: Vec<Node<L>>,
    root: Option<NodeId>,
}

impl<L: Label> Default for Tree<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Label> Tree<L> {
    /// The empty tree: no nodes, no root.
    pub fn new() -> Self {
        Tree {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// A tree made of a single leaf.
    pub fn leaf(label: L) -> Self {
        let mut tree = Tree::new();
        let id = tree.add_leaf(label);
        tree.root = Some(id);
        tree
    }

    // ############################
    // # ADDING AND GETTING NODES #
    // ############################

    /// Add a detached leaf to the arena.
    pub fn add_leaf(&mut self, label: L) -> NodeId {
        self.push(Some(label))
    }

    /// Add a detached internal node to the arena.
    pub fn add_internal(&mut self) -> NodeId {
        self.push(None)
    }

    fn push(&mut self, label: Option<L>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, label));
        id
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Make `id` the root, detaching it from its parent first.
    ///
    /// Everything that was above `id` becomes unreachable.
    pub fn set_root(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent {
            self.detach(parent, id);
        }
        self.root = Some(id);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn node(&self, id: NodeId) -> &Node<L> {
        &self.nodes[id]
    }

    pub fn label(&self, id: NodeId) -> Option<&L> {
        self.nodes[id].label.as_ref()
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].edges.is_empty()
    }

    pub fn edges(&self, id: NodeId) -> &[Edge] {
        &self.nodes[id].edges
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id].edges.iter().map(|e| e.child)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Number of incident edges, counting the implicit edge to the parent of
    /// any non-root node.
    pub fn degree(&self, id: NodeId) -> usize {
        let node = &self.nodes[id];
        node.edges.len() + usize::from(node.parent.is_some())
    }

    /// Find the leaf carrying `label`.
    pub fn find_leaf(&self, label: &L) -> Option<NodeId> {
        let root = self.root?;
        self.preorder(root)
            .into_iter()
            .find(|&id| self.is_leaf(id) && self.label(id) == Some(label))
    }

    // ####################
    // # ALTER THE TREE   #
    // ####################

    /// Attach `child` below `parent` with a bare edge.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.attach_edge(parent, Edge::new(child));
    }

    /// Attach `edge.child` below `parent`, keeping support and length.
    ///
    /// A child still owned by another parent is detached from it first.
    pub fn attach_edge(&mut self, parent: NodeId, edge: Edge) {
        if let Some(old) = self.nodes[edge.child].parent {
            self.detach(old, edge.child);
        }
        if self.root == Some(edge.child) {
            self.root = None;
        }
        self.nodes[edge.child].parent = Some(parent);
        self.nodes[parent].edges.push(edge);
        self.invalidate(parent);
    }

    /// Remove the edge `parent -> child` and return it.
    pub fn detach(&mut self, parent: NodeId, child: NodeId) -> Option<Edge> {
        let index = self.nodes[parent].edges.iter().position(|e| e.child == child)?;
        let edge = self.nodes[parent].edges.remove(index);
        self.nodes[child].parent = None;
        self.invalidate(parent);
        Some(edge)
    }

    /// Turn `id` into a leaf carrying `label`; its former children are dropped.
    pub fn replace_with_leaf(&mut self, id: NodeId, label: L) {
        let edges = std::mem::take(&mut self.nodes[id].edges);
        for edge in edges {
            self.nodes[edge.child].parent = None;
        }
        self.nodes[id].label = Some(label);
        self.invalidate(id);
    }

    /// Clear the leaf cache of `id` and of every ancestor.
    fn invalidate(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(node) = current {
            self.nodes[node].leaves.take();
            current = self.nodes[node].parent;
        }
    }

    // ##############
    // # TRAVERSALS #
    // ##############

    /// Node ids below (and including) `from`, parents before children.
    pub fn preorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].edges.iter().rev().map(|e| e.child));
        }
        order
    }

    /// Node ids below (and including) `from`, children before parents.
    pub fn postorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].edges.iter().map(|e| e.child));
        }
        order.reverse();
        order
    }

    // ##########
    // # LEAVES #
    // ##########

    /// Leaf labels below `id`, in left-to-right order. Labels may repeat in
    /// relabeled trees.
    pub fn leaves(&self, id: NodeId) -> &[L] {
        // fill missing caches bottom-up, stopping at cached subtrees
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            let node = &self.nodes[current];
            if node.leaves.get().is_some() {
                continue;
            }
            if node.edges.is_empty() {
                let _ = node.leaves.set(node.label.iter().cloned().collect());
            } else if expanded {
                let leaves = node
                    .edges
                    .iter()
                    .flat_map(|e| self.cached_leaves(e.child).iter().cloned())
                    .collect();
                let _ = node.leaves.set(leaves);
            } else {
                stack.push((current, true));
                stack.extend(node.edges.iter().map(|e| (e.child, false)));
            }
        }
        self.cached_leaves(id)
    }

    fn cached_leaves(&self, id: NodeId) -> &[L] {
        self.nodes[id].leaves.get().map_or(&[], Vec::as_slice)
    }

    /// Distinct leaf labels below `id`.
    pub fn leaf_set(&self, id: NodeId) -> BTreeSet<L> {
        self.leaves(id).iter().cloned().collect()
    }

    /// All leaf labels of the tree (empty for the empty tree).
    pub fn all_leaves(&self) -> &[L] {
        match self.root {
            Some(root) => self.leaves(root),
            None => &[],
        }
    }

    /// Distinct leaf labels of the whole tree.
    pub fn taxa(&self) -> BTreeSet<L> {
        self.all_leaves().iter().cloned().collect()
    }

    // ##################
    // # BIPARTITIONS   #
    // ##################

    /// First node from the root that actually branches: degree-1 roots are
    /// walked down.
    fn branching_top(&self) -> Option<NodeId> {
        let mut top = self.root?;
        while self.nodes[top].edges.len() == 1 {
            top = self.nodes[top].edges[0].child;
        }
        Some(top)
    }

    /// Internal edges as `(parent, child)` pairs.
    ///
    /// Only edges leading to internal nodes are returned, a binary root's two
    /// edges count once, and edges whose split has fewer than two distinct
    /// labels on either side are dropped.
    pub fn internal_edges(&self) -> Vec<(NodeId, NodeId)> {
        let Some(top) = self.branching_top() else {
            return Vec::new();
        };
        let root_edges = &self.nodes[top].edges;
        let mut candidates = Vec::new();

        match root_edges.len() {
            0 => return Vec::new(),
            2 => {
                let (a, b) = (root_edges[0].child, root_edges[1].child);
                if !self.is_leaf(a) && !self.is_leaf(b) {
                    candidates.push((top, a));
                }
                self.collect_internal(a, &mut candidates);
                self.collect_internal(b, &mut candidates);
            }
            _ => self.collect_internal(top, &mut candidates),
        }

        let total = self.leaf_set(top);
        candidates.retain(|&(_, child)| {
            let side = self.leaf_set(child);
            side.len() >= 2 && total.len() - side.len() >= 2
        });
        candidates
    }

    fn collect_internal(&self, from: NodeId, out: &mut Vec<(NodeId, NodeId)>) {
        for id in self.preorder(from) {
            for edge in &self.nodes[id].edges {
                if !self.is_leaf(edge.child) {
                    out.push((id, edge.child));
                }
            }
        }
    }

    /// The split induced by the edge above `child`, if it is non-trivial.
    pub fn split(&self, child: NodeId) -> Option<Bipartition<L>> {
        let top = self.branching_top()?;
        let side = self.leaf_set(child);
        let rest: BTreeSet<L> = self.leaf_set(top).difference(&side).cloned().collect();
        if side.len() < 2 || rest.len() < 2 {
            return None;
        }
        Some(Bipartition::new(side, rest))
    }

    /// All distinct non-trivial bipartitions, sorted.
    pub fn bipartitions(&self) -> Vec<Bipartition<L>> {
        self.internal_edges()
            .into_iter()
            .filter_map(|(_, child)| self.split(child))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    // ###############
    // # COPYING     #
    // ###############

    /// Same shape, every label passed through `f`.
    pub fn map_labels<M: Label>(&self, mut f: impl FnMut(&L) -> M) -> Tree<M> {
        Tree {
            nodes: self
                .nodes
                .iter()
                .map(|n| Node {
                    id: n.id,
                    label: n.label.as_ref().map(&mut f),
                    parent: n.parent,
                    edges: n.edges.clone(),
                    leaves: OnceLock::new(),
                })
                .collect(),
            root: self.root,
        }
    }

    /// Like [`Tree::map_labels`], stopping at the first label `f` rejects.
    pub fn try_map_labels<M: Label, E>(
        &self,
        mut f: impl FnMut(&L) -> std::result::Result<M, E>,
    ) -> std::result::Result<Tree<M>, E> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for n in &self.nodes {
            nodes.push(Node {
                id: n.id,
                label: n.label.as_ref().map(&mut f).transpose()?,
                parent: n.parent,
                edges: n.edges.clone(),
                leaves: OnceLock::new(),
            });
        }
        Ok(Tree {
            nodes,
            root: self.root,
        })
    }

    /// Restriction of the tree to `taxa`: other leaves are removed, nodes left
    /// with a single child are suppressed and a degree-1 root is walked down.
    pub fn restrict(&self, taxa: &HashSet<L>) -> Tree<L> {
        let mut out = Tree::new();
        if let Some(root) = self.root {
            if let Some(top) = self.copy_restricted(root, taxa, &mut out) {
                out.root = Some(top);
            }
        }
        out
    }

    fn copy_restricted(&self, id: NodeId, taxa: &HashSet<L>, out: &mut Tree<L>) -> Option<NodeId> {
        let mut copies: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            let node = &self.nodes[current];
            if node.edges.is_empty() {
                let copy = node
                    .label
                    .as_ref()
                    .filter(|label| taxa.contains(*label))
                    .map(|label| out.add_leaf(label.clone()));
                copies.insert(current, copy);
                continue;
            }
            if !expanded {
                stack.push((current, true));
                stack.extend(node.edges.iter().rev().map(|e| (e.child, false)));
                continue;
            }

            let mut kept: Vec<Edge> = node
                .edges
                .iter()
                .filter_map(|e| {
                    let child = copies.remove(&e.child).flatten()?;
                    Some(Edge { child, ..*e })
                })
                .collect();
            let copy = match kept.len() {
                0 => None,
                1 => kept.pop().map(|e| e.child),
                _ => {
                    let copy = out.add_internal();
                    for edge in kept {
                        out.attach_edge(copy, edge);
                    }
                    Some(copy)
                }
            };
            copies.insert(current, copy);
        }
        copies.remove(&id).flatten()
    }

    // ##########
    // # NEWICK #
    // ##########

    /// Newick representation, terminated by `;`.
    pub fn to_newick(&self) -> String {
        match self.root {
            Some(root) => {
                let mut out = String::new();
                self.write_newick(root, &mut out);
                out.push(';');
                out
            }
            None => "();".to_string(),
        }
    }

    fn write_newick(&self, id: NodeId, out: &mut String) {
        let mut stack = vec![Token::Node(id)];
        while let Some(token) = stack.pop() {
            match token {
                Token::Node(current) => {
                    let node = &self.nodes[current];
                    if node.edges.is_empty() {
                        if let Some(label) = &node.label {
                            out.push_str(&quote_label(&label.to_string()));
                        }
                        continue;
                    }
                    out.push('(');
                    stack.push(Token::Close);
                    for (i, edge) in node.edges.iter().enumerate().rev() {
                        stack.push(Token::EdgeEnd(edge));
                        stack.push(Token::Node(edge.child));
                        if i > 0 {
                            stack.push(Token::Comma);
                        }
                    }
                }
                Token::EdgeEnd(edge) => {
                    if let Some(support) = edge.support {
                        if !self.is_leaf(edge.child) {
                            out.push_str(&support.to_string());
                        }
                    }
                    if let Some(length) = edge.length {
                        out.push(':');
                        out.push_str(&length.to_string());
                    }
                }
                Token::Comma => out.push(','),
                Token::Close => out.push(')'),
            }
        }
    }
}

/// Pending output of the newick writer.
enum Token<'a> {
    Node(NodeId),
    EdgeEnd(&'a Edge),
    Comma,
    Close,
}

impl<L: Label> Display for Tree<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_newick())
    }
}

/// Quote a label if it contains newick punctuation.
fn quote_label(label: &str) -> String {
    let special = |c: char| "()[]':;,".contains(c) || c.is_whitespace();
    if label.chars().any(special) {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

impl Tree<TaxonId> {
    /// Convert a parsed [`phylotree`] tree into the arena model.
    ///
    /// Internal node names that parse as numbers become support values of
    /// the edge above them; branch lengths are kept.
    pub fn from_phylo(tree: &PhyloTree) -> Result<Self> {
        let mut out = Tree::new();
        let root = tree.get_root()?;
        let top = Self::copy_phylo(tree, root, &mut out)?;
        out.root = Some(top);
        Ok(out)
    }

    fn copy_phylo(src: &PhyloTree, id: usize, out: &mut Tree<TaxonId>) -> Result<NodeId> {
        // internal copies are made on the way down so arena ids follow preorder
        let mut copies: HashMap<usize, NodeId> = HashMap::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            let node = src.get(&current)?;
            if node.children.is_empty() {
                let name = node
                    .name
                    .clone()
                    .ok_or_else(|| SuperfineError::Newick("unnamed leaf".to_string()))?;
                copies.insert(current, out.add_leaf(name));
            } else if !expanded {
                copies.insert(current, out.add_internal());
                stack.push((current, true));
                stack.extend(node.children.iter().rev().map(|&child| (child, false)));
            } else {
                let copy = copies[&current];
                for child_id in &node.children {
                    let child_node = src.get(child_id)?;
                    let support = if child_node.children.is_empty() {
                        None
                    } else {
                        child_node.name.as_deref().and_then(|n| n.parse::<f64>().ok())
                    };
                    out.attach_edge(
                        copy,
                        Edge {
                            child: copies[child_id],
                            support,
                            length: child_node.parent_edge,
                        },
                    );
                }
            }
        }
        Ok(copies[&id])
    }

    /// Parse a single newick string. `;`, `()` and `();` give the empty tree.
    pub fn from_newick(newick: &str) -> Result<Self> {
        let trimmed = newick.trim();
        if matches!(trimmed, "" | ";" | "()" | "();") {
            return Ok(Tree::new());
        }
        let terminated = if trimmed.ends_with(';') {
            trimmed.to_string()
        } else {
            format!("{trimmed};")
        };
        let parsed = PhyloTree::from_newick(&terminated)
            .map_err(|e| SuperfineError::Newick(format!("{e} in {trimmed}")))?;
        Self::from_phylo(&parsed)
    }
}

/// Count leaves per label, in label order.
pub fn label_frequencies<L: Label>(labels: &[L]) -> Vec<(L, usize)> {
    let mut counts: HashMap<&L, usize> = HashMap::new();
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    let mut counts: Vec<(L, usize)> = counts.into_iter().map(|(l, c)| (l.clone(), c)).collect();
    counts.sort();
    counts
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::Tree;

    /// Parse a newick string whose leaves are group ids, optionally with a
    /// letter prefix so repeated groups get distinct names (`a0`, `b0`).
    pub fn groups(newick: &str) -> Tree<usize> {
        Tree::from_newick(newick).unwrap().map_labels(|l| {
            l.trim_start_matches(|c: char| c.is_ascii_alphabetic())
                .parse::<usize>()
                .unwrap()
        })
    }
}
