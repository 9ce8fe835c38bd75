use std::fmt::Display;

use anyhow::bail;

use crate::Result;
use NodeIdx::{Internal as Int, Leaf};

mod tree_node;
pub use tree_node::*;
pub mod tree_parser;

#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        match node_idx {
            Int(idx) => *idx,
            Leaf(idx) => *idx,
        }
    }
}

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        usize::from(&node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Int(idx) => write!(f, "internal node {}", idx),
            Leaf(idx) => write!(f, "leaf node {}", idx),
        }
    }
}

/// Rooted tree stored as an arena of nodes; `NodeIdx` values index into `nodes`.
#[derive(Debug, Clone)]
pub struct Tree {
    pub root: NodeIdx,
    pub nodes: Vec<Node>,
    pub postorder: Vec<NodeIdx>,
    pub preorder: Vec<NodeIdx>,
    pub(crate) complete: bool,
    pub(crate) n: usize,
    pub(crate) leaf_ids: Vec<String>,
}

impl Tree {
    pub(crate) fn new_empty() -> Self {
        Self {
            root: Int(0),
            nodes: Vec::new(),
            postorder: Vec::new(),
            preorder: Vec::new(),
            complete: false,
            n: 0,
            leaf_ids: Vec::new(),
        }
    }

    /// Builds a tree from a parent array. Nodes without children become leaves, the single
    /// node without a parent becomes the root. `ids` may be empty.
    pub fn from_structure(parents: &[Option<usize>], blens: &[f64], ids: &[String]) -> Result<Self> {
        let n_nodes = parents.len();
        if n_nodes == 0 {
            bail!("Cannot build a tree without nodes");
        }
        if blens.len() != n_nodes || (!ids.is_empty() && ids.len() != n_nodes) {
            bail!(
                "Expected {} branch lengths and ids, got {} and {}",
                n_nodes,
                blens.len(),
                ids.len()
            );
        }
        let mut children = vec![Vec::new(); n_nodes];
        let mut roots = Vec::new();
        for (i, parent) in parents.iter().enumerate() {
            match parent {
                Some(p) if *p >= n_nodes || *p == i => {
                    bail!("Node {} has an invalid parent {}", i, p)
                }
                Some(p) => children[*p].push(i),
                None => roots.push(i),
            }
        }
        if roots.len() != 1 {
            bail!("Expected exactly one root, found {}", roots.len());
        }
        let as_idx = |i: usize| if children[i].is_empty() { Leaf(i) } else { Int(i) };
        let mut tree = Self::new_empty();
        for i in 0..n_nodes {
            let id = ids.get(i).cloned().unwrap_or_default();
            let parent = parents[i].map(as_idx);
            let node = if children[i].is_empty() {
                Node::leaf(i, parent, blens[i], id)
            } else {
                let kids = children[i].iter().map(|&c| as_idx(c)).collect();
                Node::internal(i, parent, kids, blens[i], id)
            };
            tree.nodes.push(node);
        }
        tree.root = as_idx(roots[0]);
        tree.complete();
        if tree.postorder.len() != n_nodes {
            bail!("Parent array contains a cycle or disconnected nodes");
        }
        Ok(tree)
    }

    pub(crate) fn complete(&mut self) {
        self.compute_postorder();
        self.compute_preorder();
        self.n = self.nodes.iter().filter(|n| n.is_leaf()).count();
        self.leaf_ids = self
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id.clone())
            .collect();
        self.complete = true;
    }

    pub(crate) fn compute_postorder(&mut self) {
        let mut order = self.preorder_subroot(&self.root);
        order.reverse();
        self.postorder = order;
    }

    pub(crate) fn compute_preorder(&mut self) {
        self.preorder = self.preorder_subroot(&self.root);
    }

    /// Preorder of the subtree below `subroot`, children visited in their stored order.
    pub fn preorder_subroot(&self, subroot: &NodeIdx) -> Vec<NodeIdx> {
        let mut order = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        let mut stack = vec![*subroot];
        let mut visited = vec![false; self.nodes.len()];
        while let Some(cur) = stack.pop() {
            let i = usize::from(&cur);
            if visited[i] {
                continue;
            }
            visited[i] = true;
            order.push(cur);
            for child in self.nodes[i].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn leaves(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_leaf()).collect()
    }

    pub fn internals(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| !n.is_leaf()).collect()
    }

    pub fn leaf_ids(&self) -> &[String] {
        &self.leaf_ids
    }

    pub fn node(&self, idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub fn parent(&self, idx: &NodeIdx) -> Option<&NodeIdx> {
        self.nodes[usize::from(idx)].parent.as_ref()
    }

    pub fn children(&self, idx: &NodeIdx) -> &[NodeIdx] {
        &self.nodes[usize::from(idx)].children
    }

    pub fn blen(&self, idx: &NodeIdx) -> f64 {
        self.nodes[usize::from(idx)].blen
    }

    pub fn set_blen(&mut self, idx: &NodeIdx, blen: f64) {
        self.nodes[usize::from(idx)].blen = blen;
    }

    pub fn branch_label(&self, idx: &NodeIdx) -> usize {
        self.nodes[usize::from(idx)].label
    }

    pub fn set_branch_label(&mut self, idx: &NodeIdx, label: usize) {
        self.nodes[usize::from(idx)].label = label;
    }

    /// Number of distinct branch label values, counting from label 0.
    pub fn n_branch_labels(&self) -> usize {
        self.branches().map(|idx| self.branch_label(&idx)).max().map_or(1, |m| m + 1)
    }

    pub fn node_id(&self, idx: &NodeIdx) -> &str {
        &self.nodes[usize::from(idx)].id
    }

    /// Node indices of every branch (every node but the root) in preorder.
    pub fn branches(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.preorder.iter().copied().filter(move |idx| *idx != self.root)
    }

    pub fn try_idx(&self, id: &str) -> Result<NodeIdx> {
        match self.nodes.iter().find(|n| n.id == id) {
            Some(node) => Ok(node.idx),
            None => bail!("No node with id {} found in the tree", id),
        }
    }

    /// Ancestors of `idx` from its parent up to the root.
    pub fn ancestors(&self, idx: &NodeIdx) -> Vec<NodeIdx> {
        let mut path = Vec::new();
        let mut cur = self.parent(idx);
        while let Some(p) = cur {
            path.push(*p);
            cur = self.parent(p);
        }
        path
    }

    pub fn height(&self) -> f64 {
        self.branches().map(|idx| self.blen(&idx)).sum()
    }
}

#[cfg(test)]
mod tests;
