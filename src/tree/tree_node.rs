use approx::relative_eq;

use crate::tree::NodeIdx::{self, Internal as Int, Leaf};

/// A tree node together with the branch that leads to it from its parent.
#[derive(Clone, Debug)]
pub struct Node {
    pub idx: NodeIdx,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
    pub blen: f64,
    pub id: String,
    /// Selects the rate matrix variant used on the branch above the node.
    pub label: usize,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
            && self.parent == other.parent
            && self.children == other.children
            && self.label == other.label
            && self.id == other.id
            && relative_eq!(self.blen, other.blen)
    }
}

impl Node {
    pub(crate) fn leaf(idx: usize, parent: Option<NodeIdx>, blen: f64, id: String) -> Self {
        Self {
            idx: Leaf(idx),
            parent,
            children: Vec::new(),
            blen,
            id,
            label: 0,
        }
    }

    pub(crate) fn internal(
        idx: usize,
        parent: Option<NodeIdx>,
        children: Vec<NodeIdx>,
        blen: f64,
        id: String,
    ) -> Self {
        Self {
            idx: Int(idx),
            parent,
            children,
            blen,
            id,
            label: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.idx, Leaf(_))
    }
}
