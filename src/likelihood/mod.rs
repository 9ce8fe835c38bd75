use anyhow::bail;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::errors::ModelError;
use crate::phylo_info::PhyloInfo;
use crate::substitution_models::{FreqVector, SubstMatrix};
use crate::tree::NodeIdx::{self, Internal, Leaf};
use crate::Result;

/// Value substituted for a pattern likelihood that is not positive.
pub const LIKELIHOOD_FLOOR: f64 = 1e-300;
/// Conditional likelihood columns whose maximum drops below this are rescaled.
pub const DEFAULT_SCALE_THRESHOLD: f64 = 1e-100;

/// Transition matrices for every branch, one set per gene.
/// Indexed by gene and by the arena index of the node below the branch.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionMatrices {
    matrices: Vec<Vec<SubstMatrix>>,
}

impl TransitionMatrices {
    pub fn new(n_genes: usize, n_nodes: usize, n_states: usize) -> Self {
        Self {
            matrices: vec![vec![SubstMatrix::identity(n_states, n_states); n_nodes]; n_genes],
        }
    }

    pub fn get(&self, gene: usize, node: &NodeIdx) -> &SubstMatrix {
        &self.matrices[gene][usize::from(node)]
    }

    pub fn set(&mut self, gene: usize, node: &NodeIdx, p: SubstMatrix) {
        self.matrices[gene][usize::from(node)] = p;
    }

    pub fn n_genes(&self) -> usize {
        self.matrices.len()
    }
}

/// Conditional likelihoods of the data below every internal node for one rate category.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialLikelihoods {
    /// states x patterns, only filled for internal nodes
    node_info: Vec<DMatrix<f64>>,
    /// accumulated log scale factor of the subtree, per pattern
    node_scale: Vec<DVector<f64>>,
    dirty: Vec<bool>,
}

impl PartialLikelihoods {
    pub fn new(info: &PhyloInfo) -> Self {
        let n_nodes = info.tree.len();
        let n_states = info.n_states();
        let n_patterns = info.patterns.n_patterns();
        Self {
            node_info: vec![DMatrix::zeros(n_states, n_patterns); n_nodes],
            node_scale: vec![DVector::zeros(n_patterns); n_nodes],
            dirty: vec![true; n_nodes],
        }
    }

    pub fn is_dirty(&self, node: &NodeIdx) -> bool {
        self.dirty[usize::from(node)]
    }

    pub fn mark_dirty(&mut self, node: &NodeIdx) {
        self.dirty[usize::from(node)] = true;
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty.fill(true);
    }

    pub fn node_info(&self, node: &NodeIdx) -> &DMatrix<f64> {
        &self.node_info[usize::from(node)]
    }

    pub fn node_scale(&self, node: &NodeIdx) -> &DVector<f64> {
        &self.node_scale[usize::from(node)]
    }
}

/// Per-pattern log-likelihoods of one category, with the flag raised when any pattern
/// likelihood had to be floored.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteLogLikelihoods {
    pub values: DVector<f64>,
    pub suspect: bool,
}

impl SiteLogLikelihoods {
    /// Sum of the pattern log-likelihoods weighted by the pattern counts.
    pub fn total(&self, weights: &[f64]) -> f64 {
        self.values
            .iter()
            .zip(weights)
            .map(|(logl, w)| logl * w)
            .sum()
    }
}

/// Postorder recursion over the tree computing conditional likelihoods with underflow control.
#[derive(Clone, Debug)]
pub struct Pruner<'a> {
    info: &'a PhyloInfo,
    scale_threshold: f64,
}

impl<'a> Pruner<'a> {
    pub fn new(info: &'a PhyloInfo) -> Self {
        Self {
            info,
            scale_threshold: DEFAULT_SCALE_THRESHOLD,
        }
    }

    /// Columns whose largest entry is below `threshold` are rescaled; `0.0` disables
    /// rescaling and `f64::INFINITY` rescales every column.
    pub fn with_scale_threshold(mut self, threshold: f64) -> Self {
        self.scale_threshold = threshold;
        self
    }

    /// Recomputes the conditional likelihoods of all dirty internal nodes.
    pub fn prune(
        &self,
        buffers: &mut PartialLikelihoods,
        transitions: &TransitionMatrices,
    ) -> Result<()> {
        if transitions.n_genes() != self.info.patterns.n_genes() {
            bail!(ModelError::ModelStateInconsistency(format!(
                "Transition matrices for {} genes, data has {}",
                transitions.n_genes(),
                self.info.patterns.n_genes()
            )));
        }
        let mut recomputed = 0;
        for node_idx in self.info.tree.postorder.iter() {
            if let Internal(idx) = node_idx {
                if !buffers.dirty[*idx] {
                    continue;
                }
                self.set_internal(buffers, transitions, node_idx)?;
                buffers.dirty[*idx] = false;
                recomputed += 1;
            }
        }
        debug!("Pruning recomputed {} internal nodes", recomputed);
        Ok(())
    }

    fn set_internal(
        &self,
        buffers: &mut PartialLikelihoods,
        transitions: &TransitionMatrices,
        node_idx: &NodeIdx,
    ) -> Result<()> {
        let n_states = self.info.n_states();
        let n_patterns = self.info.patterns.n_patterns();
        let mut partial = DMatrix::from_element(n_states, n_patterns, 1.0);
        let mut scale = DVector::zeros(n_patterns);
        for child in self.info.tree.children(node_idx) {
            let below = self.below(buffers, child)?;
            for (gene, range) in self.info.patterns.genes().iter().enumerate() {
                if range.is_empty() {
                    continue;
                }
                let contribution =
                    transitions.get(gene, child) * below.columns(range.start, range.len());
                partial
                    .columns_mut(range.start, range.len())
                    .component_mul_assign(&contribution);
            }
            if let Internal(_) = child {
                scale += buffers.node_scale(child);
            }
        }
        for (mut column, log_scale) in partial.column_iter_mut().zip(scale.iter_mut()) {
            let max = column.max();
            if max > 0.0 && max < self.scale_threshold {
                column /= max;
                *log_scale += max.ln();
            }
        }
        let idx = usize::from(node_idx);
        buffers.node_info[idx] = partial;
        buffers.node_scale[idx] = scale;
        Ok(())
    }

    fn below<'b>(
        &'b self,
        buffers: &'b PartialLikelihoods,
        node_idx: &NodeIdx,
    ) -> Result<&'b DMatrix<f64>> {
        match node_idx {
            Leaf(_) => match self.info.leaf_encoding(node_idx) {
                Some(encoding) => Ok(encoding),
                None => bail!(ModelError::ModelStateInconsistency(format!(
                    "No observed states for {}",
                    node_idx
                ))),
            },
            Internal(_) => Ok(buffers.node_info(node_idx)),
        }
    }

    /// Combines the root conditional likelihoods with the root frequencies.
    /// Pattern likelihoods that are not positive are floored and reported as suspect.
    pub fn site_log_likelihoods(
        &self,
        buffers: &PartialLikelihoods,
        root_freqs: &FreqVector,
    ) -> Result<SiteLogLikelihoods> {
        let root = &self.info.tree.root;
        let root_info = self.below(buffers, root)?;
        let mut values = (root_freqs.transpose() * root_info).transpose();
        let mut suspect = false;
        for value in values.iter_mut() {
            if !(*value > 0.0 && value.is_finite()) {
                suspect = true;
                *value = LIKELIHOOD_FLOOR;
            }
            *value = value.ln();
        }
        if let Internal(_) = root {
            values += buffers.node_scale(root);
        }
        if suspect {
            warn!("Some pattern likelihoods were not positive and have been floored");
        }
        Ok(SiteLogLikelihoods { values, suspect })
    }
}

#[cfg(test)]
mod tests;
