use nalgebra::DMatrix;

use crate::alphabets::Alphabet;
use crate::patterns::SitePatterns;
use crate::substitution_models::FreqVector;
use crate::tree::{NodeIdx, Tree};

mod phyloinfo_builder;
pub use phyloinfo_builder::*;

/// Tree and compressed alignment the likelihood is computed on.
///
/// Built with [`PhyloInfoBuilder`], which checks that every leaf of the tree maps to exactly
/// one taxon of the pattern table.
#[derive(Debug, Clone)]
pub struct PhyloInfo {
    /// Phylogenetic tree.
    pub tree: Tree,
    /// Site pattern table.
    pub patterns: SitePatterns,
    /// Pattern table row of every leaf, indexed by node.
    leaf_rows: Vec<Option<usize>>,
    /// Leaf indicator vectors (states x patterns), indexed by node.
    leaf_encoding: Vec<Option<DMatrix<f64>>>,
}

impl PhyloInfo {
    pub fn alphabet(&self) -> &Alphabet {
        self.patterns.alphabet()
    }

    pub fn n_states(&self) -> usize {
        self.patterns.alphabet().n_states()
    }

    /// Returns the pattern table row of a leaf.
    pub fn leaf_row(&self, idx: &NodeIdx) -> Option<usize> {
        self.leaf_rows[usize::from(idx)]
    }

    /// Returns the indicator encoding (states x patterns) of a leaf.
    pub fn leaf_encoding(&self, idx: &NodeIdx) -> Option<&DMatrix<f64>> {
        self.leaf_encoding[usize::from(idx)].as_ref()
    }

    /// Returns the empirical state frequencies of the pattern table.
    ///
    /// Ambiguous observations spread their weight evenly over the compatible states, fully
    /// missing observations are skipped. A state that is never observed gets a pseudo count of 1.
    pub fn freqs(&self) -> FreqVector {
        let n = self.n_states();
        let mut freqs = FreqVector::zeros(n);
        for taxon in 0..self.patterns.n_taxa() {
            for (state, weight) in self
                .patterns
                .taxon_states(taxon)
                .iter()
                .zip(self.patterns.weights())
            {
                if state.len() == n {
                    continue;
                }
                let share = weight / state.len() as f64;
                for s in state.iter() {
                    freqs[s] += share;
                }
            }
        }
        for f in freqs.iter_mut() {
            if *f == 0.0 {
                *f = 1.0;
            }
        }
        let total = freqs.sum();
        freqs.scale_mut(1.0 / total);
        freqs
    }

    /// Nucleotide frequencies at the three codon positions (rows), for codon alphabets.
    pub fn codon_position_freqs(&self) -> Option<DMatrix<f64>> {
        let Alphabet::Codon(code) = self.alphabet() else {
            return None;
        };
        let n = self.n_states();
        let mut counts = DMatrix::<f64>::zeros(3, 4);
        for taxon in 0..self.patterns.n_taxa() {
            for (state, weight) in self
                .patterns
                .taxon_states(taxon)
                .iter()
                .zip(self.patterns.weights())
            {
                if state.len() == n {
                    continue;
                }
                let share = weight / state.len() as f64;
                for s in state.iter() {
                    for (pos, nuc) in code.nucleotides(s).into_iter().enumerate() {
                        counts[(pos, nuc)] += share;
                    }
                }
            }
        }
        for mut row in counts.row_iter_mut() {
            row.iter_mut().filter(|c| **c == 0.0).for_each(|c| *c = 1.0);
            let total = row.sum();
            row.scale_mut(1.0 / total);
        }
        Some(counts)
    }
}
