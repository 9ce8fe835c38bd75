use std::collections::HashSet;

use anyhow::bail;
use log::{info, warn};
use nalgebra::DMatrix;

use crate::errors::DataError;
use crate::patterns::SitePatterns;
use crate::phylo_info::PhyloInfo;
use crate::tree::Tree;
use crate::Result;

pub struct PhyloInfoBuilder {
    tree: Tree,
    patterns: SitePatterns,
}

impl PhyloInfoBuilder {
    /// Creates a new PhyloInfoBuilder from a tree and a site pattern table.
    pub fn new(tree: Tree, patterns: SitePatterns) -> PhyloInfoBuilder {
        PhyloInfoBuilder { tree, patterns }
    }

    /// Builds the PhyloInfo struct.
    ///
    /// Leaves are matched to taxa by id. When none of the leaves carries an id, leaves are
    /// matched to taxa in the order they appear in the tree.
    /// Bails if a leaf has no matching taxon, if two leaves share a taxon or if the numbers of
    /// leaves and taxa differ.
    pub fn build(self) -> Result<PhyloInfo> {
        let tree = self.tree;
        let patterns = self.patterns;
        let leaves: Vec<_> = tree.leaves().iter().map(|n| n.idx).collect();
        if leaves.len() != patterns.n_taxa() {
            bail!(DataError::new(format!(
                "The tree has {} leaves but the patterns have {} taxa",
                leaves.len(),
                patterns.n_taxa()
            )));
        }
        let by_order = tree.leaf_ids().iter().all(|id| id.is_empty());
        if by_order {
            warn!("Leaves carry no ids, matching them to taxa in tree order.");
        }

        let mut leaf_rows = vec![None; tree.len()];
        let mut seen = HashSet::with_capacity(leaves.len());
        for (order, idx) in leaves.iter().enumerate() {
            let row = if by_order {
                order
            } else {
                let id = tree.node_id(idx);
                match patterns.taxon_index(id) {
                    Some(row) => row,
                    None => bail!(DataError::new(format!(
                        "Leaf {} ({}) has no sequence in the pattern table",
                        id, idx
                    ))),
                }
            };
            if !seen.insert(row) {
                bail!(DataError::new(format!(
                    "Taxon {} is assigned to more than one leaf",
                    patterns.taxa()[row]
                )));
            }
            leaf_rows[usize::from(idx)] = Some(row);
        }

        let n = patterns.alphabet().n_states();
        let leaf_encoding = leaf_rows
            .iter()
            .map(|row| {
                row.map(|r| {
                    let states = patterns.taxon_states(r);
                    DMatrix::from_fn(n, states.len(), |s, p| {
                        if states[p].contains(s) {
                            1.0
                        } else {
                            0.0
                        }
                    })
                })
            })
            .collect();

        info!(
            "Set up {} taxa with {} patterns on a tree with {} nodes",
            patterns.n_taxa(),
            patterns.n_patterns(),
            tree.len()
        );
        Ok(PhyloInfo {
            tree,
            patterns,
            leaf_rows,
            leaf_encoding,
        })
    }
}
