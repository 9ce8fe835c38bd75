use std::collections::HashMap;
use std::ops::Range;

use anyhow::bail;
use log::info;

use crate::alphabets::{Alphabet, StateSet};
use crate::errors::DataError;
use crate::Result;

/// Compressed alignment: unique columns (one state set per taxon) with their weights.
///
/// Patterns of one gene occupy a contiguous range. The optional site order lists the pattern
/// index of every alignment site and is only needed by models where neighbouring sites interact.
#[derive(Debug, Clone, PartialEq)]
pub struct SitePatterns {
    alphabet: Alphabet,
    taxa: Vec<String>,
    states: Vec<Vec<StateSet>>,
    weights: Vec<f64>,
    genes: Vec<Range<usize>>,
    site_order: Option<Vec<usize>>,
}

impl SitePatterns {
    /// Single-gene pattern table. `states[t][p]` is the observation of taxon `t` in pattern `p`.
    pub fn new(
        alphabet: Alphabet,
        taxa: Vec<String>,
        states: Vec<Vec<StateSet>>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        let n = weights.len();
        Self::with_genes(alphabet, taxa, states, weights, &[n])
    }

    /// Pattern table split into genes of `gene_sizes` consecutive patterns each.
    pub fn with_genes(
        alphabet: Alphabet,
        taxa: Vec<String>,
        states: Vec<Vec<StateSet>>,
        weights: Vec<f64>,
        gene_sizes: &[usize],
    ) -> Result<Self> {
        let n_patterns = weights.len();
        if taxa.len() != states.len() {
            bail!(DataError::new(format!(
                "Got {} taxa but {} rows of states",
                taxa.len(),
                states.len()
            )));
        }
        if let Some(row) = states.iter().position(|row| row.len() != n_patterns) {
            bail!(DataError::new(format!(
                "Taxon {} has {} patterns, expected {}",
                taxa[row],
                states[row].len(),
                n_patterns
            )));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            bail!(DataError::new(format!("Pattern weights must be non-negative, got {}", w)));
        }
        let all = StateSet::all(alphabet.n_states());
        for (taxon, row) in taxa.iter().zip(&states) {
            if row.iter().any(|s| s.is_empty() || !s.is_subset(&all)) {
                bail!(DataError::new(format!(
                    "Taxon {} has states outside the {} alphabet",
                    taxon,
                    alphabet
                )));
            }
        }
        if gene_sizes.is_empty() || gene_sizes.iter().sum::<usize>() != n_patterns {
            bail!(DataError::new(format!(
                "Gene sizes {:?} do not add up to {} patterns",
                gene_sizes,
                n_patterns
            )));
        }
        let mut genes = Vec::with_capacity(gene_sizes.len());
        let mut start = 0;
        for size in gene_sizes {
            genes.push(start..start + size);
            start += size;
        }
        Ok(Self {
            alphabet,
            taxa,
            states,
            weights,
            genes,
            site_order: None,
        })
    }

    /// Compresses aligned sequences into patterns. Identical columns are merged within a gene
    /// only; `site_genes` gives the gene of every site (all sites in gene 0 if `None`).
    pub fn from_alignment(
        alphabet: Alphabet,
        taxa: Vec<String>,
        seqs: &[&[u8]],
        site_genes: Option<&[usize]>,
    ) -> Result<Self> {
        if taxa.len() != seqs.len() || seqs.is_empty() {
            bail!(DataError::new(format!(
                "Got {} taxa and {} sequences",
                taxa.len(),
                seqs.len()
            )));
        }
        let encoded = seqs
            .iter()
            .map(|seq| alphabet.encode_sequence(seq))
            .collect::<Result<Vec<_>>>()?;
        let n_sites = encoded[0].len();
        if let Some(i) = encoded.iter().position(|seq| seq.len() != n_sites) {
            bail!(DataError::new(format!(
                "Sequence of {} has {} sites, expected {}; the sequences must be aligned",
                taxa[i],
                encoded[i].len(),
                n_sites
            )));
        }
        let site_genes = match site_genes {
            Some(genes) if genes.len() != n_sites => {
                bail!(DataError::new(format!(
                    "Got gene assignments for {} sites, expected {}",
                    genes.len(),
                    n_sites
                )));
            }
            Some(genes) => genes.to_vec(),
            None => vec![0; n_sites],
        };
        let n_genes = site_genes.iter().max().map_or(1, |g| g + 1);

        let mut gene_columns: Vec<Vec<Vec<StateSet>>> = vec![Vec::new(); n_genes];
        let mut gene_weights: Vec<Vec<f64>> = vec![Vec::new(); n_genes];
        let mut lookup: Vec<HashMap<Vec<StateSet>, usize>> = vec![HashMap::new(); n_genes];
        let mut local_order = Vec::with_capacity(n_sites);
        for (site, &gene) in site_genes.iter().enumerate() {
            let column: Vec<StateSet> = encoded.iter().map(|seq| seq[site]).collect();
            let pattern = match lookup[gene].get(&column) {
                Some(&p) => p,
                None => {
                    let p = gene_columns[gene].len();
                    lookup[gene].insert(column.clone(), p);
                    gene_columns[gene].push(column);
                    gene_weights[gene].push(0.0);
                    p
                }
            };
            gene_weights[gene][pattern] += 1.0;
            local_order.push((gene, pattern));
        }
        if let Some(g) = gene_columns.iter().position(|c| c.is_empty()) {
            bail!(DataError::new(format!("Gene {} has no sites", g)));
        }

        let gene_sizes: Vec<usize> = gene_columns.iter().map(|c| c.len()).collect();
        let offsets: Vec<usize> = gene_sizes
            .iter()
            .scan(0, |acc, size| {
                let start = *acc;
                *acc += size;
                Some(start)
            })
            .collect();
        let mut states = vec![Vec::new(); taxa.len()];
        for column in gene_columns.iter().flatten() {
            for (row, state) in states.iter_mut().zip(column) {
                row.push(*state);
            }
        }
        let weights = gene_weights.into_iter().flatten().collect();
        let site_order = local_order
            .into_iter()
            .map(|(gene, pattern)| offsets[gene] + pattern)
            .collect();

        let mut patterns = Self::with_genes(alphabet, taxa, states, weights, &gene_sizes)?;
        info!(
            "Compressed {} sites into {} patterns over {} gene(s)",
            n_sites,
            patterns.n_patterns(),
            n_genes
        );
        patterns.site_order = Some(site_order);
        Ok(patterns)
    }

    /// Attaches the pattern index of every site in alignment order.
    pub fn with_site_order(mut self, order: Vec<usize>) -> Result<Self> {
        if let Some(p) = order.iter().find(|&&p| p >= self.n_patterns()) {
            bail!(DataError::new(format!("Site order refers to unknown pattern {}", p)));
        }
        let mut counts = vec![0usize; self.n_patterns()];
        for &p in &order {
            counts[p] += 1;
        }
        for (p, (&count, &weight)) in counts.iter().zip(&self.weights).enumerate() {
            if (count as f64 - weight).abs() > 1e-9 {
                bail!(DataError::new(format!(
                    "Site order lists pattern {} {} times, its weight is {}",
                    p, count, weight
                )));
            }
        }
        self.site_order = Some(order);
        Ok(self)
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn n_taxa(&self) -> usize {
        self.taxa.len()
    }

    pub fn n_patterns(&self) -> usize {
        self.weights.len()
    }

    /// Total number of sites, the sum of the pattern weights.
    pub fn n_sites(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn gene_range(&self, gene: usize) -> Range<usize> {
        self.genes[gene].clone()
    }

    pub fn genes(&self) -> &[Range<usize>] {
        &self.genes
    }

    /// Summed pattern weights of a gene.
    pub fn gene_sites(&self, gene: usize) -> f64 {
        self.weights[self.gene_range(gene)].iter().sum()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn taxon_index(&self, id: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == id)
    }

    pub fn taxon_states(&self, taxon: usize) -> &[StateSet] {
        &self.states[taxon]
    }

    pub fn site_order(&self) -> Option<&[usize]> {
        self.site_order.as_deref()
    }
}
