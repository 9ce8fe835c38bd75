use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::errors::ModelError;
use crate::f64_h;
use crate::likelihood::{PartialLikelihoods, Pruner, SiteLogLikelihoods, TransitionMatrices};
use crate::parameters::{ModelDescriptor, ModelValues, ParameterLayout, Phase, RateVariation};
use crate::phylo_info::PhyloInfo;
use crate::site_heterogeneity::CategoryMixture;
use crate::substitution_models::{
    Decomposition, FreqVector, QMatrixBuilder, RateMatrix, Scaling,
};
use crate::tree::NodeIdx;
use crate::Result;

type ModelKey = Vec<f64_h>;

fn model_key(values: &[f64], freqs: &FreqVector) -> ModelKey {
    values
        .iter()
        .chain(freqs.iter())
        .map(|v| f64_h::from(*v))
        .collect()
}

/// Result of one likelihood evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub neg_log_likelihood: f64,
    /// Some pattern likelihood was not positive and had to be floored.
    pub suspect: bool,
}

/// Expected substitutions per site on the branch above `node`.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchSubstitutions {
    pub node: NodeIdx,
    pub total: f64,
    /// Only for codon models.
    pub synonymous: Option<f64>,
    pub nonsynonymous: Option<f64>,
}

/// Transition matrices and conditional likelihoods of one mixture category.
#[derive(Clone, Debug)]
struct CategoryState {
    transitions: TransitionMatrices,
    /// Decomposition and branch length each transition matrix was computed from,
    /// indexed by gene and node.
    computed_from: Vec<Vec<Option<(Arc<Decomposition>, f64)>>>,
    buffers: PartialLikelihoods,
}

impl CategoryState {
    fn new(info: &PhyloInfo) -> Self {
        let n_genes = info.patterns.n_genes();
        let n_nodes = info.tree.len();
        Self {
            transitions: TransitionMatrices::new(n_genes, n_nodes, info.n_states()),
            computed_from: vec![vec![None; n_nodes]; n_genes],
            buffers: PartialLikelihoods::new(info),
        }
    }

    /// Recomputes the transition matrices whose decomposition or branch length changed and
    /// marks the nodes above them dirty. Returns the number of recomputed matrices.
    fn update_transitions(
        &mut self,
        info: &PhyloInfo,
        branch_lengths: &[(NodeIdx, f64)],
        gene_rates: &[f64],
        decompositions: &[Arc<Decomposition>],
        labels: &[usize],
    ) -> usize {
        let mut updated = 0;
        for (gene, gene_rate) in gene_rates.iter().enumerate() {
            for (node, blen) in branch_lengths {
                let i = usize::from(node);
                let decomposition = &decompositions[labels[i]];
                let t = blen * gene_rate;
                let unchanged = matches!(
                    &self.computed_from[gene][i],
                    Some((d, old)) if Arc::ptr_eq(d, decomposition) && old.to_bits() == t.to_bits()
                );
                if unchanged {
                    continue;
                }
                self.transitions.set(gene, node, decomposition.p(t));
                self.computed_from[gene][i] = Some((Arc::clone(decomposition), t));
                for ancestor in info.tree.ancestors(node) {
                    self.buffers.mark_dirty(&ancestor);
                }
                updated += 1;
            }
        }
        updated
    }

    fn prune(&mut self, pruner: &Pruner, root_freqs: &FreqVector) -> Result<SiteLogLikelihoods> {
        pruner.prune(&mut self.buffers, &self.transitions)?;
        pruner.site_log_likelihoods(&self.buffers, root_freqs)
    }
}

/// Rate matrices of the last evaluation, kept for reporting.
#[derive(Clone, Debug)]
struct Snapshot {
    values: ModelValues,
    mixture: CategoryMixture,
    /// Indexed by category and branch label.
    rates: Vec<Vec<RateMatrix>>,
    site_logl: Vec<DVector<f64>>,
}

#[derive(Clone, Debug)]
struct EngineState {
    decompositions: HashMap<ModelKey, Arc<Decomposition>>,
    categories: Vec<CategoryState>,
    last: Option<Snapshot>,
}

impl EngineState {
    fn new(info: &PhyloInfo, n_categories: usize) -> Self {
        Self {
            decompositions: HashMap::new(),
            categories: vec![CategoryState::new(info); n_categories],
            last: None,
        }
    }

    /// Decompositions for the keyed rate matrices, reusing those of the previous evaluation.
    /// Entries not used by this evaluation are dropped.
    fn decompose(&mut self, rates: &[Vec<(ModelKey, RateMatrix)>]) -> Vec<Vec<Arc<Decomposition>>> {
        let mut previous = std::mem::take(&mut self.decompositions);
        let mut built = 0;
        let decompositions: Vec<Vec<Arc<Decomposition>>> = rates
            .iter()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(key, rate)| {
                        if let Some(d) = self.decompositions.get(key) {
                            return Arc::clone(d);
                        }
                        let d = previous.remove(key).unwrap_or_else(|| {
                            built += 1;
                            Arc::new(Decomposition::new(rate))
                        });
                        self.decompositions.insert(key.clone(), Arc::clone(&d));
                        d
                    })
                    .collect()
            })
            .collect();
        if built > 0 {
            debug!("Built {} new decompositions", built);
        }
        decompositions
    }
}

/// Builds a [`LikelihoodEngine`] after checking the model against the data.
pub struct EngineBuilder {
    info: PhyloInfo,
    descriptor: ModelDescriptor,
}

impl EngineBuilder {
    pub fn new(info: PhyloInfo, descriptor: ModelDescriptor) -> Self {
        Self { info, descriptor }
    }

    pub fn build(self) -> Result<LikelihoodEngine> {
        let (layout, initial, tmp) = prepare(&self.descriptor, &self.info)?;
        Ok(LikelihoodEngine {
            info: self.info,
            descriptor: self.descriptor,
            layout,
            initial,
            in_run: false,
            tmp: RefCell::new(tmp),
        })
    }
}

fn prepare(
    descriptor: &ModelDescriptor,
    info: &PhyloInfo,
) -> Result<(ParameterLayout, ModelValues, EngineState)> {
    descriptor.validate(info)?;
    let layout = ParameterLayout::new(descriptor, info)?;
    let initial = ModelValues::initial(descriptor, info)?;
    let n_categories = mixture(descriptor, info, &initial)?.len();
    info!(
        "Likelihood engine for {} on {} taxa and {} patterns: {} parameters, {} categories",
        descriptor,
        info.patterns.n_taxa(),
        info.patterns.n_patterns(),
        layout.len(),
        n_categories
    );
    Ok((layout, initial, EngineState::new(info, n_categories)))
}

/// Number of branch labels the rate matrices depend on.
fn n_labels(descriptor: &ModelDescriptor, info: &PhyloInfo) -> usize {
    if descriptor.model.has_omega() {
        info.tree.n_branch_labels()
    } else {
        1
    }
}

/// Site classes of the selection model, or rate categories with the single class's omegas.
fn mixture(
    descriptor: &ModelDescriptor,
    info: &PhyloInfo,
    values: &ModelValues,
) -> Result<CategoryMixture> {
    let classes = match &descriptor.selection {
        Some(selection) => {
            selection.categories(&values.selection_params, n_labels(descriptor, info))?
        }
        None => Vec::new(),
    };
    if classes.len() > 1 {
        return CategoryMixture::site_classes(classes);
    }
    let missing = |name: &str| {
        ModelError::ModelStateInconsistency(format!("No value for {} in the model values", name))
    };
    let mut mixture = match descriptor.rate_variation {
        RateVariation::Homogeneous => CategoryMixture::single(),
        RateVariation::Gamma {
            categories, method, ..
        } => {
            let alpha = values.alpha.ok_or_else(|| missing("alpha"))?;
            CategoryMixture::gamma(alpha, categories, method)?
        }
        RateVariation::AutoGamma {
            categories, method, ..
        } => {
            let alpha = values.alpha.ok_or_else(|| missing("alpha"))?;
            let rho = values.rho.ok_or_else(|| missing("rho"))?;
            CategoryMixture::auto_gamma(alpha, rho, categories, method)?
        }
    };
    if let Some(class) = classes.first() {
        for category in mixture.categories.iter_mut() {
            category.omegas = class.omegas.clone();
        }
    }
    Ok(mixture)
}

cfg_if::cfg_if! {
if #[cfg(feature = "parallel")] {
fn prune_categories(
    categories: &mut [CategoryState],
    pruner: &Pruner,
    root_freqs: &[&FreqVector],
) -> Vec<Result<SiteLogLikelihoods>> {
    use rayon::prelude::*;
    categories
        .par_iter_mut()
        .zip_eq(root_freqs.par_iter())
        .map(|(state, freqs)| state.prune(pruner, freqs))
        .collect()
}
} else {
fn prune_categories(
    categories: &mut [CategoryState],
    pruner: &Pruner,
    root_freqs: &[&FreqVector],
) -> Vec<Result<SiteLogLikelihoods>> {
    categories
        .iter_mut()
        .zip(root_freqs)
        .map(|(state, freqs)| state.prune(pruner, freqs))
        .collect()
}
}
}

/// Negative log-likelihood of a parameter vector for a fixed tree, data set and model.
///
/// Holds the whole model context; evaluations at different points do not interfere, and
/// repeated evaluations at the same point give bit-identical results. Rate matrix
/// decompositions, transition matrices and conditional likelihoods of the previous evaluation
/// are reused where the parameters they depend on did not change.
#[derive(Clone, Debug)]
pub struct LikelihoodEngine {
    info: PhyloInfo,
    descriptor: ModelDescriptor,
    layout: ParameterLayout,
    initial: ModelValues,
    in_run: bool,
    tmp: RefCell<EngineState>,
}

impl LikelihoodEngine {
    pub fn info(&self) -> &PhyloInfo {
        &self.info
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn parameter_count(&self) -> usize {
        self.layout.len()
    }

    pub fn bounds(&self, phase: Phase) -> Vec<(f64, f64)> {
        self.layout.bounds(phase)
    }

    pub fn initial_values(&self) -> &ModelValues {
        &self.initial
    }

    /// Starting point for the optimiser.
    pub fn initial_params(&self, phase: Phase) -> Result<Vec<f64>> {
        self.layout.pack(&self.initial, phase)
    }

    pub fn values(&self, x: &[f64], phase: Phase) -> Result<ModelValues> {
        self.layout.unpack(x, phase, &self.initial)
    }

    /// Replaces the model. Not allowed while an optimisation run is in progress.
    pub fn set_descriptor(&mut self, descriptor: ModelDescriptor) -> Result<()> {
        if self.in_run {
            bail!(ModelError::ModelStateInconsistency(
                "The model cannot change during an optimisation run".to_string()
            ));
        }
        let (layout, initial, tmp) = prepare(&descriptor, &self.info)?;
        self.layout = layout;
        self.initial = initial;
        self.tmp = RefCell::new(tmp);
        self.descriptor = descriptor;
        Ok(())
    }

    /// Replaces the values that fixed parameters take and the optimiser starts from.
    pub fn set_initial_values(&mut self, values: ModelValues) -> Result<()> {
        if self.in_run {
            bail!(ModelError::ModelStateInconsistency(
                "Fixed values cannot change during an optimisation run".to_string()
            ));
        }
        self.layout.pack(&values, Phase::Final)?;
        self.initial = values;
        Ok(())
    }

    /// Locks the layout for an optimisation run.
    pub fn begin_run(&mut self) -> Result<()> {
        if self.in_run {
            bail!(ModelError::ModelStateInconsistency(
                "An optimisation run is already in progress".to_string()
            ));
        }
        debug!("Starting an optimisation run over {} parameters", self.layout.len());
        self.in_run = true;
        Ok(())
    }

    pub fn end_run(&mut self) {
        self.in_run = false;
    }

    pub fn in_run(&self) -> bool {
        self.in_run
    }

    /// Keyed rate matrices per category and branch label. Codon matrices of all categories
    /// sharing a label are scaled together so that the mixture has one substitution per unit
    /// time; differences in omega stay differences in rate.
    fn rate_matrices(
        &self,
        values: &ModelValues,
        mixture: &CategoryMixture,
    ) -> Result<Vec<Vec<(ModelKey, RateMatrix)>>> {
        let model = &self.descriptor.model;
        if !model.has_omega() {
            let rate = model.build_q(&values.rate_params, &values.freqs, Scaling::Normalised)?;
            let key = model_key(&values.rate_params, &values.freqs);
            return Ok(vec![vec![(key, rate)]; mixture.len()]);
        }
        let n_labels = n_labels(&self.descriptor, &self.info);
        let mut unscaled = Vec::with_capacity(mixture.len());
        for category in &mixture.categories {
            let mut per_label = Vec::with_capacity(n_labels);
            for omega in &category.omegas {
                let mut params = values.rate_params.clone();
                params.push(*omega);
                let rate = model.build_q(&params, &values.freqs, Scaling::Unscaled)?;
                per_label.push((params, rate));
            }
            unscaled.push(per_label);
        }
        let scales: Vec<f64> = (0..n_labels)
            .map(|l| {
                let mean: f64 = mixture
                    .categories
                    .iter()
                    .zip(&unscaled)
                    .map(|(c, rates)| c.weight * rates[l].1.mean_rate)
                    .sum();
                1.0 / mean
            })
            .collect();
        Ok(unscaled
            .into_iter()
            .map(|per_label| {
                per_label
                    .into_iter()
                    .zip(&scales)
                    .map(|((mut params, rate), scale)| {
                        params.push(*scale);
                        (model_key(&params, &values.freqs), rate.scaled(*scale))
                    })
                    .collect()
            })
            .collect())
    }

    /// Negative log-likelihood at `x`. `Phase::Final` is only accepted outside of an
    /// optimisation run.
    pub fn evaluate(&self, x: &[f64], phase: Phase) -> Result<Evaluation> {
        if self.in_run && phase == Phase::Final {
            bail!(ModelError::ModelStateInconsistency(
                "Final-form parameters during an optimisation run".to_string()
            ));
        }
        let values = self.layout.unpack(x, phase, &self.initial)?;
        let mixture = mixture(&self.descriptor, &self.info, &values)?;
        let keyed = self.rate_matrices(&values, &mixture)?;

        let mut tmp = self.tmp.borrow_mut();
        if tmp.categories.len() != mixture.len() {
            bail!(ModelError::ModelStateInconsistency(format!(
                "Mixture has {} categories, the engine was set up for {}",
                mixture.len(),
                tmp.categories.len()
            )));
        }
        let decompositions = tmp.decompose(&keyed);
        let rates: Vec<Vec<RateMatrix>> = keyed
            .into_iter()
            .map(|labels| labels.into_iter().map(|(_, rate)| rate).collect())
            .collect();

        let tree = &self.info.tree;
        let labels: Vec<usize> = if n_labels(&self.descriptor, &self.info) > 1 {
            tree.nodes.iter().map(|n| n.label).collect()
        } else {
            vec![0; tree.len()]
        };
        let mut updated = 0;
        for ((state, category), decomposition) in tmp
            .categories
            .iter_mut()
            .zip(&mixture.categories)
            .zip(&decompositions)
        {
            let branch_lengths: Vec<(NodeIdx, f64)> = tree
                .branches()
                .map(|idx| (idx, values.blens[usize::from(&idx)] * category.rate))
                .collect();
            updated += state.update_transitions(
                &self.info,
                &branch_lengths,
                &values.gene_rates,
                decomposition,
                &labels,
            );
        }
        debug!("Updated {} transition matrices", updated);

        let pruner = Pruner::new(&self.info).with_scale_threshold(self.descriptor.scale_threshold);
        let root_freqs: Vec<&FreqVector> = rates.iter().map(|r| &r[0].freqs).collect();
        let results = prune_categories(&mut tmp.categories, &pruner, &root_freqs);
        let mut suspect = false;
        let mut site_logl = Vec::with_capacity(results.len());
        for result in results {
            let category = result?;
            suspect |= category.suspect;
            site_logl.push(category.values);
        }

        let log_likelihood = mixture.log_likelihood(&site_logl, &self.info.patterns)?;
        let neg_log_likelihood = if log_likelihood.is_finite() {
            -log_likelihood
        } else {
            suspect = true;
            f64::MAX
        };
        if suspect {
            warn!(
                "Numerically suspect evaluation, negative log-likelihood {}",
                neg_log_likelihood
            );
        }
        tmp.last = Some(Snapshot {
            values,
            mixture,
            rates,
            site_logl,
        });
        Ok(Evaluation {
            neg_log_likelihood,
            suspect,
        })
    }

    fn snapshot(&self, x: &[f64], phase: Phase) -> Result<Snapshot> {
        self.evaluate(x, phase)?;
        match &self.tmp.borrow().last {
            Some(snapshot) => Ok(snapshot.clone()),
            None => bail!(ModelError::ModelStateInconsistency(
                "No evaluation to report on".to_string()
            )),
        }
    }

    /// Log-likelihood of every pattern. For correlated rate categories these are the marginal
    /// values under the stationary category frequencies.
    pub fn site_log_likelihoods(&self, x: &[f64], phase: Phase) -> Result<DVector<f64>> {
        let snapshot = self.snapshot(x, phase)?;
        if snapshot.mixture.len() == 1 {
            return Ok(snapshot.site_logl[0].clone());
        }
        Ok(snapshot.mixture.pattern_log_likelihoods(&snapshot.site_logl))
    }

    /// Posterior category probabilities, one row per pattern (per site for correlated rate
    /// categories), one column per category.
    pub fn posteriors(&self, x: &[f64], phase: Phase) -> Result<DMatrix<f64>> {
        let snapshot = self.snapshot(x, phase)?;
        snapshot
            .mixture
            .posteriors(&snapshot.site_logl, &self.info.patterns)
    }

    /// Expected substitutions per site on every branch, averaged over categories and genes.
    /// Codon models also get the synonymous and nonsynonymous shares.
    pub fn branch_substitutions(&self, x: &[f64], phase: Phase) -> Result<Vec<BranchSubstitutions>> {
        let snapshot = self.snapshot(x, phase)?;
        let patterns = &self.info.patterns;
        let gene_rate: f64 = (0..patterns.n_genes())
            .map(|g| patterns.gene_sites(g) * snapshot.values.gene_rates[g])
            .sum::<f64>()
            / patterns.n_sites();
        let code = self.descriptor.model.genetic_code();
        let tree = &self.info.tree;
        let mut report = Vec::with_capacity(tree.len());
        for node in tree.branches() {
            let label = if n_labels(&self.descriptor, &self.info) > 1 {
                tree.branch_label(&node)
            } else {
                0
            };
            let t = snapshot.values.blens[usize::from(&node)] * gene_rate;
            let mut total = 0.0;
            let mut synonymous = 0.0;
            let mut nonsynonymous = 0.0;
            for (category, rates) in snapshot.mixture.categories.iter().zip(&snapshot.rates) {
                let rate = &rates[label];
                let share = category.weight * category.rate;
                total += share * rate.rate();
                if let Some(code) = code {
                    synonymous += share * rate.flux(|i, j| code.is_synonymous(i, j));
                    nonsynonymous += share * rate.flux(|i, j| !code.is_synonymous(i, j));
                }
            }
            report.push(BranchSubstitutions {
                node,
                total: t * total,
                synonymous: code.map(|_| t * synonymous),
                nonsynonymous: code.map(|_| t * nonsynonymous),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests;
