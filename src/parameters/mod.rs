use std::fmt::Display;
use std::ops::Range;

use anyhow::bail;
use log::info;

use crate::alphabets::Alphabet;
use crate::errors::ModelError;
use crate::phylo_info::PhyloInfo;
use crate::site_heterogeneity::{GammaMethod, OmegaKind, SelectionModel};
use crate::substitution_models::{
    codon_freqs_f1x4, codon_freqs_f3x4, validate_freqs, FreqVector, QMatrixBuilder,
    SubstModelKind, FREQ_TOLERANCE,
};
use crate::tree::{NodeIdx, Tree};
use crate::Result;

pub const BRANCH_BOUNDS: (f64, f64) = (0.0, 50.0);
pub const RATE_BOUNDS: (f64, f64) = (1e-4, 999.0);
pub const ALPHA_BOUNDS: (f64, f64) = (0.005, 999.0);
pub const RHO_BOUNDS: (f64, f64) = (0.0, 0.999);
/// Bound on the log-ratio coordinates of proportions and frequencies while optimising.
pub const LOG_RATIO_BOUND: f64 = 99.0;

/// Form of the simplex-constrained parameters (site-class proportions, frequencies) in the
/// parameter vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Log-ratios against the last component, unconstrained apart from box bounds.
    Optimising,
    /// The proportions themselves, the last one implied.
    Final,
}

/// Where the stationary frequencies come from.
#[derive(Clone, Debug, PartialEq)]
pub enum FrequencyMode {
    Equal,
    /// Observed state frequencies of the alignment.
    Empirical,
    /// Codon frequencies from nucleotide frequencies pooled over codon positions.
    F1x4,
    /// Codon frequencies from position-specific nucleotide frequencies.
    F3x4,
    Fixed(FreqVector),
    /// Free parameters, starting from the empirical frequencies.
    Estimated,
    /// Frequencies prescribed by the substitution model.
    Model,
}

impl Display for FrequencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrequencyMode::Equal => write!(f, "equal"),
            FrequencyMode::Empirical => write!(f, "empirical"),
            FrequencyMode::F1x4 => write!(f, "F1x4"),
            FrequencyMode::F3x4 => write!(f, "F3x4"),
            FrequencyMode::Fixed(_) => write!(f, "fixed"),
            FrequencyMode::Estimated => write!(f, "estimated"),
            FrequencyMode::Model => write!(f, "model"),
        }
    }
}

/// Variation of the substitution rate across sites.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateVariation {
    Homogeneous,
    Gamma {
        alpha: f64,
        categories: usize,
        method: GammaMethod,
        fix_alpha: bool,
    },
    /// Discrete gamma with the categories of neighbouring sites correlated by `rho`.
    AutoGamma {
        alpha: f64,
        rho: f64,
        categories: usize,
        method: GammaMethod,
        fix_alpha: bool,
        fix_rho: bool,
    },
}

impl RateVariation {
    pub fn gamma(alpha: f64, categories: usize) -> Self {
        RateVariation::Gamma {
            alpha,
            categories,
            method: GammaMethod::Mean,
            fix_alpha: false,
        }
    }

    pub fn auto_gamma(alpha: f64, rho: f64, categories: usize) -> Self {
        RateVariation::AutoGamma {
            alpha,
            rho,
            categories,
            method: GammaMethod::Mean,
            fix_alpha: false,
            fix_rho: false,
        }
    }

    pub fn alpha(&self) -> Option<f64> {
        match self {
            RateVariation::Homogeneous => None,
            RateVariation::Gamma { alpha, .. } | RateVariation::AutoGamma { alpha, .. } => {
                Some(*alpha)
            }
        }
    }

    pub fn rho(&self) -> Option<f64> {
        match self {
            RateVariation::AutoGamma { rho, .. } => Some(*rho),
            _ => None,
        }
    }

    fn free_alpha(&self) -> bool {
        match self {
            RateVariation::Homogeneous => false,
            RateVariation::Gamma { fix_alpha, .. } | RateVariation::AutoGamma { fix_alpha, .. } => {
                !fix_alpha
            }
        }
    }

    fn free_rho(&self) -> bool {
        matches!(self, RateVariation::AutoGamma { fix_rho: false, .. })
    }
}

/// Everything that selects and configures the model fitted by the engine. Stays fixed during
/// an optimisation run.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub model: SubstModelKind,
    /// Starting (or fixed) rate parameters, without `omega` for codon models.
    pub rate_params: Option<Vec<f64>>,
    pub fix_rate_params: bool,
    /// `None` picks [`FrequencyMode::Model`] when the model prescribes frequencies and
    /// [`FrequencyMode::Empirical`] otherwise.
    pub freq_mode: Option<FrequencyMode>,
    /// dN/dS model, required for codon models and absent otherwise.
    pub selection: Option<SelectionModel>,
    pub selection_params: Option<Vec<f64>>,
    /// Keeps the last selection ratio (`omega`, `omega2`, ...) at its starting value.
    pub fix_omega: bool,
    pub rate_variation: RateVariation,
    pub fix_branch_lengths: bool,
    /// Relative rates of the genes, the first one is 1.
    pub gene_rates: Option<Vec<f64>>,
    pub fix_gene_rates: bool,
    pub scale_threshold: f64,
}

impl Display for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.model)?;
        if let Some(selection) = &self.selection {
            write!(f, ", {}", selection)?;
        }
        match self.rate_variation {
            RateVariation::Homogeneous => {}
            RateVariation::Gamma { categories, .. } => write!(f, ", +G{}", categories)?,
            RateVariation::AutoGamma { categories, .. } => write!(f, ", +AG{}", categories)?,
        }
        write!(f, ", {} frequencies", self.freq_mode())
    }
}

impl ModelDescriptor {
    pub fn new(model: SubstModelKind) -> Self {
        let selection = model.has_omega().then_some(SelectionModel::OneRatio);
        Self {
            model,
            rate_params: None,
            fix_rate_params: false,
            freq_mode: None,
            selection,
            selection_params: None,
            fix_omega: false,
            rate_variation: RateVariation::Homogeneous,
            fix_branch_lengths: false,
            gene_rates: None,
            fix_gene_rates: false,
            scale_threshold: crate::likelihood::DEFAULT_SCALE_THRESHOLD,
        }
    }

    pub fn with_rate_params(mut self, params: Vec<f64>) -> Self {
        self.rate_params = Some(params);
        self
    }

    pub fn with_fixed_rate_params(mut self, params: Vec<f64>) -> Self {
        self.rate_params = Some(params);
        self.fix_rate_params = true;
        self
    }

    pub fn with_freq_mode(mut self, mode: FrequencyMode) -> Self {
        self.freq_mode = Some(mode);
        self
    }

    pub fn with_selection(mut self, selection: SelectionModel) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_selection_params(mut self, params: Vec<f64>) -> Self {
        self.selection_params = Some(params);
        self
    }

    /// Fixes the last selection ratio; its value is taken from the selection parameters.
    pub fn with_fixed_omega(mut self) -> Self {
        self.fix_omega = true;
        self
    }

    pub fn with_rate_variation(mut self, rate_variation: RateVariation) -> Self {
        self.rate_variation = rate_variation;
        self
    }

    pub fn with_fixed_branch_lengths(mut self) -> Self {
        self.fix_branch_lengths = true;
        self
    }

    pub fn with_gene_rates(mut self, rates: Vec<f64>, fixed: bool) -> Self {
        self.gene_rates = Some(rates);
        self.fix_gene_rates = fixed;
        self
    }

    pub fn with_scale_threshold(mut self, threshold: f64) -> Self {
        self.scale_threshold = threshold;
        self
    }

    pub fn freq_mode(&self) -> FrequencyMode {
        match &self.freq_mode {
            Some(mode) => mode.clone(),
            None if self.model.model_freqs().is_some() || !self.model.has_free_freqs() => {
                FrequencyMode::Model
            }
            None => FrequencyMode::Empirical,
        }
    }

    /// Number of rate parameters of the substitution model proper; the selection ratio of codon
    /// models belongs to the selection parameters.
    pub fn n_rate_params(&self) -> usize {
        self.model.param_count() - usize::from(self.model.has_omega())
    }

    /// Site classes of the selection model, 1 when there is none.
    pub fn n_site_classes(&self) -> usize {
        match self.selection {
            None => 1,
            // classes 2a and 2b split the third proportion
            Some(SelectionModel::BranchSiteA) => 4,
            Some(s) => s.n_proportions() + 1,
        }
    }

    /// Number of entries of the parameter vector for this model on `info`.
    pub fn parameter_count(&self, info: &PhyloInfo) -> Result<usize> {
        Ok(ParameterLayout::new(self, info)?.len())
    }

    /// Checks the descriptor against itself and the data.
    pub fn validate(&self, info: &PhyloInfo) -> Result<()> {
        self.model.check_alphabet(info.alphabet())?;
        match (self.model.has_omega(), &self.selection) {
            (true, None) => bail!(ModelError::ModelConfiguration(format!(
                "The {} model needs a selection model",
                self.model
            ))),
            (false, Some(selection)) => bail!(ModelError::ModelConfiguration(format!(
                "The {} selection model only applies to codon models, not {}",
                selection, self.model
            ))),
            _ => {}
        }
        if let Some(SelectionModel::Discrete(0)) = self.selection {
            bail!(ModelError::ModelConfiguration(
                "The discrete selection model needs at least one class".to_string()
            ));
        }
        if self.n_site_classes() > 1 && self.rate_variation != RateVariation::Homogeneous {
            bail!(ModelError::ModelConfiguration(format!(
                "Gamma rate variation cannot be combined with the site classes of {}",
                self.selection.map_or(String::new(), |s| s.to_string())
            )));
        }
        self.validate_rate_variation()?;
        if let Some(params) = &self.rate_params {
            if params.len() != self.n_rate_params() {
                bail!(ModelError::ModelConfiguration(format!(
                    "The {} model takes {} rate parameters, got {}",
                    self.model,
                    self.n_rate_params(),
                    params.len()
                )));
            }
        }
        if let (Some(selection), Some(params)) = (&self.selection, &self.selection_params) {
            let n_labels = info.tree.n_branch_labels();
            if params.len() != selection.param_count(n_labels) {
                bail!(ModelError::ModelConfiguration(format!(
                    "The {} model takes {} parameters, got {}",
                    selection,
                    selection.param_count(n_labels),
                    params.len()
                )));
            }
        }
        if self.fix_omega && self.selection.is_none() {
            bail!(ModelError::ModelConfiguration(
                "Cannot fix omega without a selection model".to_string()
            ));
        }
        if let Some(rates) = &self.gene_rates {
            if rates.len() != info.patterns.n_genes() {
                bail!(ModelError::ModelConfiguration(format!(
                    "Got {} gene rates for {} genes",
                    rates.len(),
                    info.patterns.n_genes()
                )));
            }
            if let Some(r) = rates.iter().find(|r| !(**r > 0.0 && r.is_finite())) {
                bail!(ModelError::ModelConfiguration(format!(
                    "Gene rates must be positive, got {}",
                    r
                )));
            }
        }
        self.validate_freq_mode(info)
    }

    fn validate_rate_variation(&self) -> Result<()> {
        let (categories, alpha, rho) = match self.rate_variation {
            RateVariation::Homogeneous => return Ok(()),
            RateVariation::Gamma {
                alpha, categories, ..
            } => (categories, alpha, 0.0),
            RateVariation::AutoGamma {
                alpha,
                rho,
                categories,
                ..
            } => (categories, alpha, rho),
        };
        if categories == 0 {
            bail!(ModelError::ModelConfiguration(
                "Gamma rate variation needs at least one category".to_string()
            ));
        }
        if !(alpha > 0.0 && alpha.is_finite()) {
            bail!(ModelError::ModelConfiguration(format!(
                "Gamma shape must be positive, got {}",
                alpha
            )));
        }
        if !(0.0..1.0).contains(&rho) {
            bail!(ModelError::ModelConfiguration(format!(
                "Rate correlation must lie in [0, 1), got {}",
                rho
            )));
        }
        Ok(())
    }

    fn validate_freq_mode(&self, info: &PhyloInfo) -> Result<()> {
        let mode = self.freq_mode();
        if !self.model.has_free_freqs() && mode != FrequencyMode::Model {
            bail!(ModelError::ModelConfiguration(format!(
                "The {} model prescribes its frequencies, {} frequencies cannot be used",
                self.model, mode
            )));
        }
        match &mode {
            FrequencyMode::Model if self.model.has_free_freqs() && self.model.model_freqs().is_none() => {
                bail!(ModelError::ModelConfiguration(format!(
                    "The {} model does not prescribe frequencies",
                    self.model
                )))
            }
            FrequencyMode::F1x4 | FrequencyMode::F3x4 if !matches!(info.alphabet(), Alphabet::Codon(_)) => {
                bail!(ModelError::ModelConfiguration(format!(
                    "{} frequencies need codon data",
                    mode
                )))
            }
            FrequencyMode::Fixed(freqs) => validate_freqs(freqs, self.model.n_states()),
            _ => Ok(()),
        }
    }

    /// Starting frequencies; the only frequencies unless they are estimated.
    pub fn initial_freqs(&self, info: &PhyloInfo) -> Result<FreqVector> {
        let n = self.model.n_states();
        let freqs = match self.freq_mode() {
            FrequencyMode::Equal => FreqVector::from_element(n, 1.0 / n as f64),
            FrequencyMode::Empirical | FrequencyMode::Estimated => info.freqs(),
            FrequencyMode::F1x4 | FrequencyMode::F3x4 => {
                let (Some(code), Some(pos)) = (self.model.genetic_code(), info.codon_position_freqs())
                else {
                    bail!(ModelError::ModelConfiguration(
                        "Codon frequencies need codon data".to_string()
                    ));
                };
                if self.freq_mode() == FrequencyMode::F1x4 {
                    let pooled = FreqVector::from_fn(4, |j, _| pos.column(j).sum() / 3.0);
                    codon_freqs_f1x4(code, &pooled)?
                } else {
                    codon_freqs_f3x4(code, &pos)
                }
            }
            FrequencyMode::Fixed(freqs) => freqs,
            // models without prescribed frequencies derive them from the rates
            FrequencyMode::Model => self
                .model
                .model_freqs()
                .unwrap_or_else(|| FreqVector::from_element(n, 1.0 / n as f64)),
        };
        validate_freqs(&freqs, n)?;
        Ok(freqs)
    }
}

/// All values of a model in direct form, fixed ones included.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelValues {
    /// Branch length above every node, indexed by arena index; the root entry is unused.
    pub blens: Vec<f64>,
    pub gene_rates: Vec<f64>,
    pub rate_params: Vec<f64>,
    pub selection_params: Vec<f64>,
    pub freqs: FreqVector,
    pub alpha: Option<f64>,
    pub rho: Option<f64>,
}

impl ModelValues {
    /// Starting values from the descriptor, the tree and the data.
    pub fn initial(descriptor: &ModelDescriptor, info: &PhyloInfo) -> Result<Self> {
        let n_labels = info.tree.n_branch_labels();
        let mut rate_params = descriptor.model.default_params();
        if descriptor.model.has_omega() {
            rate_params.pop();
        }
        Ok(Self {
            blens: info.tree.nodes.iter().map(|n| n.blen).collect(),
            gene_rates: descriptor
                .gene_rates
                .clone()
                .unwrap_or_else(|| vec![1.0; info.patterns.n_genes()]),
            rate_params: descriptor.rate_params.clone().unwrap_or(rate_params),
            selection_params: match (&descriptor.selection, &descriptor.selection_params) {
                (_, Some(params)) => params.clone(),
                (Some(selection), None) => selection.default_params(n_labels),
                (None, None) => Vec::new(),
            },
            freqs: descriptor.initial_freqs(info)?,
            alpha: descriptor.rate_variation.alpha(),
            rho: descriptor.rate_variation.rho(),
        })
    }
}

/// Offsets of the parameter blocks in the parameter vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offsets {
    pub branches: Range<usize>,
    pub gene_rates: Range<usize>,
    pub rate_params: Range<usize>,
    pub selection: Range<usize>,
    pub freqs: Range<usize>,
    pub alpha: Option<usize>,
    pub rho: Option<usize>,
}

/// Maps between [`ModelValues`] and the flat parameter vector seen by the optimiser.
///
/// Block order: branch lengths, gene rates (all genes but the first), rate parameters,
/// selection parameters (proportions first), frequencies (all states but the last), alpha, rho.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterLayout {
    offsets: Offsets,
    /// Nodes sharing each branch length parameter.
    branch_groups: Vec<Vec<NodeIdx>>,
    n_proportions: usize,
    selection_kinds: Vec<OmegaKind>,
    names: Vec<String>,
    len: usize,
}

impl ParameterLayout {
    pub fn new(descriptor: &ModelDescriptor, info: &PhyloInfo) -> Result<Self> {
        let tree = &info.tree;
        let n_labels = tree.n_branch_labels();
        let mut names = Vec::new();

        let branch_groups = if descriptor.fix_branch_lengths {
            Vec::new()
        } else {
            Self::group_branches(tree, descriptor)
        };
        for group in &branch_groups {
            names.push(match group.as_slice() {
                [single] => Self::branch_name(tree, single),
                _ => "t_root".to_string(),
            });
        }
        let branches = 0..names.len();

        let n_genes = info.patterns.n_genes();
        if !descriptor.fix_gene_rates {
            names.extend((1..n_genes).map(|g| format!("rate_gene{}", g)));
        }
        let gene_rates = branches.end..names.len();

        if !descriptor.fix_rate_params {
            let model_names = descriptor.model.param_names();
            names.extend(model_names.into_iter().take(descriptor.n_rate_params()));
        }
        let rate_params = gene_rates.end..names.len();

        let (n_proportions, selection_kinds) = match &descriptor.selection {
            Some(selection) => {
                let mut count = selection.param_count(n_labels);
                if descriptor.fix_omega {
                    count -= 1;
                }
                names.extend(selection.param_names(n_labels).into_iter().take(count));
                let kinds = selection
                    .omega_kinds(n_labels)
                    .into_iter()
                    .take(count - selection.n_proportions())
                    .collect();
                (selection.n_proportions(), kinds)
            }
            None => (0, Vec::new()),
        };
        let selection = rate_params.end..names.len();

        if descriptor.freq_mode() == FrequencyMode::Estimated {
            let alphabet = info.alphabet();
            let n = descriptor.model.n_states();
            names.extend((0..n - 1).map(|s| format!("pi_{}", alphabet.state_label(s))));
        }
        let freqs = selection.end..names.len();

        let alpha = descriptor.rate_variation.free_alpha().then(|| {
            names.push("alpha".to_string());
            names.len() - 1
        });
        let rho = descriptor.rate_variation.free_rho().then(|| {
            names.push("rho".to_string());
            names.len() - 1
        });

        let len = names.len();
        info!(
            "Parameter layout of {}: {} parameters ({} branch lengths)",
            descriptor,
            len,
            branches.len()
        );
        Ok(Self {
            offsets: Offsets {
                branches,
                gene_rates,
                rate_params,
                selection,
                freqs,
                alpha,
                rho,
            },
            branch_groups,
            n_proportions,
            selection_kinds,
            names,
            len,
        })
    }

    /// One group per branch in preorder; under a reversible model the two branches of a
    /// bifurcating root only enter through their sum and share one parameter, unless their
    /// branch labels select different rate matrices.
    fn group_branches(tree: &Tree, descriptor: &ModelDescriptor) -> Vec<Vec<NodeIdx>> {
        let root_children = tree.children(&tree.root);
        let labelled = descriptor
            .selection
            .is_some_and(|selection| selection.uses_branch_labels());
        let same_matrix = !labelled
            || root_children
                .iter()
                .all(|c| tree.branch_label(c) == tree.branch_label(&root_children[0]));
        let merged = descriptor.model.is_reversible() && root_children.len() == 2 && same_matrix;
        let mut groups = Vec::new();
        for idx in tree.branches() {
            if merged && idx == root_children[1] {
                continue;
            }
            if merged && idx == root_children[0] {
                groups.push(root_children.to_vec());
            } else {
                groups.push(vec![idx]);
            }
        }
        groups
    }

    fn branch_name(tree: &Tree, idx: &NodeIdx) -> String {
        let id = tree.node_id(idx);
        if id.is_empty() {
            format!("t_{}", usize::from(idx))
        } else {
            format!("t_{}", id)
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn offsets(&self) -> &Offsets {
        &self.offsets
    }

    pub fn branch_groups(&self) -> &[Vec<NodeIdx>] {
        &self.branch_groups
    }

    fn proportions(&self) -> Range<usize> {
        let start = self.offsets.selection.start;
        start..start + self.n_proportions.min(self.offsets.selection.len())
    }

    /// Box constraints of every entry.
    pub fn bounds(&self, phase: Phase) -> Vec<(f64, f64)> {
        let simplex = match phase {
            Phase::Optimising => (-LOG_RATIO_BOUND, LOG_RATIO_BOUND),
            Phase::Final => (0.0, 1.0),
        };
        let mut bounds = vec![BRANCH_BOUNDS; self.offsets.branches.len()];
        bounds.extend(vec![RATE_BOUNDS; self.offsets.gene_rates.len()]);
        bounds.extend(vec![RATE_BOUNDS; self.offsets.rate_params.len()]);
        bounds.extend(vec![simplex; self.proportions().len()]);
        bounds.extend(self.selection_kinds.iter().map(|kind| match kind {
            OmegaKind::Purifying => (1e-6, 1.0),
            OmegaKind::Positive => (1.0, 999.0),
            OmegaKind::Free => RATE_BOUNDS,
        }));
        bounds.extend(vec![simplex; self.offsets.freqs.len()]);
        if self.offsets.alpha.is_some() {
            bounds.push(ALPHA_BOUNDS);
        }
        if self.offsets.rho.is_some() {
            bounds.push(RHO_BOUNDS);
        }
        debug_assert_eq!(bounds.len(), self.len);
        bounds
    }

    /// Parameter vector of `values` in the form of `phase`.
    pub fn pack(&self, values: &ModelValues, phase: Phase) -> Result<Vec<f64>> {
        let mut x = Vec::with_capacity(self.len);
        x.extend(
            self.branch_groups
                .iter()
                .map(|group| group.iter().map(|idx| values.blens[usize::from(idx)]).sum::<f64>()),
        );
        x.extend(values.gene_rates.iter().skip(1).take(self.offsets.gene_rates.len()));
        x.extend(values.rate_params.iter().take(self.offsets.rate_params.len()));
        x.extend(values.selection_params.iter().take(self.offsets.selection.len()));
        x.extend(values.freqs.iter().take(self.offsets.freqs.len()));
        if self.offsets.alpha.is_some() {
            x.extend(values.alpha);
        }
        if self.offsets.rho.is_some() {
            x.extend(values.rho);
        }
        if x.len() != self.len {
            bail!(ModelError::ModelStateInconsistency(format!(
                "Model values fill {} parameters, the layout has {}",
                x.len(),
                self.len
            )));
        }
        match phase {
            Phase::Final => Ok(x),
            Phase::Optimising => self.convert(&x, Phase::Final, Phase::Optimising),
        }
    }

    /// Model values from the parameter vector `x`; entries not in the vector are taken from
    /// `template`.
    pub fn unpack(&self, x: &[f64], phase: Phase, template: &ModelValues) -> Result<ModelValues> {
        self.check_len(x)?;
        if let Some(v) = x.iter().find(|v| !v.is_finite()) {
            bail!(ModelError::ModelConfiguration(format!(
                "Parameter vector has a non-finite entry {}",
                v
            )));
        }
        let x = match phase {
            Phase::Final => x.to_vec(),
            Phase::Optimising => self.convert(x, Phase::Optimising, Phase::Final)?,
        };
        let mut values = template.clone();
        for (group, t) in self.branch_groups.iter().zip(&x[self.offsets.branches.clone()]) {
            let share = t / group.len() as f64;
            for idx in group {
                values.blens[usize::from(idx)] = share;
            }
        }
        for (g, r) in x[self.offsets.gene_rates.clone()].iter().enumerate() {
            values.gene_rates[g + 1] = *r;
        }
        values.rate_params[..self.offsets.rate_params.len()]
            .copy_from_slice(&x[self.offsets.rate_params.clone()]);
        values.selection_params[..self.offsets.selection.len()]
            .copy_from_slice(&x[self.offsets.selection.clone()]);
        if !self.offsets.freqs.is_empty() {
            let head = &x[self.offsets.freqs.clone()];
            let last = 1.0 - head.iter().sum::<f64>();
            if last < -FREQ_TOLERANCE {
                bail!(ModelError::ModelConfiguration(format!(
                    "Frequencies sum to {}, more than 1",
                    1.0 - last
                )));
            }
            let mut freqs = head.to_vec();
            freqs.push(last.max(0.0));
            values.freqs = FreqVector::from_vec(freqs);
        }
        if let Some(i) = self.offsets.alpha {
            values.alpha = Some(x[i]);
        }
        if let Some(i) = self.offsets.rho {
            values.rho = Some(x[i]);
        }
        Ok(values)
    }

    /// Rewrites `x` from the form of phase `from` into the form of phase `to`.
    pub fn convert(&self, x: &[f64], from: Phase, to: Phase) -> Result<Vec<f64>> {
        self.check_len(x)?;
        let mut y = x.to_vec();
        if from == to {
            return Ok(y);
        }
        for block in [self.proportions(), self.offsets.freqs.clone()] {
            if block.is_empty() {
                continue;
            }
            let converted = match to {
                Phase::Final => from_log_ratios(&x[block.clone()]),
                Phase::Optimising => to_log_ratios(&x[block.clone()])?,
            };
            y[block].copy_from_slice(&converted);
        }
        Ok(y)
    }

    fn check_len(&self, x: &[f64]) -> Result<()> {
        if x.len() != self.len {
            bail!(ModelError::ModelStateInconsistency(format!(
                "Parameter vector has {} entries, the layout has {}",
                x.len(),
                self.len
            )));
        }
        Ok(())
    }
}

/// `x_i = ln(p_i / p_last)` where `p_last = 1 - sum(p)`, clamped to the log-ratio bound.
fn to_log_ratios(p: &[f64]) -> Result<Vec<f64>> {
    let last = 1.0 - p.iter().sum::<f64>();
    if last < -FREQ_TOLERANCE {
        bail!(ModelError::ModelConfiguration(format!(
            "Proportions {:?} sum to more than 1",
            p
        )));
    }
    Ok(p.iter()
        .map(|&pi| {
            if pi <= 0.0 {
                -LOG_RATIO_BOUND
            } else if last <= 0.0 {
                LOG_RATIO_BOUND
            } else {
                (pi / last).ln().clamp(-LOG_RATIO_BOUND, LOG_RATIO_BOUND)
            }
        })
        .collect())
}

/// `p_i = exp(x_i) / (1 + sum(exp(x)))`.
fn from_log_ratios(x: &[f64]) -> Vec<f64> {
    let shift = x.iter().copied().fold(0.0, f64::max);
    let denominator = (-shift).exp() + x.iter().map(|v| (v - shift).exp()).sum::<f64>();
    x.iter().map(|v| (v - shift).exp() / denominator).collect()
}
