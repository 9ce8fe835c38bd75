use std::fmt::Display;

use anyhow::bail;
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::errors::ModelError;
use crate::patterns::SitePatterns;
use crate::Result;

mod gamma;
pub use gamma::*;

/// One component of a site mixture.
#[derive(Clone, Debug, PartialEq)]
pub struct Category {
    pub weight: f64,
    /// Multiplier of all branch lengths.
    pub rate: f64,
    /// Nonsynonymous/synonymous rate ratio per branch label, empty outside site-class models.
    pub omegas: Vec<f64>,
}

/// Finite mixture of site categories, optionally correlated along the sequence through a
/// Markov chain over the categories.
#[derive(Clone, Debug, PartialEq)]
pub struct CategoryMixture {
    pub categories: Vec<Category>,
    /// Row-stochastic transition matrix between the categories of neighbouring sites.
    pub transition: Option<DMatrix<f64>>,
}

impl CategoryMixture {
    /// Homogeneous model.
    pub fn single() -> Self {
        Self {
            categories: vec![Category {
                weight: 1.0,
                rate: 1.0,
                omegas: vec![],
            }],
            transition: None,
        }
    }

    pub fn gamma(alpha: f64, k: usize, method: GammaMethod) -> Result<Self> {
        let rates = discrete_gamma(alpha, k, method)?;
        let weight = 1.0 / k as f64;
        Ok(Self {
            categories: rates
                .into_iter()
                .map(|rate| Category {
                    weight,
                    rate,
                    omegas: vec![],
                })
                .collect(),
            transition: None,
        })
    }

    /// Discrete gamma where the category of a site depends on the category of the previous
    /// site: `M = rho * I + (1 - rho) * 1 f^T`.
    pub fn auto_gamma(alpha: f64, rho: f64, k: usize, method: GammaMethod) -> Result<Self> {
        if !(0.0..1.0).contains(&rho) {
            bail!(ModelError::ModelConfiguration(format!(
                "Rate correlation must lie in [0, 1), got {}",
                rho
            )));
        }
        let mut mixture = Self::gamma(alpha, k, method)?;
        let freqs = DVector::from_iterator(k, mixture.categories.iter().map(|c| c.weight));
        let transition = DMatrix::from_fn(k, k, |i, j| {
            let stay = if i == j { rho } else { 0.0 };
            stay + (1.0 - rho) * freqs[j]
        });
        mixture.transition = Some(transition);
        Ok(mixture)
    }

    pub fn site_classes(categories: Vec<Category>) -> Result<Self> {
        if categories.is_empty() {
            bail!(ModelError::ModelConfiguration(
                "Site-class model without classes".to_string()
            ));
        }
        if let Some(c) = categories.iter().find(|c| !(c.weight >= 0.0)) {
            bail!(ModelError::ModelConfiguration(format!(
                "Site-class proportions must be non-negative, got {}",
                c.weight
            )));
        }
        let total: f64 = categories.iter().map(|c| c.weight).sum();
        if (total - 1.0).abs() > 1e-8 {
            bail!(ModelError::ModelConfiguration(format!(
                "Site-class proportions sum to {}, not 1",
                total
            )));
        }
        Ok(Self {
            categories,
            transition: None,
        })
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.categories.iter().map(|c| c.weight).collect()
    }

    pub fn rates(&self) -> Vec<f64> {
        self.categories.iter().map(|c| c.rate).collect()
    }

    fn check(&self, site_logl: &[DVector<f64>], patterns: &SitePatterns) -> Result<()> {
        if site_logl.len() != self.len() {
            bail!(ModelError::ModelStateInconsistency(format!(
                "Got site likelihoods for {} categories, the mixture has {}",
                site_logl.len(),
                self.len()
            )));
        }
        if let Some(values) = site_logl
            .iter()
            .find(|v| v.len() != patterns.n_patterns())
        {
            bail!(ModelError::ModelStateInconsistency(format!(
                "Got {} pattern likelihoods, expected {}",
                values.len(),
                patterns.n_patterns()
            )));
        }
        Ok(())
    }

    fn site_order<'p>(&self, patterns: &'p SitePatterns) -> Result<&'p [usize]> {
        match patterns.site_order() {
            Some(order) => Ok(order),
            None => bail!(ModelError::ModelConfiguration(
                "Correlated rates need the order of the sites along the alignment".to_string()
            )),
        }
    }

    /// Category likelihoods of one pattern divided by their maximum, and the log of that maximum.
    fn relative_likelihoods(site_logl: &[DVector<f64>], pattern: usize) -> (DVector<f64>, f64) {
        let max = site_logl
            .iter()
            .map(|v| v[pattern])
            .fold(f64::NEG_INFINITY, f64::max);
        let values = DVector::from_iterator(
            site_logl.len(),
            site_logl.iter().map(|v| (v[pattern] - max).exp()),
        );
        (values, max)
    }

    /// Total log-likelihood from the per-category pattern log-likelihoods
    /// (`site_logl[k][p]`).
    pub fn log_likelihood(&self, site_logl: &[DVector<f64>], patterns: &SitePatterns) -> Result<f64> {
        self.check(site_logl, patterns)?;
        let weights = patterns.weights();
        if self.len() == 1 {
            return Ok(site_logl[0].iter().zip(weights).map(|(l, w)| l * w).sum());
        }
        match &self.transition {
            None => Ok(self
                .pattern_log_likelihoods(site_logl)
                .iter()
                .zip(weights)
                .map(|(l, w)| l * w)
                .sum()),
            Some(transition) => {
                let order = self.site_order(patterns)?;
                let (_, log_scales) = self.forward(transition, site_logl, order);
                Ok(log_scales.iter().sum::<f64>())
            }
        }
    }

    /// Log-likelihood of every pattern under the independent mixture.
    pub fn pattern_log_likelihoods(&self, site_logl: &[DVector<f64>]) -> DVector<f64> {
        let n_patterns = site_logl.first().map_or(0, |v| v.len());
        DVector::from_fn(n_patterns, |p, _| {
            let (relative, max) = Self::relative_likelihoods(site_logl, p);
            let mixed: f64 = self
                .categories
                .iter()
                .zip(relative.iter())
                .map(|(c, l)| c.weight * l)
                .sum();
            mixed.ln() + max
        })
    }

    /// Normalised forward variables and the log normalising constant of every site.
    fn forward(
        &self,
        transition: &DMatrix<f64>,
        site_logl: &[DVector<f64>],
        order: &[usize],
    ) -> (Vec<DVector<f64>>, Vec<f64>) {
        let start = DVector::from_vec(self.weights());
        let mut alphas = Vec::with_capacity(order.len());
        let mut log_scales = Vec::with_capacity(order.len());
        for (site, &pattern) in order.iter().enumerate() {
            let (relative, max) = Self::relative_likelihoods(site_logl, pattern);
            let prior = if site == 0 {
                start.clone()
            } else {
                transition.tr_mul(&alphas[site - 1])
            };
            let mut alpha = prior.component_mul(&relative);
            let scale = alpha.sum();
            alpha /= scale;
            alphas.push(alpha);
            log_scales.push(scale.ln() + max);
        }
        (alphas, log_scales)
    }

    /// Posterior probabilities of the categories. Rows are patterns for independent mixtures
    /// and sites (in alignment order) for correlated ones.
    pub fn posteriors(
        &self,
        site_logl: &[DVector<f64>],
        patterns: &SitePatterns,
    ) -> Result<DMatrix<f64>> {
        self.check(site_logl, patterns)?;
        let k = self.len();
        match &self.transition {
            None => {
                let n_patterns = patterns.n_patterns();
                let mut posteriors = DMatrix::zeros(n_patterns, k);
                for p in 0..n_patterns {
                    let (relative, _) = Self::relative_likelihoods(site_logl, p);
                    let joint = DVector::from_iterator(
                        k,
                        self.categories.iter().zip(relative.iter()).map(|(c, l)| c.weight * l),
                    );
                    let total = joint.sum();
                    posteriors.set_row(p, &(joint / total).transpose());
                }
                Ok(posteriors)
            }
            Some(transition) => {
                let order = self.site_order(patterns)?;
                let (alphas, _) = self.forward(transition, site_logl, order);
                let n_sites = order.len();
                let mut posteriors = DMatrix::zeros(n_sites, k);
                let mut beta = DVector::from_element(k, 1.0);
                for site in (0..n_sites).rev() {
                    let mut posterior = alphas[site].component_mul(&beta);
                    posterior /= posterior.sum();
                    posteriors.set_row(site, &posterior.transpose());
                    if site > 0 {
                        let (relative, _) = Self::relative_likelihoods(site_logl, order[site]);
                        let mut next = transition * relative.component_mul(&beta);
                        next /= next.sum();
                        beta = next;
                    }
                }
                Ok(posteriors)
            }
        }
    }
}

/// dN/dS models built from site classes and branch labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectionModel {
    /// One omega for all sites and branches.
    OneRatio,
    /// One omega per branch label.
    BranchRatios,
    /// M1a: a class with omega0 < 1 and a neutral class.
    NearlyNeutral,
    /// M2a: M1a plus a class with omega2 > 1.
    PositiveSelection,
    /// M3: `k` classes with free proportions and omegas.
    Discrete(usize),
    /// Branch-site model A: classes 2a and 2b switch to omega2 >= 1 on foreground branches
    /// (branch label 1 and above).
    BranchSiteA,
}

impl Display for SelectionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionModel::OneRatio => write!(f, "one-ratio"),
            SelectionModel::BranchRatios => write!(f, "branch ratios"),
            SelectionModel::NearlyNeutral => write!(f, "M1a (nearly neutral)"),
            SelectionModel::PositiveSelection => write!(f, "M2a (positive selection)"),
            SelectionModel::Discrete(k) => write!(f, "M3 (discrete, {} classes)", k),
            SelectionModel::BranchSiteA => write!(f, "branch-site model A"),
        }
    }
}

/// Admissible range of a selection parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OmegaKind {
    /// Purifying selection, `(0, 1)`.
    Purifying,
    /// Positive selection, `(1, inf)`.
    Positive,
    Free,
}

impl SelectionModel {
    /// Number of leading selection parameters that are class proportions. Together with the
    /// implied last proportion they form one simplex.
    pub fn n_proportions(&self) -> usize {
        match self {
            SelectionModel::OneRatio | SelectionModel::BranchRatios => 0,
            SelectionModel::NearlyNeutral => 1,
            SelectionModel::PositiveSelection | SelectionModel::BranchSiteA => 2,
            SelectionModel::Discrete(k) => k.saturating_sub(1),
        }
    }

    /// Whether branches with different labels get different omegas.
    pub fn uses_branch_labels(&self) -> bool {
        matches!(self, SelectionModel::BranchRatios | SelectionModel::BranchSiteA)
    }

    /// Selection ratios following the proportions.
    pub fn omega_kinds(&self, n_labels: usize) -> Vec<OmegaKind> {
        match self {
            SelectionModel::OneRatio => vec![OmegaKind::Free],
            SelectionModel::BranchRatios => vec![OmegaKind::Free; n_labels.max(1)],
            SelectionModel::NearlyNeutral => vec![OmegaKind::Purifying],
            SelectionModel::PositiveSelection | SelectionModel::BranchSiteA => {
                vec![OmegaKind::Purifying, OmegaKind::Positive]
            }
            SelectionModel::Discrete(k) => vec![OmegaKind::Free; *k],
        }
    }

    pub fn param_count(&self, n_labels: usize) -> usize {
        self.n_proportions() + self.omega_kinds(n_labels).len()
    }

    pub fn param_names(&self, n_labels: usize) -> Vec<String> {
        let mut names: Vec<String> = (0..self.n_proportions()).map(|i| format!("p{}", i)).collect();
        match self {
            SelectionModel::OneRatio => names.push("omega".to_string()),
            SelectionModel::BranchRatios => {
                names.extend((0..n_labels.max(1)).map(|l| format!("omega#{}", l)))
            }
            SelectionModel::NearlyNeutral => names.push("omega0".to_string()),
            SelectionModel::PositiveSelection | SelectionModel::BranchSiteA => {
                names.push("omega0".to_string());
                names.push("omega2".to_string());
            }
            SelectionModel::Discrete(k) => names.extend((0..*k).map(|i| format!("omega{}", i))),
        }
        names
    }

    /// Direct-form starting values.
    pub fn default_params(&self, n_labels: usize) -> Vec<f64> {
        let n_classes = self.n_proportions() + 1;
        let mut params = vec![1.0 / n_classes as f64; self.n_proportions()];
        match self {
            SelectionModel::Discrete(k) => {
                params.extend((0..*k).map(|i| 0.2 + 0.6 * i as f64));
            }
            _ => params.extend(self.omega_kinds(n_labels).iter().map(|kind| match kind {
                OmegaKind::Purifying => 0.3,
                OmegaKind::Positive => 2.0,
                OmegaKind::Free => 0.4,
            })),
        }
        params
    }

    /// Site classes from direct-form parameters: proportions then omegas.
    pub fn categories(&self, params: &[f64], n_labels: usize) -> Result<Vec<Category>> {
        let n_labels = n_labels.max(1);
        if params.len() != self.param_count(n_labels) {
            bail!(ModelError::ModelStateInconsistency(format!(
                "The {} model takes {} parameters, got {}",
                self,
                self.param_count(n_labels),
                params.len()
            )));
        }
        let (proportions, omegas) = params.split_at(self.n_proportions());
        let mut weights = proportions.to_vec();
        let last = 1.0 - weights.iter().sum::<f64>();
        if last < -1e-12 {
            bail!(ModelError::ModelConfiguration(format!(
                "Site-class proportions {:?} of the {} model exceed 1",
                proportions, self
            )));
        }
        weights.push(last.max(0.0));
        let class = |weight: f64, omegas: Vec<f64>| Category {
            weight,
            rate: 1.0,
            omegas,
        };
        let categories = match self {
            SelectionModel::OneRatio => vec![class(1.0, vec![omegas[0]; n_labels])],
            SelectionModel::BranchRatios => vec![class(1.0, omegas.to_vec())],
            SelectionModel::NearlyNeutral => vec![
                class(weights[0], vec![omegas[0]; n_labels]),
                class(weights[1], vec![1.0; n_labels]),
            ],
            SelectionModel::PositiveSelection => vec![
                class(weights[0], vec![omegas[0]; n_labels]),
                class(weights[1], vec![1.0; n_labels]),
                class(weights[2], vec![omegas[1]; n_labels]),
            ],
            SelectionModel::Discrete(_) => weights
                .iter()
                .zip(omegas)
                .map(|(w, omega)| class(*w, vec![*omega; n_labels]))
                .collect(),
            SelectionModel::BranchSiteA => {
                let (p0, p1, p2) = (weights[0], weights[1], weights[2]);
                let background = p0 + p1;
                let (share0, share1) = if background > 0.0 {
                    (p0 / background, p1 / background)
                } else {
                    (0.5, 0.5)
                };
                let switched = |bg: f64| {
                    let mut values = vec![omegas[1]; n_labels];
                    values[0] = bg;
                    values
                };
                vec![
                    class(p0, vec![omegas[0]; n_labels]),
                    class(p1, vec![1.0; n_labels]),
                    class(p2 * share0, switched(omegas[0])),
                    class(p2 * share1, switched(1.0)),
                ]
            }
        };
        debug!("{} site classes: {:?}", self, categories);
        Ok(categories)
    }
}
